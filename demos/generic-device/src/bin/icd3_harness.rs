//! Manual exercise harness for the generic-device demo driver.
//!
//! Installs the trap engine, registers one generic device at a
//! caller-chosen guest address, runs a fixed sequence of register
//! accesses through it, and logs what happened. Useful for poking the
//! engine by hand against a real `SIGSEGV` path without writing a test —
//! `RUST_LOG=icd3=debug,icd3_trap=trace cargo run --bin icd3-harness`
//! shows the per-fault fallback decisions.

use clap::{Parser, Subcommand};
use icd3_demo_generic_device::GenericDevice;

#[derive(Parser)]
#[command(name = "icd3-harness", about = "Exercise the icd3 MMIO trap engine by hand")]
struct Cli {
    /// Guest base address for the demo device's MMIO window.
    #[arg(long, default_value_t = 0x4400_0000, value_parser = parse_hex_u64)]
    base: u64,

    /// Device id to register the demo device under.
    #[arg(long, default_value_t = 1)]
    device_id: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register the device, enable it, write then read DATA, then tear down.
    Demo,
    /// Read `size` bytes at `address` through the bypass API (no fault taken).
    Read {
        #[arg(value_parser = parse_hex_u64)]
        address: u64,
        #[arg(default_value_t = 4)]
        size: u32,
    },
    /// Write `value` (`size` bytes) at `address` through the bypass API.
    Write {
        #[arg(value_parser = parse_hex_u64)]
        address: u64,
        #[arg(value_parser = parse_hex_u64)]
        value: u64,
        #[arg(default_value_t = 4)]
        size: u32,
    },
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("ICD3_LOG"))
        .init();

    let cli = Cli::parse();
    icd3::init(icd3::Icd3Config::default())?;

    let result = run(&cli);

    // Best-effort teardown regardless of whether `run` succeeded, so a
    // failed harness invocation doesn't leave the PID sidecar behind.
    let _ = icd3::deinit();
    result
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Demo => run_demo(cli.device_id, cli.base),
        Command::Read { address, size } => {
            let value = icd3::read_register(*address, *size)?;
            println!("{value:#x}");
            Ok(())
        }
        Command::Write { address, value, size } => {
            let result = icd3::write_register(*address, *value, *size)?;
            println!("result={}", result.0);
            Ok(())
        }
    }
}

fn run_demo(device_id: u32, base: u64) -> anyhow::Result<()> {
    let mut device = GenericDevice::new(device_id, base);
    device.init()?;
    tracing::info!(base = format_args!("{base:#x}"), "device registered");

    device.enable()?;
    let status = device.status()?;
    tracing::info!(?status, "status after enable");

    device.write_data(0xCAFE_BABE)?;
    let read_back = device.read_data()?;
    tracing::info!(value = format_args!("{read_back:#x}"), "data read back");

    device.disable()?;
    device.deinit()?;
    Ok(())
}
