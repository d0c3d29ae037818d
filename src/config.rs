//! Process configuration for the trap engine singleton.
//!
//! Not part of the spec's core subsystems, but every deployment needs to
//! say which signal carries interrupts and where the PID sidecar lives;
//! `serde`/`serde_json` is the same configuration path the rest of this
//! workspace uses for small, file- or env-supplied structs.

use std::path::PathBuf;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

fn default_model_endpoint() -> String {
    icd3_transport::DEFAULT_MODEL_ENDPOINT.to_string()
}

fn default_pid_sidecar() -> String {
    "/tmp/icd3_driver_interface.pid".to_string()
}

fn default_interrupt_signal() -> String {
    "SIGUSR2".to_string()
}

/// Process-wide configuration, loadable from a JSON file or constructed
/// directly by an embedder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Icd3Config {
    /// Default model endpoint for devices registered without an explicit
    /// one. `spec.md` §6 names `/tmp/icd3_interface` as the conventional path.
    #[serde(default = "default_model_endpoint")]
    pub model_endpoint: String,
    /// Path of the plain-text PID sidecar file, written at `init()` and
    /// removed at `deinit()` (`spec.md` §6).
    #[serde(default = "default_pid_sidecar")]
    pub pid_sidecar_path: String,
    /// Name of the POSIX signal used for interrupt delivery (`spec.md` §4.F).
    #[serde(default = "default_interrupt_signal")]
    pub interrupt_signal: String,
}

impl Default for Icd3Config {
    fn default() -> Self {
        Icd3Config {
            model_endpoint: default_model_endpoint(),
            pid_sidecar_path: default_pid_sidecar(),
            interrupt_signal: default_interrupt_signal(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized interrupt signal name: {0}")]
    UnknownSignal(String),
}

impl Icd3Config {
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn model_endpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.model_endpoint)
    }

    pub fn pid_sidecar(&self) -> PathBuf {
        PathBuf::from(&self.pid_sidecar_path)
    }

    pub fn signal(&self) -> Result<Signal, ConfigError> {
        self.interrupt_signal
            .parse()
            .map_err(|_| ConfigError::UnknownSignal(self.interrupt_signal.clone()))
    }
}
