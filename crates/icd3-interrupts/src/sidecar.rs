//! Sidecar-file convention for out-of-band interrupt delivery (`spec.md` §4.F, §6).
//!
//! A model raises an interrupt by writing `"device_id,interrupt_id"` into a
//! well-known per-PID file and then signalling the driver process. The file
//! is single-writer (the model) and is removed by whichever side consumes
//! it last — here, the dispatcher thread, after it has parsed and acted on
//! the contents.

use std::path::{Path, PathBuf};

/// Path of the interrupt sidecar file for a given PID, matching the
/// `…_interrupt_<pid>` convention named in `spec.md` §6.
pub fn interrupt_sidecar_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/icd3_interrupt_{pid}"))
}

/// Path of the plain PID sidecar file models read to discover the
/// signalling target.
pub fn pid_sidecar_path() -> PathBuf {
    PathBuf::from("/tmp/icd3_interface.pid")
}

/// Parses `"device_id,interrupt_id"` written by a model.
pub fn parse_sidecar(contents: &str) -> Option<(u32, u32)> {
    let mut parts = contents.trim().splitn(2, ',');
    let device_id = parts.next()?.trim().parse().ok()?;
    let interrupt_id = parts.next()?.trim().parse().ok()?;
    Some((device_id, interrupt_id))
}

/// Formats the sidecar payload a model would write.
pub fn format_sidecar(device_id: u32, interrupt_id: u32) -> String {
    format!("{device_id},{interrupt_id}")
}

/// Writes the PID sidecar file at process `init()`.
pub fn write_pid_sidecar(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_device_and_interrupt_id() {
        let s = format_sidecar(3, 0x42);
        assert_eq!(parse_sidecar(&s), Some((3, 0x42)));
    }

    #[test]
    fn tolerates_trailing_whitespace() {
        assert_eq!(parse_sidecar(" 3,66\n"), Some((3, 66)));
    }

    #[test]
    fn rejects_malformed_contents() {
        assert_eq!(parse_sidecar("not-a-pair"), None);
        assert_eq!(parse_sidecar("3"), None);
        assert_eq!(parse_sidecar("x,y"), None);
    }

    #[test]
    fn interrupt_sidecar_path_embeds_pid() {
        let path = interrupt_sidecar_path(1234);
        assert_eq!(path, PathBuf::from("/tmp/icd3_interrupt_1234"));
    }
}
