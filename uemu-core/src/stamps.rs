//! Instance stamp files recording what was provisioned.

use std::fs;
use std::path::Path;

use uemu_error::Result;

use crate::config::Arch;

pub const VERSION_STAMP: &str = ".stamp";
pub const DEVICE_STAMP: &str = ".device";

pub fn write_version_stamp(data_dir: &Path, version: u32) -> Result<()> {
    fs::write(data_dir.join(VERSION_STAMP), version.to_string())?;
    Ok(())
}

pub fn write_device_stamp(data_dir: &Path, arch: Arch) -> Result<()> {
    fs::write(data_dir.join(DEVICE_STAMP), arch.as_str())?;
    Ok(())
}

/// Version recorded by a previous run, if any.
pub fn read_version_stamp(data_dir: &Path) -> Option<u32> {
    fs::read_to_string(data_dir.join(VERSION_STAMP))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn read_device_stamp(data_dir: &Path) -> Option<Arch> {
    fs::read_to_string(data_dir.join(DEVICE_STAMP))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stamps_round_trip_through_data_dir() {
        let dir = tempdir().unwrap();
        assert_eq!(read_version_stamp(dir.path()), None);

        write_version_stamp(dir.path(), 42).unwrap();
        write_device_stamp(dir.path(), Arch::Armhf).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join(".stamp")).unwrap(), "42");
        assert_eq!(fs::read_to_string(dir.path().join(".device")).unwrap(), "armhf");
        assert_eq!(read_version_stamp(dir.path()), Some(42));
        assert_eq!(read_device_stamp(dir.path()), Some(Arch::Armhf));
    }
}
