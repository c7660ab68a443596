//! Device tarball handling.
//!
//! The `device-*.tar.xz` of a release carries the Android partition images
//! under `partitions/`; they are copied flat into the instance directory.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use uemu_error::{ProvisionError, Result};

const PARTITIONS_DIR: &str = "partitions";

pub const BOOT_IMAGE: &str = "boot.img";
pub const RECOVERY_IMAGE: &str = "recovery.img";
pub const SYSTEM_IMAGE: &str = "system.img";

fn is_device_tarball(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("device-") && name.ends_with(".tar.xz"))
        .unwrap_or(false)
}

/// Locate the device tarball among downloaded files.
pub fn find_device_tarball(files: &[PathBuf]) -> Result<&Path> {
    files
        .iter()
        .find(|path| is_device_tarball(path))
        .map(PathBuf::as_path)
        .ok_or_else(|| ProvisionError::catalog("release carries no device tarball"))
}

/// `partitions/<name>` members map to `<name>`; nested paths are ignored.
fn flat_name(member: &Path) -> Option<&std::ffi::OsStr> {
    let mut components = member
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match components.next()? {
        Component::Normal(first) if first == PARTITIONS_DIR => {}
        _ => return None,
    }
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Some(name),
        _ => None,
    }
}

/// Extract every regular file under `partitions/` into `dest_dir`.
///
/// Returns the written paths in archive order.
pub fn flat_extract_images(tarball: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    log::info!(
        "extracting partition images from {} into {}",
        tarball.display(),
        dest_dir.display()
    );
    let file = File::open(tarball)?;
    let mut archive = tar::Archive::new(xz2::read::XzDecoder::new(BufReader::new(file)));

    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry.path()?.into_owned();
        let Some(name) = flat_name(&member) else {
            continue;
        };
        let dest = dest_dir.join(name);
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        log::debug!("{} -> {}", member.display(), dest.display());
        written.push(dest);
    }
    Ok(written)
}

/// Ensure the images the emulator boots from were delivered.
pub fn require_images(dest_dir: &Path, names: &[&str]) -> Result<()> {
    for name in names {
        let path = dest_dir.join(name);
        if !fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
            return Err(ProvisionError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} missing from device tarball", name),
            )));
        }
    }
    Ok(())
}
