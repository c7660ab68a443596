//! Populating a mounted image from release tarballs.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

use super::DiskImage;
use uemu_error::{ProvisionError, Result};

/// Android mount points exposed at the root of the Ubuntu filesystem.
const ANDROID_LINKS: &[&str] = &["cache", "factory", "firmware", "persist", "system"];

pub const WRITABLE_MARKER: &str = ".writable_image";
pub const ADB_ONLOCK: &str = ".adb_onlock";

/// Map a tarball member onto the root filesystem.
///
/// Only `system/` content is installed (with the prefix stripped); `partitions/`
/// and anything else at the top level is skipped.
fn rootfs_relative(path: &Path) -> Option<PathBuf> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match components.next()? {
        Component::Normal(first) if first == "system" => {}
        _ => return None,
    }
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        return None;
    }
    Some(rest)
}

fn reject_escape(rel: &Path, member: &Path) -> Result<()> {
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(ProvisionError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing to extract {} outside the image", member.display()),
        )));
    }
    Ok(())
}

fn unpack_rootfs<R: Read>(reader: R, root: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let member = entry.path()?.into_owned();
        let Some(rel) = rootfs_relative(&member) else {
            continue;
        };
        reject_escape(&rel, &member)?;
        let dest = root.join(&rel);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry.header().entry_type().is_hard_link() {
            // Link targets carry the same system/ prefix as the members.
            let target = entry
                .link_name()?
                .and_then(|name| rootfs_relative(&name))
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("hard link {} has no usable target", member.display()),
                    )
                })?;
            reject_escape(&target, &member)?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            fs::hard_link(root.join(target), &dest)?;
            continue;
        }

        entry.unpack(&dest)?;
    }
    Ok(())
}

/// Extract the `system/` tree of an xz-compressed tarball into `root`.
pub fn extract_rootfs_tarball(tarball: &Path, root: &Path) -> Result<()> {
    log::info!("extracting {} into {}", tarball.display(), root.display());
    let file = File::open(tarball)?;
    unpack_rootfs(xz2::read::XzDecoder::new(BufReader::new(file)), root)
}

/// Create the directories and `/android` links the Ubuntu root expects.
pub fn setup_android_layout(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("android").join("data"))?;
    fs::create_dir_all(root.join("userdata"))?;

    for name in ANDROID_LINKS {
        let link = root.join(name);
        match link.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&link)?,
            Ok(_) => {
                log::debug!("{} exists, not linking it to /android", link.display());
                continue;
            }
            Err(_) => {}
        }
        symlink(Path::new("/android").join(name), &link)?;
    }
    Ok(())
}

impl DiskImage<'_> {
    fn mounted_root(&self, op: &str) -> Result<PathBuf> {
        self.root().ok_or_else(|| {
            ProvisionError::state(format!(
                "cannot {} {} while unmounted",
                op,
                self.path.display()
            ))
        })
    }

    /// Extract each tarball in the given order into the mounted root.
    ///
    /// On failure the image stays mounted so the caller can report the mount
    /// point before cleaning up.
    pub fn provision(&self, tarballs: &[PathBuf]) -> Result<()> {
        let root = self.mounted_root("provision")?;
        let _escalated = self.privileges.escalate()?;
        for tarball in tarballs {
            extract_rootfs_tarball(tarball, &root)?;
        }
        setup_android_layout(&root)
    }

    /// Flag the image as the writable user data area.
    pub fn mark_writable(&self) -> Result<()> {
        let root = self.mounted_root("mark writable")?;
        let _escalated = self.privileges.escalate()?;
        File::create(root.join(WRITABLE_MARKER))?;
        Ok(())
    }

    /// Keep adb usable while the emulated screen is locked.
    pub fn override_adb_inhibit(&self) -> Result<()> {
        let root = self.mounted_root("override adb inhibit on")?;
        let _escalated = self.privileges.escalate()?;
        File::create(root.join(ADB_ONLOCK))?;
        Ok(())
    }
}
