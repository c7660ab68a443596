//! Backing-file disk images.
//!
//! A [`DiskImage`] owns one backing file and tracks its partitions, mount state
//! and container format. Lifecycle:
//!
//! ```text
//! New -> Created -> Partitioned -> Formatted -> Mounted <-> Unmounted -> Converted | Moved
//! ```
//!
//! Images that already exist on disk (`ImageRole::Existing`) start out
//! `Unmounted`. Mounting attaches a loop device and mounts every partition at
//! `<tmp>/<subdir>`; a failed mount never leaves the loop device attached.

mod provision;
mod roles;

pub use provision::{extract_rootfs_tarball, setup_android_layout, ADB_ONLOCK, WRITABLE_MARKER};
pub use roles::ImageRole;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::partitioning::{FsKind, Partition, PartitionPlanner};
use crate::privilege::Privileges;
use uemu_error::{HalError, ProvisionError, Result};
use uemu_hal::{
    partition_device, FormatOptions, ImageFormat, LoopGuard, MountGuard, MountOptions, SystemHal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    New,
    Created,
    Partitioned,
    Formatted,
    Mounted,
    Unmounted,
    Converted,
    Moved,
}

#[derive(Debug, Clone)]
struct Mounted {
    base: PathBuf,
    /// `None` once detached while filesystems below `base` are still mounted.
    loop_device: Option<String>,
    read_only: bool,
}

pub struct DiskImage<'a> {
    hal: &'a dyn SystemHal,
    privileges: &'a Privileges,
    path: PathBuf,
    role: ImageRole,
    size: u64,
    parts: Vec<Partition>,
    mount: Option<Mounted>,
    format: ImageFormat,
    state: ImageState,
    scratch_dir: Option<PathBuf>,
}

impl std::fmt::Debug for DiskImage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImage")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("size", &self.size)
            .field("state", &self.state)
            .field("mountpoint", &self.mountpoint())
            .finish()
    }
}

fn mount_error(what: &str, err: HalError) -> ProvisionError {
    ProvisionError::mount(format!("{}: {}", what, err))
}

impl<'a> DiskImage<'a> {
    /// An image still to be created at `path` with `size` bytes.
    pub fn new(
        hal: &'a dyn SystemHal,
        privileges: &'a Privileges,
        path: impl Into<PathBuf>,
        role: ImageRole,
        size: u64,
    ) -> Self {
        Self {
            hal,
            privileges,
            path: path.into(),
            role,
            size,
            parts: Vec::new(),
            mount: None,
            format: ImageFormat::Raw,
            state: ImageState::New,
            scratch_dir: None,
        }
    }

    /// A raw, unpartitioned filesystem image that is already on disk.
    pub fn existing(
        hal: &'a dyn SystemHal,
        privileges: &'a Privileges,
        path: impl Into<PathBuf>,
    ) -> Self {
        let mut img = Self::new(hal, privileges, path, ImageRole::Existing, 0);
        img.size = fs::metadata(&img.path).map(|m| m.len()).unwrap_or(0);
        img.state = ImageState::Unmounted;
        img
    }

    /// Create temporary mount points under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> ImageRole {
        self.role
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.parts
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Base directory under which the partitions are mounted.
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mount.as_ref().map(|m| m.base.as_path())
    }

    /// Directory holding the image's root filesystem while mounted.
    pub fn root(&self) -> Option<PathBuf> {
        let base = self.mountpoint()?;
        Some(match self.role.root_subdir() {
            Some(subdir) => base.join(subdir),
            None => base.to_path_buf(),
        })
    }

    fn expect_state(&self, allowed: &[ImageState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ProvisionError::state(format!(
                "cannot {} {} while {:?}",
                op,
                self.path.display(),
                self.state
            )))
        }
    }

    /// Allocate the sparse backing file.
    pub fn create(&mut self) -> Result<()> {
        self.expect_state(&[ImageState::New], "create")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&self.path)?;
        file.set_len(self.size)?;
        log::debug!("created {} ({} bytes)", self.path.display(), self.size);
        self.state = ImageState::Created;
        Ok(())
    }

    /// Write this role's partition table.
    pub fn partition(&mut self) -> Result<()> {
        self.expect_state(&[ImageState::Created], "partition")?;
        let spec = self.role.partition_spec().ok_or_else(|| {
            ProvisionError::state(format!("{:?} images carry no partition table", self.role))
        })?;
        self.parts = PartitionPlanner::new(self.hal).apply(&self.path, &spec)?;
        self.state = ImageState::Partitioned;
        Ok(())
    }

    /// Create a filesystem on every partition.
    pub fn format_filesystems(&mut self) -> Result<()> {
        self.expect_state(&[ImageState::Partitioned], "format")?;
        let privileges = self.privileges;
        let _escalated = privileges.escalate()?;

        let loop_dev = self
            .hal
            .losetup_attach(&self.path, true, false)
            .map_err(|err| mount_error(&format!("cannot attach {}", self.path.display()), err))?;
        let loop_guard = LoopGuard::new(self.hal, loop_dev);

        let opts = FormatOptions::new();
        for part in &self.parts {
            let device = partition_device(loop_guard.device(), part.number);
            log::info!(
                "formatting {} ({}) as {}",
                device.display(),
                part.label,
                part.fs
            );
            match part.fs {
                FsKind::Ext4 => {
                    self.hal.format_ext4(&device, &part.label, &opts)?
                }
                FsKind::Vfat => {
                    self.hal.format_vfat(&device, &part.label, &opts)?
                }
            }
        }

        let loop_dev = loop_guard.release();
        self.hal.losetup_detach(&loop_dev)?;
        self.state = ImageState::Formatted;
        Ok(())
    }

    /// Create, partition and format in one go.
    pub fn build(&mut self) -> Result<()> {
        self.create()?;
        self.partition()?;
        self.format_filesystems()
    }

    pub fn mount(&mut self) -> Result<()> {
        self.mount_with(false)
    }

    pub fn mount_read_only(&mut self) -> Result<()> {
        self.mount_with(true)
    }

    fn make_mount_base(&self) -> Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("uemu-");
        let dir = match &self.scratch_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        // Removal is handled explicitly and never recursive.
        Ok(dir.keep())
    }

    fn mount_with(&mut self, read_only: bool) -> Result<()> {
        if self.mount.is_some() {
            return Err(ProvisionError::state(format!(
                "{} is already mounted",
                self.path.display()
            )));
        }
        self.expect_state(&[ImageState::Formatted, ImageState::Unmounted], "mount")?;
        let privileges = self.privileges;
        let _escalated = privileges.escalate()?;

        let scan = !self.parts.is_empty();
        let loop_dev = self
            .hal
            .losetup_attach(&self.path, scan, read_only)
            .map_err(|err| mount_error(&format!("cannot attach {}", self.path.display()), err))?;
        let loop_guard = LoopGuard::new(self.hal, loop_dev);

        let base = self.make_mount_base()?;
        if let Err(err) = self.mount_partitions(loop_guard.device(), &base, read_only) {
            drop(loop_guard);
            self.remove_mount_dirs(&base);
            return Err(err);
        }

        log::debug!("mounted {} at {}", self.path.display(), base.display());
        self.mount = Some(Mounted {
            base,
            loop_device: Some(loop_guard.release()),
            read_only,
        });
        self.state = ImageState::Mounted;
        Ok(())
    }

    fn mount_partitions(&self, loop_dev: &str, base: &Path, read_only: bool) -> Result<()> {
        let opts = if read_only {
            MountOptions::read_only()
        } else {
            MountOptions::new()
        };
        let guard = MountGuard::new(self.hal, base);

        if self.parts.is_empty() {
            self.hal
                .mount_device(Path::new(loop_dev), base, self.role.whole_fs_type(), &opts)
                .map_err(|err| mount_error(&format!("cannot mount {}", loop_dev), err))?;
        } else {
            for part in &self.parts {
                let target = base.join(&part.subdir);
                fs::create_dir_all(&target)?;
                let device = partition_device(loop_dev, part.number);
                self.hal
                    .mount_device(&device, &target, part.fs.mount_type(), &opts)
                    .map_err(|err| {
                        mount_error(&format!("cannot mount {}", device.display()), err)
                    })?;
            }
        }

        guard.release();
        Ok(())
    }

    /// Remove the mount point directories without following into anything still mounted.
    fn remove_mount_dirs(&self, base: &Path) {
        for part in &self.parts {
            let dir = base.join(&part.subdir);
            if let Err(err) = fs::remove_dir(&dir) {
                log::debug!("leaving {} in place: {}", dir.display(), err);
            }
        }
        if let Err(err) = fs::remove_dir(base) {
            log::debug!("leaving {} in place: {}", base.display(), err);
        }
    }

    /// Unmount everything and detach the loop device.
    ///
    /// Calling it on an unmounted image is a no-op. Detach is attempted even
    /// when unmounting fails; both failures are reported together. After a
    /// failure the image stays mounted, so a later call (or drop) retries
    /// whatever is left.
    pub fn unmount(&mut self) -> Result<()> {
        if self.mount.is_none() {
            return Ok(());
        }
        let privileges = self.privileges;
        let _escalated = privileges.escalate()?;
        let Some(mut mounted) = self.mount.take() else {
            return Ok(());
        };

        let unmounted = self.hal.unmount_recursive(&mounted.base);
        let detached = match mounted.loop_device.take() {
            Some(dev) => match self.hal.losetup_detach(&dev) {
                Ok(()) => Ok(()),
                Err(err) => {
                    let message = format!("cannot detach {}: {}", dev, err);
                    mounted.loop_device = Some(dev);
                    Err(message)
                }
            },
            None => Ok(()),
        };

        let result = match (unmounted, detached) {
            (Ok(()), Ok(())) => {
                self.remove_mount_dirs(&mounted.base);
                log::debug!(
                    "unmounted {} from {}{}",
                    self.path.display(),
                    mounted.base.display(),
                    if mounted.read_only { " (ro)" } else { "" }
                );
                self.state = ImageState::Unmounted;
                return Ok(());
            }
            (Err(err), Ok(())) => mount_error(
                &format!("cannot unmount {}", mounted.base.display()),
                err,
            ),
            (Ok(()), Err(message)) => ProvisionError::mount(message),
            (Err(unmount_err), Err(message)) => ProvisionError::mount(format!(
                "cannot unmount {}: {}; {}",
                mounted.base.display(),
                unmount_err,
                message
            )),
        };
        self.mount = Some(mounted);
        Err(result)
    }

    /// Replace the raw backing file with a qcow2 conversion of it.
    pub fn convert_to_qcow2(&mut self) -> Result<()> {
        self.expect_state(
            &[ImageState::Formatted, ImageState::Unmounted],
            "convert",
        )?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".uemu-convert-")
            .suffix(".qcow2")
            .tempfile_in(dir)?;

        log::info!("converting {} to qcow2", self.path.display());
        self.hal
            .convert_image(&self.path, tmp.path(), ImageFormat::Raw, ImageFormat::Qcow2)?;
        tmp.persist(&self.path).map_err(|err| err.error)?;

        self.format = ImageFormat::Qcow2;
        self.state = ImageState::Converted;
        Ok(())
    }

    /// Relocate the backing file to `dest`.
    pub fn move_to(&mut self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if self.mount.is_some() {
            return Err(ProvisionError::state(format!(
                "cannot move {} while mounted",
                self.path.display()
            )));
        }
        self.expect_state(
            &[
                ImageState::Created,
                ImageState::Partitioned,
                ImageState::Formatted,
                ImageState::Unmounted,
                ImageState::Converted,
            ],
            "move",
        )?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(&self.path, dest).is_err() {
            // Crossing filesystems; fall back to copy + remove.
            fs::copy(&self.path, dest)?;
            fs::remove_file(&self.path)?;
        }
        log::debug!("moved {} to {}", self.path.display(), dest.display());
        self.path = dest.to_path_buf();
        self.state = ImageState::Moved;
        Ok(())
    }

    /// Copy the first file called `name` found in the image into `dest_dir`.
    ///
    /// Mounts read-only when the image is not mounted yet and restores that
    /// state afterwards.
    pub fn extract_file(&mut self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let privileges = self.privileges;
        let _escalated = privileges.escalate()?;
        let was_mounted = self.mount.is_some();
        if !was_mounted {
            self.mount_read_only()?;
        }

        let copied = self.copy_out(name, dest_dir);

        if !was_mounted {
            if let Err(err) = self.unmount() {
                if copied.is_ok() {
                    return Err(err);
                }
                log::warn!("unmount after failed extraction: {}", err);
            }
        }
        copied
    }

    fn copy_out(&self, name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let root = self
            .root()
            .ok_or_else(|| ProvisionError::state("image is not mounted"))?;
        let found = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found in {}", name, self.path.display()),
                )
            })?;

        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);
        fs::copy(found.path(), &dest)?;
        log::debug!("extracted {} to {}", found.path().display(), dest.display());
        Ok(dest)
    }
}

impl Drop for DiskImage<'_> {
    fn drop(&mut self) {
        if self.mount.is_some() {
            if let Err(err) = self.unmount() {
                log::warn!("failed to unmount {} on drop: {}", self.path.display(), err);
            }
        }
    }
}
