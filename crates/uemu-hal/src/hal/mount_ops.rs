//! Mount operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/loop3p2`)
    /// * `target` - Mount point path (must exist)
    /// * `fstype` - Filesystem type (e.g., `"ext4"`, `"vfat"`)
    /// * `options` - Mount options
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()>;

    /// Unmount a single filesystem.
    fn unmount(&self, target: &Path) -> HalResult<()>;

    /// Unmount `target` and every mount nested below it, deepest first.
    ///
    /// Every mount is attempted even if an earlier one fails; the first failure is returned.
    fn unmount_recursive(&self, target: &Path) -> HalResult<()>;

    /// Check if a path is currently mounted.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;
}

/// Mount options and flags.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Mount read-only (`MS_RDONLY`).
    pub read_only: bool,
    /// Additional filesystem-specific options as a comma-separated string.
    pub options: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            options: None,
        }
    }

    pub fn with_options(options: impl Into<String>) -> Self {
        Self {
            read_only: false,
            options: Some(options.into()),
        }
    }
}
