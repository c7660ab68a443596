//! Filesystem formatting operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for creating filesystems on block devices.
pub trait FormatOps {
    /// Format a device with an ext4 filesystem labelled `label`.
    fn format_ext4(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()>;

    /// Format a device with VFAT (FAT32), typically used for boot and sdcard partitions.
    fn format_vfat(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()>;
}

/// Options for formatting operations.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Additional arguments to pass to the format command
    pub extra_args: Vec<String>,
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}
