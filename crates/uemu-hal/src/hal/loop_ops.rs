//! Loop device operations (losetup).

use crate::HalResult;
use std::path::{Path, PathBuf};

pub trait LoopOps {
    /// Setup a loop device for the given image, returning the loop path (e.g. `/dev/loop7`).
    ///
    /// If `scan_partitions` is true, the loop device is created with partition scanning (equivalent
    /// to `losetup -P`). If `read_only` is true the device is attached read-only (`losetup -r`).
    fn losetup_attach(&self, image: &Path, scan_partitions: bool, read_only: bool)
        -> HalResult<String>;

    /// Detach a loop device.
    fn losetup_detach(&self, loop_device: &str) -> HalResult<()>;
}

/// Device node of partition `index` (1-based) on a partition-scanned loop device.
pub fn partition_device(loop_device: &str, index: u32) -> PathBuf {
    PathBuf::from(format!("{}p{}", loop_device, index))
}
