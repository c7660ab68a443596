//! Disk image container conversion (qemu-img).

use crate::HalResult;
use std::fmt;
use std::path::Path;

/// On-disk container format of a backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ConvertOps {
    /// Convert `src` (in `from` format) into a new file `dst` in `to` format.
    fn convert_image(&self, src: &Path, dst: &Path, from: ImageFormat, to: ImageFormat)
        -> HalResult<()>;
}
