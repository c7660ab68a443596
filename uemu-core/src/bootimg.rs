//! Android boot image decomposition.
//!
//! Layout of a version 0 image (all integers little-endian):
//!
//! ```text
//! 0    magic "ANDROID!"
//! 8    kernel size, kernel load address
//! 16   ramdisk size, ramdisk load address
//! 24   second stage size, second stage load address
//! 32   tags address, page size
//! 40   header version, os version
//! 48   product name [16]
//! 64   kernel command line [512]
//! ```
//!
//! The header occupies the first page; kernel, ramdisk and second stage follow,
//! each padded to a whole number of pages.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use uemu_error::{ProvisionError, Result};

pub const BOOT_MAGIC: &[u8; 8] = b"ANDROID!";

const NAME_OFFSET: usize = 48;
const NAME_LEN: usize = 16;
const CMDLINE_OFFSET: usize = NAME_OFFSET + NAME_LEN;
const CMDLINE_LEN: usize = 512;
const HEADER_LEN: usize = CMDLINE_OFFSET + CMDLINE_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImageHeader {
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub name: String,
    pub cmdline: String,
}

fn le_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl BootImageHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BOOT_MAGIC.len() || &bytes[..BOOT_MAGIC.len()] != BOOT_MAGIC {
            return Err(ProvisionError::format("missing ANDROID! boot magic"));
        }
        if bytes.len() < HEADER_LEN {
            return Err(ProvisionError::format(format!(
                "boot header truncated: {} of {} bytes",
                bytes.len(),
                HEADER_LEN
            )));
        }

        let header = Self {
            kernel_size: le_u32(bytes, 8),
            kernel_addr: le_u32(bytes, 12),
            ramdisk_size: le_u32(bytes, 16),
            ramdisk_addr: le_u32(bytes, 20),
            second_size: le_u32(bytes, 24),
            second_addr: le_u32(bytes, 28),
            tags_addr: le_u32(bytes, 32),
            page_size: le_u32(bytes, 36),
            name: c_string(&bytes[NAME_OFFSET..NAME_OFFSET + NAME_LEN]),
            cmdline: c_string(&bytes[CMDLINE_OFFSET..CMDLINE_OFFSET + CMDLINE_LEN]),
        };

        if header.page_size == 0 || !header.page_size.is_power_of_two() {
            return Err(ProvisionError::format(format!(
                "invalid page size {}",
                header.page_size
            )));
        }
        if (header.page_size as usize) < HEADER_LEN {
            return Err(ProvisionError::format(format!(
                "page size {} smaller than the header",
                header.page_size
            )));
        }
        Ok(header)
    }

    fn pages(&self, size: u32) -> u64 {
        (size as u64).div_ceil(self.page_size as u64)
    }

    pub fn kernel_offset(&self) -> u64 {
        self.page_size as u64
    }

    pub fn ramdisk_offset(&self) -> u64 {
        (1 + self.pages(self.kernel_size)) * self.page_size as u64
    }

    pub fn second_offset(&self) -> u64 {
        self.ramdisk_offset() + self.pages(self.ramdisk_size) * self.page_size as u64
    }
}

/// Output file names for one boot image flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentNames {
    pub kernel: &'static str,
    pub ramdisk: &'static str,
    pub second: &'static str,
}

pub const BOOT_SEGMENTS: SegmentNames = SegmentNames {
    kernel: "kernel",
    ramdisk: "ramdisk.img",
    second: "second.img",
};

pub const RECOVERY_SEGMENTS: SegmentNames = SegmentNames {
    kernel: "recovery-kernel",
    ramdisk: "recovery-ramdisk.img",
    second: "recovery-second.img",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedBoot {
    pub header: BootImageHeader,
    pub kernel: PathBuf,
    pub ramdisk: PathBuf,
    pub second: Option<PathBuf>,
}

fn write_segment(
    file: &mut File,
    file_len: u64,
    what: &str,
    offset: u64,
    size: u32,
    dest: &Path,
) -> Result<()> {
    let size = size as u64;
    if offset.saturating_add(size) > file_len {
        return Err(ProvisionError::format(format!(
            "{} segment ({} bytes at {}) runs past end of image ({} bytes)",
            what, size, offset, file_len
        )));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut out = File::create(dest)?;
    let copied = io::copy(&mut file.by_ref().take(size), &mut out)?;
    if copied != size {
        return Err(ProvisionError::format(format!(
            "{} segment short read: {} of {} bytes",
            what, copied, size
        )));
    }
    Ok(())
}

/// Split `image` into kernel, ramdisk and (if present) second stage under `out_dir`.
pub fn extract(image: &Path, out_dir: &Path, names: &SegmentNames) -> Result<ExtractedBoot> {
    let mut file = File::open(image)?;
    let file_len = file.metadata()?.len();

    let mut head = Vec::with_capacity(HEADER_LEN);
    file.by_ref().take(HEADER_LEN as u64).read_to_end(&mut head)?;
    let header = BootImageHeader::parse(&head)?;
    log::debug!(
        "{}: page {} kernel {} ramdisk {} second {}",
        image.display(),
        header.page_size,
        header.kernel_size,
        header.ramdisk_size,
        header.second_size
    );

    fs::create_dir_all(out_dir)?;
    let kernel = out_dir.join(names.kernel);
    write_segment(
        &mut file,
        file_len,
        "kernel",
        header.kernel_offset(),
        header.kernel_size,
        &kernel,
    )?;
    let ramdisk = out_dir.join(names.ramdisk);
    write_segment(
        &mut file,
        file_len,
        "ramdisk",
        header.ramdisk_offset(),
        header.ramdisk_size,
        &ramdisk,
    )?;
    let second = if header.second_size > 0 {
        let second = out_dir.join(names.second);
        write_segment(
            &mut file,
            file_len,
            "second stage",
            header.second_offset(),
            header.second_size,
            &second,
        )?;
        Some(second)
    } else {
        None
    };

    Ok(ExtractedBoot {
        header,
        kernel,
        ramdisk,
        second,
    })
}
