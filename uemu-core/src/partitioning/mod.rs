//! Partition table planning.
//!
//! A [`PartitionSpec`] is an ordered list of partition declarations. The planner
//! validates it up front, then drives `parted` to create the table, add every
//! partition in declaration order (so `pN` nodes follow the declaration) and set
//! the boot flag. The geometry `parted` reports back is attached to the result.

use std::fmt;
use std::path::Path;

use uemu_error::{HalError, ProvisionError, Result};
use uemu_hal::{PartedOp, PartitionOps};

/// Partitions start on the first MiB boundary.
pub const FIRST_PARTITION_MIB: u64 = 1;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Msdos,
    Gpt,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Msdos => "msdos",
            TableKind::Gpt => "gpt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Vfat,
}

impl FsKind {
    /// Filesystem type hint as `parted mkpart` expects it.
    pub fn parted_name(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "fat32",
        }
    }

    /// Filesystem type as `mount` expects it.
    pub fn mount_type(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "vfat",
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mount_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSize {
    MiB(u64),
    /// Whatever is left of the disk. Only valid on the last partition.
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDecl {
    pub label: String,
    pub subdir: String,
    pub fs: FsKind,
    pub size: PartSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub table: TableKind,
    pub parts: Vec<PartitionDecl>,
    /// 1-based partition number to flag bootable.
    pub boot: Option<u32>,
}

impl PartitionSpec {
    pub fn new(table: TableKind) -> Self {
        Self {
            table,
            parts: Vec::new(),
            boot: None,
        }
    }

    pub fn add(mut self, label: &str, subdir: &str, fs: FsKind, size: PartSize) -> Self {
        self.parts.push(PartitionDecl {
            label: label.to_string(),
            subdir: subdir.to_string(),
            fs,
            size,
        });
        self
    }

    pub fn bootable(mut self, part_num: u32) -> Self {
        self.boot = Some(part_num);
        self
    }

    /// Total MiB required by the bounded partitions, including the leading gap.
    pub fn fixed_mib(&self) -> u64 {
        FIRST_PARTITION_MIB
            + self
                .parts
                .iter()
                .map(|p| match p.size {
                    PartSize::MiB(n) => n,
                    PartSize::Rest => 0,
                })
                .sum::<u64>()
    }

    pub fn validate(&self) -> Result<()> {
        if self.parts.is_empty() {
            return Err(ProvisionError::partitioning("no partitions declared"));
        }
        let last = self.parts.len() - 1;
        for (idx, part) in self.parts.iter().enumerate() {
            if part.label.is_empty() {
                return Err(ProvisionError::partitioning(format!(
                    "partition {} has no label",
                    idx + 1
                )));
            }
            match part.size {
                PartSize::Rest if idx != last => {
                    return Err(ProvisionError::partitioning(format!(
                        "partition {} ({}) takes the rest of the disk but is not last",
                        idx + 1,
                        part.label
                    )));
                }
                PartSize::MiB(0) => {
                    return Err(ProvisionError::partitioning(format!(
                        "partition {} ({}) has zero size",
                        idx + 1,
                        part.label
                    )));
                }
                _ => {}
            }
        }
        if let Some(boot) = self.boot {
            if boot == 0 || boot as usize > self.parts.len() {
                return Err(ProvisionError::partitioning(format!(
                    "boot flag on partition {} but only {} declared",
                    boot,
                    self.parts.len()
                )));
            }
        }
        Ok(())
    }
}

/// A created partition with the geometry parted reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    pub label: String,
    pub subdir: String,
    pub fs: FsKind,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub bootable: bool,
}

/// One line of `parted -m unit B print`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub number: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub flags: Vec<String>,
}

fn parse_bytes(field: &str) -> Option<u64> {
    field.strip_suffix('B')?.parse().ok()
}

/// Parse partition lines from `parted -s -m <disk> unit B print`.
///
/// Lines look like `1:1048576B:135266303B:134217728B:fat32::boot, lba;`; the
/// `BYT;` header and the disk line are skipped.
pub fn parse_parted_machine(output: &str) -> Vec<Geometry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_end_matches(';');
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            let number = fields[0].parse().ok()?;
            Some(Geometry {
                number,
                start: parse_bytes(fields[1])?,
                end: parse_bytes(fields[2])?,
                size: parse_bytes(fields[3])?,
                flags: fields
                    .get(6)
                    .map(|f| {
                        f.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        })
        .collect()
}

fn tool_failure(step: String, err: HalError) -> ProvisionError {
    let output = match err {
        HalError::CommandFailed { stderr, .. } => stderr,
        other => other.to_string(),
    };
    ProvisionError::Partitioning {
        message: step,
        output,
    }
}

pub struct PartitionPlanner<'a, H: PartitionOps + ?Sized> {
    hal: &'a H,
}

impl<'a, H: PartitionOps + ?Sized> PartitionPlanner<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        Self { hal }
    }

    fn run(&self, disk: &Path, op: PartedOp, step: impl FnOnce() -> String) -> Result<String> {
        self.hal
            .parted(disk, op)
            .map_err(|err| tool_failure(step(), err))
    }

    /// Validate `spec` and write it to `disk`.
    pub fn apply(&self, disk: &Path, spec: &PartitionSpec) -> Result<Vec<Partition>> {
        spec.validate()?;

        let disk_size = std::fs::metadata(disk)?.len();
        let has_rest = spec.parts.iter().any(|p| p.size == PartSize::Rest);
        let needed = spec.fixed_mib() * MIB;
        if needed > disk_size || (has_rest && needed == disk_size) {
            return Err(ProvisionError::partitioning(format!(
                "{} needs more than {} bytes",
                disk.display(),
                disk_size
            )));
        }

        log::info!(
            "partitioning {} ({} table, {} partitions)",
            disk.display(),
            spec.table.as_str(),
            spec.parts.len()
        );

        self.run(
            disk,
            PartedOp::MkLabel {
                label: spec.table.as_str().to_string(),
            },
            || format!("mklabel {}", spec.table.as_str()),
        )?;

        let mut cursor = FIRST_PARTITION_MIB;
        for part in &spec.parts {
            let start = format!("{}MiB", cursor);
            let end = match part.size {
                PartSize::MiB(n) => {
                    cursor += n;
                    format!("{}MiB", cursor)
                }
                PartSize::Rest => "100%".to_string(),
            };
            let part_type = match spec.table {
                TableKind::Msdos => "primary".to_string(),
                TableKind::Gpt => part.label.clone(),
            };
            self.run(
                disk,
                PartedOp::MkPart {
                    part_type,
                    fs_type: part.fs.parted_name().to_string(),
                    start: start.clone(),
                    end: end.clone(),
                },
                || format!("mkpart {} {} {}", part.label, start, end),
            )?;
        }

        if let Some(boot) = spec.boot {
            self.run(
                disk,
                PartedOp::SetFlag {
                    part_num: boot,
                    flag: "boot".to_string(),
                    state: "on".to_string(),
                },
                || format!("set {} boot on", boot),
            )?;
        }

        let printed = self.run(disk, PartedOp::Print, || "print".to_string())?;
        let geometry = parse_parted_machine(&printed);
        if geometry.len() != spec.parts.len() {
            return Err(ProvisionError::Partitioning {
                message: format!(
                    "expected {} partitions on {}, parted reports {}",
                    spec.parts.len(),
                    disk.display(),
                    geometry.len()
                ),
                output: printed,
            });
        }

        Ok(spec
            .parts
            .iter()
            .zip(geometry)
            .map(|(decl, geo)| Partition {
                number: geo.number,
                label: decl.label.clone(),
                subdir: decl.subdir.clone(),
                fs: decl.fs,
                start: geo.start,
                end: geo.end,
                size: geo.size,
                bootable: spec.boot == Some(geo.number),
            })
            .collect())
    }
}
