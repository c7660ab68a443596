//! Fake HAL implementation for testing.
//!
//! This implementation records all operations without executing them,
//! allowing for CI-safe testing without root privileges or real loop devices.
//! It models just enough host state (mounts, attached loops, partition tables,
//! effective identity) for provisioning code to observe consistent behaviour.

use super::{
    ConvertOps, FormatOps, FormatOptions, Identity, IdentityOps, ImageFormat, LoopOps, MountOps,
    MountOptions, PartedOp, PartitionOps, ProcessOps,
};
use crate::{HalError, HalResult};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: String,
        read_only: bool,
    },
    Unmount {
        target: PathBuf,
    },
    FormatExt4 {
        device: PathBuf,
        label: String,
    },
    FormatVfat {
        device: PathBuf,
        label: String,
    },
    Parted {
        disk: PathBuf,
        op: PartedOp,
    },
    LosetupAttach {
        image: PathBuf,
        scan_partitions: bool,
        read_only: bool,
        loop_device: String,
    },
    LosetupDetach {
        loop_device: String,
    },
    Convert {
        src: PathBuf,
        dst: PathBuf,
        to: ImageFormat,
    },
    Command {
        program: String,
        args: Vec<String>,
        timeout_secs: u64,
    },
    SetIdentity {
        uid: u32,
        gid: u32,
    },
}

/// Operations that can be armed to fail, for exercising error paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Mount,
    Unmount,
    LosetupAttach,
    LosetupDetach,
    Parted,
    Format,
    Convert,
    /// Any command whose program name matches.
    Command(String),
}

#[derive(Debug, Clone)]
struct FakePartition {
    start: u64,
    end: u64,
    fs_type: String,
    flags: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeHalState {
    operations: Vec<Operation>,
    mounted_paths: HashSet<PathBuf>,
    loops: HashMap<String, PathBuf>,
    next_loop: u32,
    tables: HashMap<PathBuf, (String, Vec<FakePartition>)>,
    seeds: HashMap<PathBuf, Vec<(PathBuf, Vec<u8>)>>,
    command_stdout: HashMap<String, String>,
    failures: HashSet<FailPoint>,
    real_uid: u32,
    effective: Identity,
}

impl Default for FakeHalState {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            mounted_paths: HashSet::new(),
            loops: HashMap::new(),
            next_loop: 0,
            tables: HashMap::new(),
            seeds: HashMap::new(),
            command_stdout: HashMap::new(),
            failures: HashSet::new(),
            real_uid: 0,
            effective: Identity::ROOT,
        }
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// Starts out as a root process; see [`FakeHal::unprivileged`].
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake process started by an ordinary user.
    pub fn unprivileged(uid: u32, gid: u32) -> Self {
        let hal = Self::new();
        {
            let mut state = hal.lock();
            state.real_uid = uid;
            state.effective = Identity::new(uid, gid);
        }
        hal
    }

    fn lock(&self) -> MutexGuard<'_, FakeHalState> {
        // A panicking test thread must not hide the recorded operations from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    /// Clear all recorded operations and modelled state.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.operations.clear();
        state.mounted_paths.clear();
        state.loops.clear();
    }

    /// Loop devices currently attached.
    pub fn attached_loops(&self) -> Vec<String> {
        let mut loops: Vec<String> = self.lock().loops.keys().cloned().collect();
        loops.sort();
        loops
    }

    /// Paths currently mounted.
    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().mounted_paths.iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Arm a failure; it stays armed until [`FakeHal::disarm`].
    pub fn fail_on(&self, point: FailPoint) {
        self.lock().failures.insert(point);
    }

    pub fn disarm(&self, point: &FailPoint) {
        self.lock().failures.remove(point);
    }

    /// Place a file inside `image` so it appears whenever the whole device is mounted.
    pub fn seed_image(&self, image: &Path, relative: impl Into<PathBuf>, content: &[u8]) {
        self.lock()
            .seeds
            .entry(image.to_path_buf())
            .or_default()
            .push((relative.into(), content.to_vec()));
    }

    /// Canned stdout for every invocation of `program`.
    pub fn set_command_stdout(&self, program: &str, stdout: &str) {
        self.lock()
            .command_stdout
            .insert(program.to_string(), stdout.to_string());
    }

    /// Every effective identity switch, in order.
    pub fn identity_changes(&self) -> Vec<Identity> {
        self.lock()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::SetIdentity { uid, gid } => Some(Identity::new(*uid, *gid)),
                _ => None,
            })
            .collect()
    }

    fn record_operation(&self, op: Operation) {
        self.lock().operations.push(op);
    }

    fn check_failure(&self, point: FailPoint, program: &str) -> HalResult<()> {
        if self.lock().failures.contains(&point) {
            return Err(HalError::CommandFailed {
                program: program.to_string(),
                code: Some(1),
                stderr: format!("injected {:?} failure", point),
            });
        }
        Ok(())
    }

    /// Resolve a loop device (or one of its partitions) back to the image it serves.
    fn image_for_device(state: &FakeHalState, device: &Path) -> Option<(PathBuf, bool)> {
        let device = device.to_string_lossy();
        for (loop_dev, image) in &state.loops {
            if *device == **loop_dev {
                return Some((image.clone(), true));
            }
            if let Some(rest) = device.strip_prefix(loop_dev.as_str()) {
                if rest.starts_with('p') {
                    return Some((image.clone(), false));
                }
            }
        }
        None
    }
}

fn parse_parted_position(raw: &str, disk_size: u64) -> HalResult<u64> {
    if let Some(pct) = raw.strip_suffix('%') {
        let pct: u64 = pct
            .parse()
            .map_err(|_| HalError::Parse(format!("bad parted position {}", raw)))?;
        return Ok(disk_size * pct / 100);
    }
    if let Some(mib) = raw.strip_suffix("MiB") {
        let mib: u64 = mib
            .parse()
            .map_err(|_| HalError::Parse(format!("bad parted position {}", raw)))?;
        return Ok(mib * MIB);
    }
    if let Some(bytes) = raw.strip_suffix('B') {
        return bytes
            .parse()
            .map_err(|_| HalError::Parse(format!("bad parted position {}", raw)));
    }
    Err(HalError::Parse(format!("bad parted position {}", raw)))
}

impl ProcessOps for FakeHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        _cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output> {
        self.record_operation(Operation::Command {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs: timeout.as_secs(),
        });
        let failed = self
            .lock()
            .failures
            .contains(&FailPoint::Command(program.to_string()));
        let stdout = self
            .lock()
            .command_stdout
            .get(program)
            .cloned()
            .unwrap_or_default();

        let (status, stderr) = if failed {
            (
                std::process::ExitStatus::from_raw(1 << 8),
                format!("injected {} failure", program).into_bytes(),
            )
        } else {
            (std::process::ExitStatus::from_raw(0), Vec::new())
        };

        Ok(Output {
            status,
            stdout: stdout.into_bytes(),
            stderr,
        })
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()> {
        self.check_failure(FailPoint::Mount, "mount")?;

        log::info!(
            "FAKE HAL: mount {} -> {} (type: {})",
            device.display(),
            target.display(),
            fstype
        );

        self.record_operation(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            read_only: options.read_only,
        });

        let seeds = {
            let mut state = self.lock();
            state.mounted_paths.insert(target.to_path_buf());
            match Self::image_for_device(&state, device) {
                Some((image, true)) => state.seeds.get(&image).cloned().unwrap_or_default(),
                _ => Vec::new(),
            }
        };
        for (relative, content) in seeds {
            let path = target.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
        }

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        self.check_failure(FailPoint::Unmount, "umount")?;

        log::info!("FAKE HAL: unmount {}", target.display());

        self.record_operation(Operation::Unmount {
            target: target.to_path_buf(),
        });
        if !self.lock().mounted_paths.remove(target) {
            return Err(HalError::Other(format!(
                "{} is not mounted",
                target.display()
            )));
        }

        Ok(())
    }

    fn unmount_recursive(&self, target: &Path) -> HalResult<()> {
        let mut under: Vec<PathBuf> = self
            .lock()
            .mounted_paths
            .iter()
            .filter(|mp| mp.starts_with(target))
            .cloned()
            .collect();
        under.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        let mut first_err = None;
        for mp in under {
            if let Err(err) = self.unmount(&mp) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(self.lock().mounted_paths.contains(path))
    }
}

impl FormatOps for FakeHal {
    fn format_ext4(&self, device: &Path, label: &str, _opts: &FormatOptions) -> HalResult<()> {
        self.check_failure(FailPoint::Format, "mkfs.ext4")?;
        log::info!("FAKE HAL: mkfs.ext4 -L {} {}", label, device.display());
        self.record_operation(Operation::FormatExt4 {
            device: device.to_path_buf(),
            label: label.to_string(),
        });
        Ok(())
    }

    fn format_vfat(&self, device: &Path, label: &str, _opts: &FormatOptions) -> HalResult<()> {
        self.check_failure(FailPoint::Format, "mkfs.vfat")?;
        log::info!("FAKE HAL: mkfs.vfat -n {} {}", label, device.display());
        self.record_operation(Operation::FormatVfat {
            device: device.to_path_buf(),
            label: label.to_string(),
        });
        Ok(())
    }
}

impl PartitionOps for FakeHal {
    fn parted(&self, disk: &Path, op: PartedOp) -> HalResult<String> {
        self.check_failure(FailPoint::Parted, "parted")?;
        self.record_operation(Operation::Parted {
            disk: disk.to_path_buf(),
            op: op.clone(),
        });

        let disk_size = fs::metadata(disk).map(|m| m.len()).unwrap_or(0);
        let mut state = self.lock();
        match op {
            PartedOp::MkLabel { label } => {
                state.tables.insert(disk.to_path_buf(), (label, Vec::new()));
                Ok(String::new())
            }
            PartedOp::MkPart {
                fs_type,
                start,
                end,
                ..
            } => {
                let start = parse_parted_position(&start, disk_size)?;
                let end = parse_parted_position(&end, disk_size)?;
                let (_, parts) = state.tables.get_mut(disk).ok_or_else(|| HalError::CommandFailed {
                    program: "parted".to_string(),
                    code: Some(1),
                    stderr: "Error: unrecognised disk label".to_string(),
                })?;
                parts.push(FakePartition {
                    start,
                    end: end.saturating_sub(1),
                    fs_type,
                    flags: Vec::new(),
                });
                Ok(String::new())
            }
            PartedOp::SetFlag {
                part_num, flag, ..
            } => {
                let part = state
                    .tables
                    .get_mut(disk)
                    .and_then(|(_, parts)| parts.get_mut(part_num.saturating_sub(1) as usize))
                    .ok_or_else(|| HalError::CommandFailed {
                        program: "parted".to_string(),
                        code: Some(1),
                        stderr: format!("Error: Partition doesn't exist: {}", part_num),
                    })?;
                part.flags.push(flag);
                Ok(String::new())
            }
            PartedOp::Print => {
                let (label, parts) = state
                    .tables
                    .get(disk)
                    .cloned()
                    .unwrap_or_else(|| ("unknown".to_string(), Vec::new()));
                let mut out = format!(
                    "BYT;\n{}:{}B:file:512:512:{}::;\n",
                    disk.display(),
                    disk_size,
                    label
                );
                for (idx, part) in parts.iter().enumerate() {
                    out.push_str(&format!(
                        "{}:{}B:{}B:{}B:{}::{};\n",
                        idx + 1,
                        part.start,
                        part.end,
                        part.end - part.start + 1,
                        part.fs_type,
                        part.flags.join(", ")
                    ));
                }
                Ok(out)
            }
        }
    }
}

impl LoopOps for FakeHal {
    fn losetup_attach(
        &self,
        image: &Path,
        scan_partitions: bool,
        read_only: bool,
    ) -> HalResult<String> {
        self.check_failure(FailPoint::LosetupAttach, "losetup")?;
        let loop_device = {
            let mut state = self.lock();
            let dev = format!("/dev/loop{}", state.next_loop);
            state.next_loop += 1;
            state.loops.insert(dev.clone(), image.to_path_buf());
            dev
        };
        self.record_operation(Operation::LosetupAttach {
            image: image.to_path_buf(),
            scan_partitions,
            read_only,
            loop_device: loop_device.clone(),
        });
        Ok(loop_device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        self.check_failure(FailPoint::LosetupDetach, "losetup")?;
        self.record_operation(Operation::LosetupDetach {
            loop_device: loop_device.to_string(),
        });
        if self.lock().loops.remove(loop_device).is_none() {
            return Err(HalError::CommandFailed {
                program: "losetup".to_string(),
                code: Some(1),
                stderr: format!("{}: detach failed: No such device or address", loop_device),
            });
        }
        Ok(())
    }
}

impl ConvertOps for FakeHal {
    fn convert_image(
        &self,
        src: &Path,
        dst: &Path,
        _from: ImageFormat,
        to: ImageFormat,
    ) -> HalResult<()> {
        self.check_failure(FailPoint::Convert, "qemu-img")?;
        self.record_operation(Operation::Convert {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            to,
        });
        fs::copy(src, dst)?;
        Ok(())
    }
}

impl IdentityOps for FakeHal {
    fn real_uid(&self) -> u32 {
        self.lock().real_uid
    }

    fn effective_identity(&self) -> Identity {
        self.lock().effective
    }

    fn set_effective_identity(&self, identity: Identity) -> HalResult<()> {
        let mut state = self.lock();
        if state.real_uid != 0 && identity.uid != state.real_uid {
            return Err(HalError::PermissionDenied);
        }
        state.effective = identity;
        state.operations.push(Operation::SetIdentity {
            uid: identity.uid,
            gid: identity.gid,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fake_hal_records_mount() {
        let hal = FakeHal::new();
        let device = Path::new("/dev/loop0p1");
        let target = Path::new("/mnt/test");

        hal.mount_device(device, target, "ext4", &MountOptions::new())
            .unwrap();

        assert_eq!(hal.operation_count(), 1);
        assert!(hal.has_operation(|op| matches!(op, Operation::Mount { .. })));
        assert!(hal.is_mounted(target).unwrap());
    }

    #[test]
    fn fake_hal_unmount_of_unmounted_path_fails() {
        let hal = FakeHal::new();
        assert!(hal.unmount(Path::new("/mnt/nothing")).is_err());
    }

    #[test]
    fn fake_hal_assigns_distinct_loop_devices() {
        let hal = FakeHal::new();
        let a = hal
            .losetup_attach(Path::new("/tmp/a.img"), true, false)
            .unwrap();
        let b = hal
            .losetup_attach(Path::new("/tmp/b.img"), false, true)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(hal.attached_loops().len(), 2);

        hal.losetup_detach(&a).unwrap();
        assert_eq!(hal.attached_loops(), vec![b]);
    }

    #[test]
    fn fake_hal_injected_failure() {
        let hal = FakeHal::new();
        hal.fail_on(FailPoint::Format);
        let err = hal
            .format_ext4(Path::new("/dev/loop0p1"), "root", &FormatOptions::new())
            .unwrap_err();
        assert!(matches!(err, HalError::CommandFailed { .. }));

        hal.disarm(&FailPoint::Format);
        hal.format_ext4(Path::new("/dev/loop0p1"), "root", &FormatOptions::new())
            .unwrap();
    }

    #[test]
    fn fake_hal_prints_partition_geometry() {
        let dir = tempdir().unwrap();
        let disk = dir.path().join("disk.img");
        fs::File::create(&disk).unwrap().set_len(64 * MIB).unwrap();

        let hal = FakeHal::new();
        hal.parted(
            &disk,
            PartedOp::MkLabel {
                label: "msdos".to_string(),
            },
        )
        .unwrap();
        hal.parted(
            &disk,
            PartedOp::MkPart {
                part_type: "primary".to_string(),
                fs_type: "fat32".to_string(),
                start: "1MiB".to_string(),
                end: "17MiB".to_string(),
            },
        )
        .unwrap();
        hal.parted(
            &disk,
            PartedOp::SetFlag {
                part_num: 1,
                flag: "boot".to_string(),
                state: "on".to_string(),
            },
        )
        .unwrap();

        let out = hal.parted(&disk, PartedOp::Print).unwrap();
        assert!(out.starts_with("BYT;\n"));
        assert!(out.contains("1:1048576B:17825791B:16777216B:fat32::boot;"));
    }

    #[test]
    fn fake_hal_seeds_whole_device_mounts() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir_all(&target).unwrap();

        let hal = FakeHal::new();
        let image = Path::new("/data/system.img");
        hal.seed_image(image, "build.prop", b"ro.build.id=42\n");
        let dev = hal.losetup_attach(image, false, true).unwrap();
        hal.mount_device(Path::new(&dev), &target, "ext4", &MountOptions::read_only())
            .unwrap();

        assert_eq!(
            fs::read(target.join("build.prop")).unwrap(),
            b"ro.build.id=42\n"
        );
    }

    #[test]
    fn fake_hal_identity_requires_root() {
        let hal = FakeHal::unprivileged(1000, 1000);
        assert_eq!(hal.real_uid(), 1000);
        let err = hal.set_effective_identity(Identity::ROOT).unwrap_err();
        assert!(matches!(err, HalError::PermissionDenied));

        let root = FakeHal::new();
        root.set_effective_identity(Identity::new(1000, 1000))
            .unwrap();
        root.set_effective_identity(Identity::ROOT).unwrap();
        assert_eq!(
            root.identity_changes(),
            vec![Identity::new(1000, 1000), Identity::ROOT]
        );
    }

    #[test]
    fn fake_hal_canned_command_output() {
        let hal = FakeHal::new();
        hal.set_command_stdout("chroot", "C\nen_US.utf8\n");
        let out = hal
            .command_output("chroot", &["/mnt", "locale", "-a"], Duration::from_secs(5))
            .unwrap();
        assert!(out.status.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "C\nen_US.utf8\n");

        hal.fail_on(FailPoint::Command("chroot".to_string()));
        let out = hal
            .command_output("chroot", &["/mnt", "true"], Duration::from_secs(5))
            .unwrap();
        assert!(!out.status.success());
    }
}
