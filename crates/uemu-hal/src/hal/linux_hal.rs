//! Linux HAL implementation using real system calls and host tools.

use super::{
    ConvertOps, FormatOps, FormatOptions, Identity, IdentityOps, ImageFormat, LoopOps, MountOps,
    MountOptions, PartedOp, PartitionOps, ProcessOps,
};
use crate::{HalError, HalResult};
use nix::unistd::{Gid, Uid};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const FORMAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PARTED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const LOSETUP_TIMEOUT: Duration = Duration::from_secs(30);
const CONVERT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    // Avoid commands hanging waiting for input.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn run_checked(program: &str, args: &[String], timeout: Duration) -> HalResult<Output> {
    log::debug!("exec: {} {}", program, args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = output_with_timeout(program, &mut cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(output)
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

fn read_mountinfo() -> HalResult<Vec<crate::procfs::mountinfo::MountInfo>> {
    let content = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(crate::procfs::mountinfo::parse_mountinfo(&content))
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()> {
        log::debug!(
            "mount {} -> {} ({}, ro={})",
            device.display(),
            target.display(),
            fstype,
            options.read_only
        );

        let mut flags = nix::mount::MsFlags::empty();
        if options.read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }
        let data = options.options.as_deref();

        nix::mount::mount(Some(device), target, Some(fstype), flags, data).map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::debug!("umount {}", target.display());
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;
        Ok(())
    }

    fn unmount_recursive(&self, target: &Path) -> HalResult<()> {
        let entries = read_mountinfo()?;

        let under = crate::procfs::mountinfo::mounts_under(target, &entries);

        let mut first_err = None;
        for mp in under {
            if let Err(err) = self.unmount(&mp) {
                log::warn!("failed to unmount {}: {}", mp.display(), err);
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let entries = read_mountinfo()?;
        Ok(crate::procfs::mountinfo::is_mounted_from_info(
            path, &entries,
        ))
    }
}

impl FormatOps for LinuxHal {
    fn format_ext4(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        let mut args: Vec<String> = vec!["-F".to_string(), "-L".to_string(), label.to_string()];
        args.extend(opts.extra_args.iter().cloned());
        args.push(device.display().to_string());

        run_checked("mkfs.ext4", &args, FORMAT_TIMEOUT)?;
        Ok(())
    }

    fn format_vfat(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        // FAT volume labels are at most 11 upper-case characters.
        let label: String = label.to_ascii_uppercase().chars().take(11).collect();
        let mut args: Vec<String> = vec![
            "-F".to_string(),
            "32".to_string(),
            "-n".to_string(),
            label,
        ];
        args.extend(opts.extra_args.iter().cloned());
        args.push(device.display().to_string());

        run_checked("mkfs.vfat", &args, FORMAT_TIMEOUT)?;
        Ok(())
    }
}

impl PartitionOps for LinuxHal {
    fn parted(&self, disk: &Path, op: PartedOp) -> HalResult<String> {
        let mut args: Vec<String> = vec!["-s".to_string()];
        match op {
            PartedOp::MkLabel { label } => {
                args.push(disk.display().to_string());
                args.push("mklabel".to_string());
                args.push(label);
            }
            PartedOp::MkPart {
                part_type,
                fs_type,
                start,
                end,
            } => {
                args.push("-a".to_string());
                args.push("optimal".to_string());
                args.push(disk.display().to_string());
                args.push("mkpart".to_string());
                args.push(part_type);
                args.push(fs_type);
                args.push(start);
                args.push(end);
            }
            PartedOp::SetFlag {
                part_num,
                flag,
                state,
            } => {
                args.push(disk.display().to_string());
                args.push("set".to_string());
                args.push(part_num.to_string());
                args.push(flag);
                args.push(state);
            }
            PartedOp::Print => {
                args.push("-m".to_string());
                args.push(disk.display().to_string());
                args.push("unit".to_string());
                args.push("B".to_string());
                args.push("print".to_string());
            }
        }

        let output = run_checked("parted", &args, PARTED_TIMEOUT)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl LoopOps for LinuxHal {
    fn losetup_attach(
        &self,
        image: &Path,
        scan_partitions: bool,
        read_only: bool,
    ) -> HalResult<String> {
        let mut args = vec!["--show".to_string(), "-f".to_string()];
        if scan_partitions {
            args.push("-P".to_string());
        }
        if read_only {
            args.push("-r".to_string());
        }
        args.push(image.display().to_string());

        let output = run_checked("losetup", &args, LOSETUP_TIMEOUT)?;
        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(HalError::Parse(format!(
                "losetup returned no device for {}",
                image.display()
            )));
        }
        Ok(device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        run_checked(
            "losetup",
            &["-d".to_string(), loop_device.to_string()],
            LOSETUP_TIMEOUT,
        )?;
        Ok(())
    }
}

impl ConvertOps for LinuxHal {
    fn convert_image(
        &self,
        src: &Path,
        dst: &Path,
        from: ImageFormat,
        to: ImageFormat,
    ) -> HalResult<()> {
        let args = vec![
            "convert".to_string(),
            "-f".to_string(),
            from.as_str().to_string(),
            "-O".to_string(),
            to.as_str().to_string(),
            src.display().to_string(),
            dst.display().to_string(),
        ];
        run_checked("qemu-img", &args, CONVERT_TIMEOUT)?;
        Ok(())
    }
}

impl ProcessOps for LinuxHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        output_with_timeout(program, &mut cmd, timeout)
    }
}

impl IdentityOps for LinuxHal {
    fn real_uid(&self) -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn effective_identity(&self) -> Identity {
        Identity::new(
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        )
    }

    fn set_effective_identity(&self, identity: Identity) -> HalResult<()> {
        let uid = Uid::from_raw(identity.uid);
        let gid = Gid::from_raw(identity.gid);
        if identity.is_root() {
            // Regain uid 0 first; changing the group requires it.
            nix::unistd::seteuid(uid).map_err(map_nix_err)?;
            nix::unistd::setegid(gid).map_err(map_nix_err)?;
        } else {
            nix::unistd::setegid(gid).map_err(map_nix_err)?;
            nix::unistd::seteuid(uid).map_err(map_nix_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_maps_to_command_not_found() {
        let hal = LinuxHal::new();
        let err = hal
            .command_output("uemu-definitely-not-installed", &[], Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, HalError::CommandNotFound(ref p) if p == "uemu-definitely-not-installed"));
    }

    #[test]
    fn command_status_surfaces_stderr() {
        let hal = LinuxHal::new();
        let err = hal
            .command_status("sh", &["-c", "echo boom >&2; exit 3"], Duration::from_secs(5))
            .unwrap_err();
        match err {
            HalError::CommandFailed {
                program,
                code,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn command_timeout_kills_child() {
        let hal = LinuxHal::new();
        let err = hal
            .command_output("sleep", &["5"], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, HalError::CommandTimeout { .. }));
    }

    #[test]
    fn effective_identity_matches_process() {
        let hal = LinuxHal::new();
        let id = hal.effective_identity();
        assert_eq!(id.uid, nix::unistd::geteuid().as_raw());
        assert_eq!(id.gid, nix::unistd::getegid().as_raw());
    }
}
