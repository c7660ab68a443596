//! Configuration steps run inside the provisioned root filesystem.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use uemu_core::config::Arch;
use uemu_core::templates::render_locale_job;
use uemu_error::ProvisionError;
use uemu_hal::ProcessOps;

pub const QEMU_ARM_STATIC: &str = "/usr/bin/qemu-arm-static";
pub const QEMU_USER_STATIC_PACKAGE: &str = "qemu-user-static";

pub const DEFAULT_USER: &str = "phablet";
/// Upstart session job applying the selected locale, relative to the root.
pub const LOCALE_JOB: &str = "usr/share/upstart/sessions/emulator-language.conf";

const CHROOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Host emulation binary copied into an armhf root while the guard lives.
#[derive(Debug)]
pub struct QemuStatic {
    dest: PathBuf,
}

impl QemuStatic {
    pub fn install(root: &Path) -> Result<Self> {
        Self::install_from(Path::new(QEMU_ARM_STATIC), root)
    }

    fn install_from(src: &Path, root: &Path) -> Result<Self> {
        let dest = root.join(QEMU_ARM_STATIC.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &dest).with_context(|| {
            format!("cannot copy {} into {}", src.display(), root.display())
        })?;
        Ok(Self { dest })
    }
}

impl Drop for QemuStatic {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.dest) {
            log::warn!("failed to remove {}: {}", self.dest.display(), err);
        }
    }
}

fn emulation(root: &Path, arch: Arch) -> Result<Option<QemuStatic>> {
    match arch {
        Arch::Armhf => Ok(Some(QemuStatic::install(root)?)),
        Arch::I386 => Ok(None),
    }
}

fn run_in_chroot<H: ProcessOps + ?Sized>(hal: &H, root: &Path, script: &str) -> Result<Output> {
    let root_arg = root
        .to_str()
        .with_context(|| format!("non UTF-8 chroot path {}", root.display()))?;
    let output = hal.command_output("chroot", &[root_arg, "/bin/sh", "-c", script], CHROOT_TIMEOUT)?;
    Ok(output)
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

/// Set the default user's password with `chpasswd` inside `root`.
pub fn set_password<H: ProcessOps + ?Sized>(
    hal: &H,
    root: &Path,
    arch: Arch,
    password: &str,
) -> Result<()> {
    if password.contains('\'') || password.contains('\n') {
        return Err(ProvisionError::configuration("password must not contain quotes or newlines").into());
    }
    log::info!("setting up a default password for {}", DEFAULT_USER);
    let _qemu = emulation(root, arch)?;

    let script = format!("echo -n '{}:{}' | chpasswd", DEFAULT_USER, password);
    let output = run_in_chroot(hal, root, &script)?;
    if !output.status.success() {
        anyhow::bail!(
            "cannot set password for {}: {}",
            DEFAULT_USER,
            combined_output(&output)
        );
    }
    Ok(())
}

/// Make `locale` the first-boot language of the image.
///
/// The locale must be one the image ships (`locale -a`).
pub fn set_locale<H: ProcessOps + ?Sized>(
    hal: &H,
    root: &Path,
    arch: Arch,
    locale: &str,
) -> Result<PathBuf> {
    let _qemu = emulation(root, arch)?;

    let output = run_in_chroot(hal, root, "locale -a")?;
    if !output.status.success() {
        anyhow::bail!("cannot list locales: {}", combined_output(&output));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.lines().any(|line| line.trim() == locale) {
        return Err(ProvisionError::configuration(format!(
            "the selected locale {} is not available on the image",
            locale
        ))
        .into());
    }

    let job = root.join(LOCALE_JOB);
    if let Some(parent) = job.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&job, render_locale_job(locale))
        .with_context(|| format!("cannot write {}", job.display()))?;
    log::info!("locale set to {}", locale);
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uemu_hal::{FailPoint, FakeHal, Operation};

    fn chroot_scripts(hal: &FakeHal) -> Vec<String> {
        hal.operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Command { program, args, .. } if program == "chroot" => {
                    args.last().cloned()
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn password_is_piped_to_chpasswd() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        set_password(&hal, dir.path(), Arch::I386, "0000").unwrap();
        assert_eq!(
            chroot_scripts(&hal),
            vec!["echo -n 'phablet:0000' | chpasswd".to_string()]
        );
    }

    #[test]
    fn password_failure_carries_tool_output() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.fail_on(FailPoint::Command("chroot".to_string()));
        let err = set_password(&hal, dir.path(), Arch::I386, "0000").unwrap_err();
        assert!(err.to_string().contains("injected chroot failure"));
    }

    #[test]
    fn quoted_password_is_rejected_before_running_anything() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        assert!(set_password(&hal, dir.path(), Arch::I386, "it's").is_err());
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn available_locale_writes_job() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.set_command_stdout("chroot", "C\nC.UTF-8\nes_AR.utf8\nPOSIX\n");

        let job = set_locale(&hal, dir.path(), Arch::I386, "es_AR.utf8").unwrap();
        assert_eq!(job, dir.path().join(LOCALE_JOB));
        let body = fs::read_to_string(job).unwrap();
        assert_eq!(body.matches("es_AR.utf8").count(), 5);
        assert_eq!(chroot_scripts(&hal), vec!["locale -a".to_string()]);
    }

    #[test]
    fn unknown_locale_is_refused() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.set_command_stdout("chroot", "C\nPOSIX\n");

        let err = set_locale(&hal, dir.path(), Arch::I386, "es_AR.utf8").unwrap_err();
        assert!(err.to_string().contains("not available"));
        assert!(!dir.path().join(LOCALE_JOB).exists());
    }

    #[test]
    fn qemu_static_lives_for_the_guard() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("qemu-arm-static");
        fs::write(&src, b"\x7fELF").unwrap();
        let root = dir.path().join("root");

        let guard = QemuStatic::install_from(&src, &root).unwrap();
        let installed = root.join("usr/bin/qemu-arm-static");
        assert!(installed.is_file());
        drop(guard);
        assert!(!installed.exists());
    }
}
