use anyhow::{anyhow, Context, Result};
use log::info;
use std::env;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::chroot::{QEMU_ARM_STATIC, QEMU_USER_STATIC_PACKAGE};
use uemu_core::config::{Arch, ProvisionConfig};
use uemu_error::ProvisionError;

/// A file that must exist on the host, with the package that provides it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiredFile {
    pub path: PathBuf,
    pub package: String,
}

#[derive(Clone, Debug)]
pub struct PreflightConfig {
    pub required_binaries: Vec<String>,
    pub required_files: Vec<RequiredFile>,
    /// Filesystem that will hold the instance images.
    pub disk_space_path: PathBuf,
    pub min_free_bytes: u64,
}

impl PreflightConfig {
    /// Host requirements of a create run with `cfg`.
    pub fn for_config(cfg: &ProvisionConfig) -> Self {
        let mut required_binaries: Vec<String> =
            ["parted", "losetup", "mkfs.ext4", "mkfs.vfat", "chroot"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        if !cfg.raw_disk {
            required_binaries.push("qemu-img".to_string());
        }

        let mut required_files = Vec::new();
        if cfg.arch == Arch::Armhf {
            required_files.push(RequiredFile {
                path: PathBuf::from(QEMU_ARM_STATIC),
                package: QEMU_USER_STATIC_PACKAGE.to_string(),
            });
        }

        Self {
            required_binaries,
            required_files,
            disk_space_path: cfg.data_root.clone(),
            min_free_bytes: cfg.system_size,
        }
    }
}

fn configuration(msg: String) -> anyhow::Error {
    ProvisionError::configuration(msg).into()
}

pub fn run(cfg: &PreflightConfig) -> Result<()> {
    info!("preflight checks");
    check_required_files(&cfg.required_files)?;
    check_binaries(&cfg.required_binaries)?;
    check_disk_space(&cfg.disk_space_path, cfg.min_free_bytes)?;
    info!("preflight complete");
    Ok(())
}

fn check_required_files(files: &[RequiredFile]) -> Result<()> {
    for file in files {
        if fs::metadata(&file.path).is_err() {
            return Err(configuration(format!(
                "missing dependency {} (apt install {})",
                file.path.display(),
                file.package
            )));
        }
    }
    Ok(())
}

fn check_binaries(bins: &[String]) -> Result<()> {
    let path = env::var_os("PATH").unwrap_or_default();
    let entries = env::split_paths(&path).collect::<Vec<_>>();
    for bin in bins {
        let Some(found) = find_in_paths(bin, &entries) else {
            return Err(configuration(format!(
                "required binary '{}' not found in PATH",
                bin
            )));
        };
        if let Err(err) = ensure_executable(&found) {
            return Err(configuration(format!(
                "required binary '{}' was found at {} but is not executable: {}",
                bin,
                found.display(),
                err
            )));
        }
    }
    Ok(())
}

fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let md = fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !md.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    if md.permissions().mode() & 0o111 == 0 {
        anyhow::bail!("{} is not executable", path.display());
    }
    Ok(())
}

fn find_in_paths(binary: &str, paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}

/// Nearest ancestor of `path` that exists; the data root is created later.
fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

fn check_disk_space(path: &Path, min_bytes: u64) -> Result<()> {
    if min_bytes == 0 {
        return Ok(());
    }
    let probe = existing_ancestor(path)
        .ok_or_else(|| anyhow!("no existing parent for {}", path.display()))?;
    let available = available_bytes(probe)?;
    if available < min_bytes {
        return Err(configuration(format!(
            "insufficient disk space at {}: {} MiB available ({} MiB required)",
            probe.display(),
            available / (1024 * 1024),
            min_bytes / (1024 * 1024)
        )));
    }
    Ok(())
}

#[allow(clippy::unnecessary_cast)]
fn available_bytes(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| anyhow!("invalid path for disk space check"))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        anyhow::bail!("failed to stat filesystem {}", path.display());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    struct EnvVarGuard<'a> {
        key: &'a str,
        original: Option<std::ffi::OsString>,
    }

    impl<'a> EnvVarGuard<'a> {
        fn new(key: &'a str, value: &std::ffi::OsStr) -> Self {
            let original = env::var_os(key);
            env::set_var(key, value);
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard<'_> {
        fn drop(&mut self) {
            if let Some(ref original) = self.original {
                env::set_var(self.key, original);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn is_configuration(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Configuration(_))
        )
    }

    #[test]
    fn raw_disk_does_not_need_qemu_img() {
        let mut cfg = ProvisionConfig::default();
        assert!(PreflightConfig::for_config(&cfg)
            .required_binaries
            .contains(&"qemu-img".to_string()));
        cfg.raw_disk = true;
        assert!(!PreflightConfig::for_config(&cfg)
            .required_binaries
            .contains(&"qemu-img".to_string()));
    }

    #[test]
    fn armhf_requires_qemu_arm_static() {
        let mut cfg = ProvisionConfig::default();
        assert!(PreflightConfig::for_config(&cfg).required_files.is_empty());
        cfg.arch = Arch::Armhf;
        let files = PreflightConfig::for_config(&cfg).required_files;
        assert_eq!(files[0].path, Path::new("/usr/bin/qemu-arm-static"));
        assert_eq!(files[0].package, "qemu-user-static");
    }

    #[test]
    fn missing_required_file_names_package() {
        let tmp = tempdir().unwrap();
        let err = check_required_files(&[RequiredFile {
            path: tmp.path().join("qemu-arm-static"),
            package: "qemu-user-static".to_string(),
        }])
        .unwrap_err();
        assert!(is_configuration(&err));
        assert!(err.to_string().contains("apt install qemu-user-static"));
    }

    #[test]
    fn check_binaries_fails_when_missing() {
        let _lock = crate::test_env::lock();
        let tmp = tempdir().unwrap();
        let _guard = EnvVarGuard::new("PATH", tmp.path().as_os_str());
        let err = check_binaries(&["parted".to_string()]).unwrap_err();
        assert!(is_configuration(&err));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn check_binaries_requires_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = crate::test_env::lock();
        let tmp = tempdir().unwrap();
        let bin = tmp.path().join("losetup");
        let _ = File::create(&bin).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o644)).unwrap();

        let _guard = EnvVarGuard::new("PATH", tmp.path().as_os_str());
        let err = check_binaries(&["losetup".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not executable"));

        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        check_binaries(&["losetup".to_string()]).unwrap();
    }

    #[test]
    fn disk_space_probes_existing_parent() {
        let tmp = tempdir().unwrap();
        let not_yet = tmp.path().join("ubuntu-emulator/instance");
        check_disk_space(&not_yet, 1).unwrap();
        let err = check_disk_space(&not_yet, u64::MAX).unwrap_err();
        assert!(is_configuration(&err));
    }
}
