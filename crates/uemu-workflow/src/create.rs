//! The "create instance" run.

use anyhow::{Context, Result};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uemu_core::boot_setup::BootSetup;
use uemu_core::bootimg::{self, BOOT_SEGMENTS, RECOVERY_SEGMENTS};
use uemu_core::catalog::{Catalog, HttpCatalog, Image};
use uemu_core::config::ProvisionConfig;
use uemu_core::device_tar::{
    find_device_tarball, flat_extract_images, require_images, BOOT_IMAGE, RECOVERY_IMAGE,
    SYSTEM_IMAGE,
};
use uemu_core::disk_image::{DiskImage, ImageRole};
use uemu_core::downloader::DownloadManager;
use uemu_core::privilege::Privileges;
use uemu_core::stamps;
use uemu_error::ProvisionError;
use uemu_hal::SystemHal;

use crate::chroot;
use crate::preflight::{self, PreflightConfig};

/// Property file copied out of the Android system image.
const BUILD_PROP: &str = "build.prop";
/// Name of the Ubuntu image once moved into the user data partition.
const NESTED_SYSTEM_IMAGE: &str = "system.img";

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub name: String,
    pub data_dir: PathBuf,
    pub version: u32,
    /// Downloaded release files, in completion order.
    pub files: Vec<PathBuf>,
}

pub struct ProvisioningWorkflow {
    hal: Arc<dyn SystemHal>,
    privileges: Arc<Privileges>,
    config: ProvisionConfig,
    catalog: Box<dyn Catalog + Send + Sync>,
    preflight: Option<PreflightConfig>,
}

impl ProvisioningWorkflow {
    /// Capture privileges and set up the catalog for `config.server`.
    ///
    /// Fails with a configuration error when not running as root. On success
    /// the process runs as the invoking user until a step escalates.
    pub fn new(hal: Arc<dyn SystemHal>, config: ProvisionConfig) -> Result<Self> {
        let privileges =
            Privileges::capture(Arc::clone(&hal)).context("cannot set up privilege handling")?;
        Self::with_privileges(hal, privileges, config)
    }

    /// Like [`ProvisioningWorkflow::new`] with privileges already captured.
    pub fn with_privileges(
        hal: Arc<dyn SystemHal>,
        privileges: Arc<Privileges>,
        config: ProvisionConfig,
    ) -> Result<Self> {
        let catalog = HttpCatalog::new(&config.server, config.http_timeout())?;
        let preflight = PreflightConfig::for_config(&config);
        Ok(Self {
            hal,
            privileges,
            config,
            catalog: Box::new(catalog),
            preflight: Some(preflight),
        })
    }

    pub fn with_catalog(mut self, catalog: impl Catalog + Send + Sync + 'static) -> Self {
        self.catalog = Box::new(catalog);
        self
    }

    pub fn with_preflight(mut self, preflight: Option<PreflightConfig>) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn privileges(&self) -> &Arc<Privileges> {
        &self.privileges
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Build instance `name` under the configured data root.
    ///
    /// A failed run leaves the partially built data directory in place.
    pub fn create(&self, name: &str) -> Result<CreatedInstance> {
        validate_instance_name(name)?;
        if let Some(preflight) = &self.preflight {
            preflight::run(preflight)?;
        }

        let cfg = &self.config;
        let device = cfg.arch.device();
        let image = self
            .catalog
            .resolve(&cfg.channel, device, cfg.revision)
            .with_context(|| format!("cannot resolve {} on {}", device, cfg.channel))?;
        log::info!(
            "creating \"{}\" from {} revision {}",
            name,
            cfg.channel,
            image.version
        );

        log::info!("downloading {} files", image.files.len());
        let downloader = DownloadManager::new(
            &cfg.server,
            &cfg.cache_dir,
            cfg.http_timeout(),
            Arc::clone(&self.privileges),
        )?;
        let files = downloader.download(&image.files)?;

        let data_dir = cfg.instance_dir(name);
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&data_dir)
            .with_context(|| format!("cannot create {}", data_dir.display()))?;

        log::info!("setting up images in {}", data_dir.display());
        let tarballs = ordered_tarballs(&image, &files)?;
        let hal: &dyn SystemHal = self.hal.as_ref();
        let privileges: &Privileges = &self.privileges;

        let mut ubuntu =
            self.new_image(hal, privileges, &data_dir, ImageRole::System, cfg.system_size);
        let mut userdata =
            self.new_image(hal, privileges, &data_dir, ImageRole::UserData, cfg.userdata_size);
        self.create_system(&mut ubuntu, &mut userdata, &tarballs)?;

        let device_tar = find_device_tarball(&files)?;
        flat_extract_images(device_tar, &data_dir)?;
        require_images(&data_dir, &[BOOT_IMAGE, RECOVERY_IMAGE, SYSTEM_IMAGE])?;

        bootimg::extract(&data_dir.join(BOOT_IMAGE), &data_dir, &BOOT_SEGMENTS)
            .context("cannot extract the boot ramdisk")?;
        bootimg::extract(&data_dir.join(RECOVERY_IMAGE), &data_dir, &RECOVERY_SEGMENTS)
            .context("cannot extract the recovery ramdisk")?;

        let mut system = DiskImage::existing(hal, privileges, data_dir.join(SYSTEM_IMAGE))
            .with_scratch_dir(cfg.scratch_dir.clone());
        system
            .extract_file(BUILD_PROP, &data_dir.join("system"))
            .context("cannot extract build properties")?;

        if !cfg.raw_disk {
            log::info!("creating snapshots for disks");
            for img in [&mut system, &mut userdata] {
                img.convert_to_qcow2()
                    .with_context(|| format!("cannot convert {}", img.path().display()))?;
            }
        }

        if cfg.with_sdcard {
            log::info!("creating vfat sdcard");
            let mut sdcard =
                self.new_image(hal, privileges, &data_dir, ImageRole::SdCard, cfg.sdcard_size);
            sdcard.build()?;
        }

        stamps::write_version_stamp(&data_dir, image.version)?;
        stamps::write_device_stamp(&data_dir, cfg.arch)?;

        log::info!(
            "successfully created emulator instance {} in {}",
            name,
            data_dir.display()
        );
        Ok(CreatedInstance {
            name: name.to_string(),
            data_dir,
            version: image.version,
            files,
        })
    }

    fn new_image<'a>(
        &self,
        hal: &'a dyn SystemHal,
        privileges: &'a Privileges,
        data_dir: &Path,
        role: ImageRole,
        size: u64,
    ) -> DiskImage<'a> {
        DiskImage::new(hal, privileges, data_dir.join(role.file_name()), role, size)
            .with_scratch_dir(self.config.scratch_dir.clone())
    }

    /// Build the Ubuntu and user data images and nest the former in the latter.
    fn create_system<'a>(
        &self,
        ubuntu: &mut DiskImage<'a>,
        userdata: &mut DiskImage<'a>,
        tarballs: &[PathBuf],
    ) -> Result<()> {
        for img in [&mut *ubuntu, &mut *userdata] {
            img.build()
                .with_context(|| format!("cannot build {}", img.path().display()))?;
        }

        let _escalated = self.privileges.escalate()?;

        ubuntu.mount()?;
        if let Err(err) = self.populate_system(ubuntu, tarballs) {
            if let Some(mountpoint) = ubuntu.mountpoint() {
                log::error!("provisioning failed; image mounted at {}", mountpoint.display());
            }
            if let Err(unmount_err) = ubuntu.unmount() {
                log::warn!("unmount error: {}", unmount_err);
            }
            return Err(err);
        }
        ubuntu.unmount()?;

        userdata.mount()?;
        let populated = populate_userdata(ubuntu, userdata);
        let unmounted = userdata.unmount();
        populated?;
        unmounted?;
        Ok(())
    }

    fn populate_system(&self, ubuntu: &DiskImage<'_>, tarballs: &[PathBuf]) -> Result<()> {
        let cfg = &self.config;
        let (Some(base), Some(root)) = (ubuntu.mountpoint(), ubuntu.root()) else {
            return Err(ProvisionError::state("system image is not mounted").into());
        };

        ubuntu.provision(tarballs)?;
        chroot::set_password(self.hal.as_ref(), &root, cfg.arch, &cfg.password)?;
        if let Some(locale) = cfg.locale.as_deref().filter(|l| !l.is_empty()) {
            chroot::set_locale(self.hal.as_ref(), &root, cfg.arch, locale)?;
        }
        BootSetup::new(&cfg.hardware, &cfg.oem).setup(base)?;
        Ok(())
    }
}

fn populate_userdata(ubuntu: &mut DiskImage<'_>, userdata: &DiskImage<'_>) -> Result<()> {
    userdata.mark_writable()?;
    userdata.override_adb_inhibit()?;
    let root = userdata
        .root()
        .ok_or_else(|| ProvisionError::state("user data image is not mounted"))?;
    ubuntu.move_to(root.join(NESTED_SYSTEM_IMAGE))?;
    Ok(())
}

fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ProvisionError::configuration(format!(
            "invalid instance name {:?}",
            name
        ))
        .into());
    }
    Ok(())
}

/// Release tarballs in declared order, looked up by file name in the download set.
fn ordered_tarballs(image: &Image, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    image
        .files_in_order()
        .into_iter()
        .filter(|f| f.file_name().ends_with(".tar.xz"))
        .map(|f| {
            files
                .iter()
                .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(f.file_name()))
                .cloned()
                .ok_or_else(|| {
                    anyhow::Error::from(ProvisionError::download(
                        f.path.as_str(),
                        "missing from download set",
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uemu_core::catalog::{ImageFile, ImageKind};
    use uemu_hal::FakeHal;

    fn image() -> Image {
        let file = |path: &str, order| ImageFile {
            path: path.to_string(),
            signature: None,
            checksum: String::new(),
            size: 0,
            order,
        };
        Image {
            kind: ImageKind::Full,
            version: 42,
            description: String::new(),
            files: vec![
                file("/pool/version-42.tar.xz", 2),
                file("/pool/ubuntu-aa.tar.xz", 0),
                file("/pool/device-bb.tar.xz", 1),
            ],
        }
    }

    #[test]
    fn tarballs_follow_declared_order() {
        let files = vec![
            PathBuf::from("/cache/pool/device-bb.tar.xz"),
            PathBuf::from("/cache/pool/version-42.tar.xz"),
            PathBuf::from("/cache/pool/ubuntu-aa.tar.xz"),
        ];
        assert_eq!(
            ordered_tarballs(&image(), &files).unwrap(),
            vec![
                PathBuf::from("/cache/pool/ubuntu-aa.tar.xz"),
                PathBuf::from("/cache/pool/device-bb.tar.xz"),
                PathBuf::from("/cache/pool/version-42.tar.xz"),
            ]
        );
    }

    #[test]
    fn tarball_missing_from_download_set() {
        let files = vec![PathBuf::from("/cache/pool/ubuntu-aa.tar.xz")];
        assert!(ordered_tarballs(&image(), &files).is_err());
    }

    #[test]
    fn instance_names_are_single_components() {
        assert!(validate_instance_name("x86").is_ok());
        for bad in ["", ".", "..", "a/b"] {
            assert!(validate_instance_name(bad).is_err());
        }
    }

    #[test]
    fn creation_requires_root() {
        let hal = FakeHal::unprivileged(1000, 1000);
        let err = ProvisioningWorkflow::new(Arc::new(hal), ProvisionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Configuration(_))
        ));
    }
}
