//! Boot partition population: kernel/initrd, device trees and bootloader variables.

mod descriptors;

pub use descriptors::{HardwareDescriptor, OemDescriptor};

use std::fs;
use std::path::{Path, PathBuf};

use crate::templates::render_snappy_system;
use uemu_error::{ProvisionError, Result};

pub const KERNEL_FILE_NAME: &str = "vmlinuz";
pub const INITRD_FILE_NAME: &str = "initrd.img";
pub const BOOT_CONFIG_FILE_NAME: &str = "snappy-system.txt";
/// Mount subdirectory of the boot partition.
pub const BOOT_DIR: &str = "boot";

/// Which device tree blobs were installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtbSelection {
    /// The hardware has no device tree directory.
    NoDeviceTrees,
    OemOverride(PathBuf),
    Platform(PathBuf),
    /// Everything in the device tree directory, by file name.
    All(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
pub struct BootSetup<'a> {
    hardware: &'a HardwareDescriptor,
    oem: &'a OemDescriptor,
}

impl<'a> BootSetup<'a> {
    pub fn new(hardware: &'a HardwareDescriptor, oem: &'a OemDescriptor) -> Self {
        Self { hardware, oem }
    }

    pub fn render_boot_config(&self) -> String {
        let fdt = self
            .oem
            .platform_dtb()
            .map(|dtb| format!("fdtfile={}", dtb))
            .unwrap_or_default();
        render_snappy_system(KERNEL_FILE_NAME, INITRD_FILE_NAME, &fdt)
    }

    /// Write the bootloader variable script into the boot partition.
    pub fn generate_boot_config(&self, boot_path: &Path) -> Result<PathBuf> {
        let path = boot_path.join(BOOT_CONFIG_FILE_NAME);
        fs::write(&path, self.render_boot_config())?;
        Ok(path)
    }

    /// Copy kernel and initrd into every system slot of the boot partition.
    ///
    /// Sources the image does not carry are skipped.
    pub fn generic_boot_setup(&self, base: &Path, boot_path: &Path) -> Result<()> {
        let sources = [
            (self.hardware.kernel.as_ref(), KERNEL_FILE_NAME),
            (self.hardware.initrd.as_ref(), INITRD_FILE_NAME),
        ];
        for part in &self.oem.system_parts {
            let slot = boot_path.join(part);
            fs::create_dir_all(&slot)?;
            for (source, name) in sources {
                let Some(source) = source else { continue };
                let src = base.join(source);
                if !src.is_file() {
                    log::debug!("{} not present, skipping", src.display());
                    continue;
                }
                fs::copy(&src, slot.join(name))?;
            }
        }
        Ok(())
    }

    /// Install device tree blobs into `dest`.
    ///
    /// Precedence: OEM override, then `<platform>.dtb`, then every file in the
    /// hardware's device tree directory. A missing directory installs nothing.
    pub fn provision_device_tree_blobs(&self, base: &Path, dest: &Path) -> Result<DtbSelection> {
        let dtbs_path = base.join(&self.hardware.dtbs);
        if !dtbs_path.exists() {
            return Ok(DtbSelection::NoDeviceTrees);
        }
        fs::create_dir_all(dest)?;

        if let (Some(oem_dtb), Some(platform_dtb)) = (&self.oem.dtb, self.oem.platform_dtb()) {
            let install_path = self.oem.install_path.as_ref().ok_or_else(|| {
                ProvisionError::configuration("OEM device tree set without an install path")
            })?;
            let src = base.join(install_path).join(oem_dtb);
            let dst = dest.join(platform_dtb);
            fs::copy(&src, &dst)?;
            return Ok(DtbSelection::OemOverride(dst));
        }

        if let Some(platform_dtb) = self.oem.platform_dtb() {
            let src = dtbs_path.join(&platform_dtb);
            if src.is_file() {
                let dst = dest.join(platform_dtb);
                fs::copy(&src, &dst)?;
                return Ok(DtbSelection::Platform(dst));
            }
        }

        let mut copied = Vec::new();
        for entry in fs::read_dir(&dtbs_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            fs::copy(entry.path(), dest.join(entry.file_name()))?;
            copied.push(entry.file_name().to_string_lossy().into_owned());
        }
        copied.sort();
        Ok(DtbSelection::All(copied))
    }

    /// Populate `<base>/boot` of a mounted system image.
    pub fn setup(&self, base: &Path) -> Result<()> {
        let boot_path = base.join(BOOT_DIR);
        log::info!("setting up boot partition at {}", boot_path.display());

        self.generic_boot_setup(base, &boot_path)?;
        for part in &self.oem.system_parts {
            let selection =
                self.provision_device_tree_blobs(base, &boot_path.join(part).join("dtbs"))?;
            log::debug!("slot {}: {:?}", part, selection);
        }
        self.generate_boot_config(&boot_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, body: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn seeded_dtbs(base: &Path) {
        let dtbs = base.join("system-a/boot/dtbs");
        write(&dtbs.join("am335x-boneblack.dtb"), b"bbb");
        write(&dtbs.join("vexpress-a9.dtb"), b"vexpress");
    }

    #[test]
    fn oem_override_wins_and_nothing_else_is_copied() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        seeded_dtbs(base);
        write(&base.join("oem/dtbs/custom.dtb"), b"oem");

        let hw = HardwareDescriptor::default();
        let oem = OemDescriptor {
            platform: Some("vexpress-a9".to_string()),
            dtb: Some(PathBuf::from("dtbs/custom.dtb")),
            install_path: Some(PathBuf::from("oem")),
            ..Default::default()
        };
        let dest = base.join("out");
        let sel = BootSetup::new(&hw, &oem)
            .provision_device_tree_blobs(base, &dest)
            .unwrap();

        assert_eq!(sel, DtbSelection::OemOverride(dest.join("vexpress-a9.dtb")));
        assert_eq!(names(&dest), vec!["vexpress-a9.dtb".to_string()]);
        assert_eq!(fs::read(dest.join("vexpress-a9.dtb")).unwrap(), b"oem");
    }

    #[test]
    fn platform_blob_only() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        seeded_dtbs(base);

        let hw = HardwareDescriptor::default();
        let oem = OemDescriptor {
            platform: Some("am335x-boneblack".to_string()),
            ..Default::default()
        };
        let dest = base.join("out");
        let sel = BootSetup::new(&hw, &oem)
            .provision_device_tree_blobs(base, &dest)
            .unwrap();

        assert!(matches!(sel, DtbSelection::Platform(_)));
        assert_eq!(names(&dest), vec!["am335x-boneblack.dtb".to_string()]);
    }

    #[test]
    fn falls_back_to_every_blob() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        seeded_dtbs(base);

        let hw = HardwareDescriptor::default();
        let oem = OemDescriptor {
            platform: Some("imx6".to_string()),
            ..Default::default()
        };
        let dest = base.join("out");
        let sel = BootSetup::new(&hw, &oem)
            .provision_device_tree_blobs(base, &dest)
            .unwrap();

        let expected = vec![
            "am335x-boneblack.dtb".to_string(),
            "vexpress-a9.dtb".to_string(),
        ];
        assert_eq!(sel, DtbSelection::All(expected.clone()));
        assert_eq!(names(&dest), expected);
    }

    #[test]
    fn missing_dtbs_dir_is_a_noop() {
        let dir = tempdir().unwrap();
        let hw = HardwareDescriptor::default();
        let oem = OemDescriptor::default();
        let dest = dir.path().join("out");
        let sel = BootSetup::new(&hw, &oem)
            .provision_device_tree_blobs(dir.path(), &dest)
            .unwrap();
        assert_eq!(sel, DtbSelection::NoDeviceTrees);
        assert!(!dest.exists());
    }

    #[test]
    fn boot_config_fdt_line_follows_platform() {
        let hw = HardwareDescriptor::default();
        let with = OemDescriptor {
            platform: Some("am335x-boneblack".to_string()),
            ..Default::default()
        };
        assert!(BootSetup::new(&hw, &with)
            .render_boot_config()
            .contains("\nfdtfile=am335x-boneblack.dtb\n"));

        let without = OemDescriptor::default();
        assert!(!BootSetup::new(&hw, &without)
            .render_boot_config()
            .contains("fdtfile="));
    }

    #[test]
    fn setup_populates_both_slots() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        seeded_dtbs(base);
        write(&base.join("system-a/boot/vmlinuz"), b"kernel");
        fs::create_dir_all(base.join("boot")).unwrap();

        let hw = HardwareDescriptor::default();
        let oem = OemDescriptor::default();
        BootSetup::new(&hw, &oem).setup(base).unwrap();

        for slot in ["a", "b"] {
            let slot_dir = base.join("boot").join(slot);
            assert_eq!(fs::read(slot_dir.join("vmlinuz")).unwrap(), b"kernel");
            assert!(!slot_dir.join("initrd.img").exists());
            assert_eq!(names(&slot_dir.join("dtbs")).len(), 2);
        }
        assert!(base.join("boot/snappy-system.txt").is_file());
    }
}
