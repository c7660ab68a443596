use serde::Deserialize;
use std::path::PathBuf;

/// Boot requirements of the hardware. Paths are relative to the image mount base.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareDescriptor {
    /// Directory holding the compiled device trees.
    pub dtbs: PathBuf,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
}

impl Default for HardwareDescriptor {
    fn default() -> Self {
        Self {
            dtbs: PathBuf::from("system-a/boot/dtbs"),
            kernel: Some(PathBuf::from("system-a/boot/vmlinuz")),
            initrd: Some(PathBuf::from("system-a/boot/initrd.img")),
        }
    }
}

/// OEM customisations layered over the hardware description.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OemDescriptor {
    /// Platform name; selects `<platform>.dtb`.
    pub platform: Option<String>,
    /// OEM-provided device tree, relative to `install_path`.
    pub dtb: Option<PathBuf>,
    /// Where the OEM package is installed, relative to the image mount base.
    pub install_path: Option<PathBuf>,
    /// Bootable system slots.
    pub system_parts: Vec<String>,
}

impl Default for OemDescriptor {
    fn default() -> Self {
        Self {
            platform: None,
            dtb: None,
            install_path: None,
            system_parts: vec!["a".to_string(), "b".to_string()],
        }
    }
}

impl OemDescriptor {
    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref().filter(|p| !p.is_empty())
    }

    /// `<platform>.dtb`, when a platform is set.
    pub fn platform_dtb(&self) -> Option<String> {
        self.platform().map(|p| format!("{}.dtb", p))
    }
}
