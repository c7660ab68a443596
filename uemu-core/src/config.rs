//! Provisioning configuration.
//!
//! A single [`ProvisionConfig`] value is built once (defaults, then an optional
//! TOML file, then command-line overrides) and passed to every component.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::boot_setup::{HardwareDescriptor, OemDescriptor};
use uemu_error::{ProvisionError, Result};

pub const DEFAULT_CHANNEL: &str = "ubports-touch/16.04/stable";
pub const DEFAULT_SERVER: &str = "https://system-image.ubports.com";
pub const DEFAULT_PASSWORD: &str = "0000";

const MIB: u64 = 1024 * 1024;

/// Emulated device architecture.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    #[default]
    I386,
    Armhf,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::I386 => "i386",
            Arch::Armhf => "armhf",
        }
    }

    /// Catalog device name serving this architecture.
    pub fn device(&self) -> &'static str {
        match self {
            Arch::I386 => "generic_x86",
            Arch::Armhf => "generic",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "i386" => Ok(Arch::I386),
            "armhf" => Ok(Arch::Armhf),
            other => Err(ProvisionError::configuration(format!(
                "architecture {} not supported on this channel (expected i386 or armhf)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvisionConfig {
    pub channel: String,
    pub server: String,
    /// Positive: exact version. Zero or negative: offset back from the latest.
    pub revision: i64,
    pub raw_disk: bool,
    pub with_sdcard: bool,
    pub arch: Arch,
    pub password: String,
    pub locale: Option<String>,
    pub data_root: PathBuf,
    pub cache_dir: PathBuf,
    /// Parent of temporary mount points; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub system_size: u64,
    pub userdata_size: u64,
    pub sdcard_size: u64,
    pub http_timeout_secs: u64,
    pub hardware: HardwareDescriptor,
    pub oem: OemDescriptor,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            server: DEFAULT_SERVER.to_string(),
            revision: 0,
            raw_disk: false,
            with_sdcard: false,
            arch: Arch::default(),
            password: DEFAULT_PASSWORD.to_string(),
            locale: None,
            data_root: xdg_dir("XDG_DATA_HOME", ".local/share").join("ubuntu-emulator"),
            cache_dir: xdg_dir("XDG_CACHE_HOME", ".cache").join("ubuntuimages"),
            scratch_dir: None,
            system_size: 3072 * MIB,
            userdata_size: 6144 * MIB,
            sdcard_size: 512 * MIB,
            http_timeout_secs: 600,
            hardware: HardwareDescriptor::default(),
            oem: OemDescriptor::default(),
        }
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/root".into());
    PathBuf::from(home).join(fallback)
}

impl ProvisionConfig {
    /// Parse a TOML config; absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|err| ProvisionError::configuration(format!("invalid config: {}", err)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            ProvisionError::configuration(format!("cannot read {}: {}", path.display(), err))
        })?;
        Self::from_toml_str(&content)
    }

    /// Per-instance data directory.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_channel() {
        let cfg = ProvisionConfig::default();
        assert_eq!(cfg.channel, "ubports-touch/16.04/stable");
        assert_eq!(cfg.server, "https://system-image.ubports.com");
        assert_eq!(cfg.arch, Arch::I386);
        assert_eq!(cfg.password, "0000");
        assert_eq!(cfg.revision, 0);
        assert!(!cfg.raw_disk);
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let cfg = ProvisionConfig::from_toml_str(
            r#"
            arch = "armhf"
            revision = -1
            locale = "es_AR.utf8"
            data_root = "/srv/emulators"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.arch, Arch::Armhf);
        assert_eq!(cfg.revision, -1);
        assert_eq!(cfg.locale.as_deref(), Some("es_AR.utf8"));
        assert_eq!(cfg.instance_dir("x86"), PathBuf::from("/srv/emulators/x86"));
        assert_eq!(cfg.channel, DEFAULT_CHANNEL);
    }

    #[test]
    fn unknown_arch_is_configuration_error() {
        assert!(matches!(
            "arm64".parse::<Arch>(),
            Err(ProvisionError::Configuration(_))
        ));
        assert!(matches!(
            ProvisionConfig::from_toml_str("arch = \"mips\""),
            Err(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn arch_maps_to_catalog_device() {
        assert_eq!(Arch::I386.device(), "generic_x86");
        assert_eq!(Arch::Armhf.device(), "generic");
    }
}
