use serde::Deserialize;
use std::collections::BTreeMap;

/// One entry of `channels.json`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ChannelSpec {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSpec>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Server-relative path of the device's `index.json`.
    pub index: String,
}

pub type Channels = BTreeMap<String, ChannelSpec>;

/// A device's `index.json`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeviceIndex {
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Full,
    Delta,
}

/// A resolved release.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: ImageKind,
    pub version: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<ImageFile>,
}

/// A file belonging to a release.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ImageFile {
    /// Server-relative path (or an absolute URL on the same server).
    pub path: String,
    #[serde(default)]
    pub signature: Option<String>,
    /// Hex SHA-256 of the file.
    pub checksum: String,
    pub size: u64,
    /// Extraction order within the release.
    pub order: u32,
}

impl ImageFile {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl Image {
    /// Files sorted by their declared extraction order.
    pub fn files_in_order(&self) -> Vec<&ImageFile> {
        let mut files: Vec<&ImageFile> = self.files.iter().collect();
        files.sort_by_key(|f| f.order);
        files
    }
}
