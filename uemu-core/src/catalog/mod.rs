//! System-image server catalog.
//!
//! `GET {server}/channels.json` lists channels and the index of every device
//! on them; `GET {server}{index}` lists the device's images.

mod types;

pub use types::{ChannelSpec, Channels, DeviceIndex, DeviceSpec, Image, ImageFile, ImageKind};

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;

use crate::downloader::{http_client, server_url};
use uemu_error::{ProvisionError, Result};

/// Resolves a channel, device and revision selector to a release.
pub trait Catalog {
    fn resolve(&self, channel: &str, device: &str, revision: i64) -> Result<Image>;
}

/// Pick an image from a device index.
///
/// A positive `revision` selects the full image with that version. Zero or a
/// negative value walks back that many full images from the latest one.
pub fn select_image(index: &DeviceIndex, revision: i64) -> Result<Image> {
    let mut full: Vec<&Image> = index
        .images
        .iter()
        .filter(|img| img.kind == ImageKind::Full)
        .collect();

    if revision > 0 {
        return full
            .into_iter()
            .find(|img| img.version as i64 == revision)
            .cloned()
            .ok_or_else(|| ProvisionError::catalog(format!("revision {} not found", revision)));
    }

    full.sort_by_key(|img| std::cmp::Reverse(img.version));
    let back = revision.unsigned_abs() as usize;
    full.get(back).map(|img| (*img).clone()).ok_or_else(|| {
        ProvisionError::catalog(format!(
            "relative revision {} out of range ({} full images)",
            revision,
            full.len()
        ))
    })
}

pub struct HttpCatalog {
    server: String,
    client: Client,
}

impl HttpCatalog {
    pub fn new(server: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            client: http_client(timeout)?,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = server_url(&self.server, path)?;
        log::debug!("GET {}", url);
        let fail = |err: reqwest::Error| ProvisionError::catalog(format!("{}: {}", url, err));
        self.client
            .get(url.clone())
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(fail)?
            .json()
            .map_err(fail)
    }

    pub fn channels(&self) -> Result<Channels> {
        self.get_json("/channels.json")
    }

    pub fn device_index(&self, channel: &str, device: &str) -> Result<DeviceIndex> {
        let channels = self.channels()?;
        let spec = channels
            .get(channel)
            .ok_or_else(|| ProvisionError::catalog(format!("channel {} not found", channel)))?;
        let device_spec = spec.devices.get(device).ok_or_else(|| {
            ProvisionError::catalog(format!(
                "device {} not found on channel {}",
                device, channel
            ))
        })?;
        self.get_json(&device_spec.index)
    }
}

impl Catalog for HttpCatalog {
    fn resolve(&self, channel: &str, device: &str, revision: i64) -> Result<Image> {
        let index = self.device_index(channel, device)?;
        let image = select_image(&index, revision)?;
        log::info!(
            "{} {} resolved to version {} ({} files)",
            channel,
            device,
            image.version,
            image.files.len()
        );
        Ok(image)
    }
}
