//! uemu core library.
//!
//! `uemu-core` holds the building blocks of an emulator instance: privilege
//! handling, partitioning, backing-file disk images, boot image decomposition,
//! boot partition setup, the release catalog and its downloader. The workflow
//! crate sequences them; the binary only parses flags.

pub mod boot_setup;
pub mod bootimg;
pub mod catalog;
pub mod config;
pub mod device_tar;
pub mod disk_image;
pub mod downloader;
pub mod logging;
pub mod partitioning;
pub mod privilege;
pub mod stamps;
pub mod templates;

pub use uemu_error::{ProvisionError, Result};
