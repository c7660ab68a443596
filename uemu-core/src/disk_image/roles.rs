use crate::partitioning::{FsKind, PartSize, PartitionSpec, TableKind};

/// What an image is for, which fixes its file name and layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Ubuntu root filesystem; later moved into the user data image as `system.img`.
    System,
    /// Android user data, presented to the emulator as `sdcard.img`.
    UserData,
    /// Optional external vfat card.
    SdCard,
    /// Unpartitioned filesystem shipped by the device tarball.
    Existing,
}

impl ImageRole {
    pub fn file_name(&self) -> &'static str {
        match self {
            ImageRole::System => "ubuntu-system.img",
            ImageRole::UserData => "sdcard.img",
            ImageRole::SdCard => "sdcardprime.img",
            ImageRole::Existing => "system.img",
        }
    }

    pub fn partition_spec(&self) -> Option<PartitionSpec> {
        match self {
            ImageRole::System => Some(
                PartitionSpec::new(TableKind::Msdos)
                    .add("boot", "boot", FsKind::Vfat, PartSize::MiB(128))
                    .add("system-a", "system-a", FsKind::Ext4, PartSize::MiB(1024))
                    .add("system-b", "system-b", FsKind::Ext4, PartSize::MiB(1024))
                    .add("writable", "writable", FsKind::Ext4, PartSize::Rest)
                    .bootable(1),
            ),
            ImageRole::UserData => Some(
                PartitionSpec::new(TableKind::Msdos)
                    .add("persist", "persist", FsKind::Ext4, PartSize::MiB(32))
                    .add("cache", "cache", FsKind::Ext4, PartSize::MiB(512))
                    .add("userdata", "userdata", FsKind::Ext4, PartSize::Rest),
            ),
            ImageRole::SdCard => Some(
                PartitionSpec::new(TableKind::Msdos)
                    .add("SDCARD", "sdcard", FsKind::Vfat, PartSize::Rest),
            ),
            ImageRole::Existing => None,
        }
    }

    /// Mount subdirectory holding the root filesystem; `None` for whole-device mounts.
    pub fn root_subdir(&self) -> Option<&'static str> {
        match self {
            ImageRole::System => Some("system-a"),
            ImageRole::UserData => Some("userdata"),
            ImageRole::SdCard => Some("sdcard"),
            ImageRole::Existing => None,
        }
    }

    /// Filesystem type used when the whole device is mounted.
    pub fn whole_fs_type(&self) -> &'static str {
        "ext4"
    }
}
