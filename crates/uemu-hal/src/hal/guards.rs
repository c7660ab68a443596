use crate::{LoopOps, MountOps};
use std::path::{Path, PathBuf};

/// RAII guard that unmounts a target path (and anything nested below it) when dropped.
#[derive(Debug)]
pub struct MountGuard<'a, H: MountOps + ?Sized> {
    hal: &'a H,
    target: PathBuf,
    active: bool,
}

impl<'a, H: MountOps + ?Sized> MountGuard<'a, H> {
    pub fn new(hal: &'a H, target: impl Into<PathBuf>) -> Self {
        Self {
            hal,
            target: target.into(),
            active: true,
        }
    }

    /// Prevent automatic unmounting and return the target path.
    pub fn release(mut self) -> PathBuf {
        self.active = false;
        self.target.clone()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl<'a, H: MountOps + ?Sized> Drop for MountGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.unmount_recursive(&self.target) {
            log::warn!(
                "mount guard failed to unmount {}: {}",
                self.target.display(),
                err
            );
        }
    }
}

/// RAII guard that detaches a loop device when dropped.
#[derive(Debug)]
pub struct LoopGuard<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    loop_device: String,
    active: bool,
}

impl<'a, H: LoopOps + ?Sized> LoopGuard<'a, H> {
    pub fn new(hal: &'a H, loop_device: impl Into<String>) -> Self {
        Self {
            hal,
            loop_device: loop_device.into(),
            active: true,
        }
    }

    /// Prevent automatic detach and return the loop device path.
    pub fn release(mut self) -> String {
        self.active = false;
        self.loop_device.clone()
    }

    pub fn device(&self) -> &str {
        &self.loop_device
    }
}

impl<'a, H: LoopOps + ?Sized> Drop for LoopGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.losetup_detach(&self.loop_device) {
            log::warn!("loop guard failed to detach {}: {}", self.loop_device, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeHal, MountOptions, Operation};
    use std::path::Path;

    #[test]
    fn mount_guard_unmounts_nested_on_drop() {
        let hal = FakeHal::new();
        let base = Path::new("/mnt/uemu");

        hal.mount_device(
            Path::new("/dev/loop0p1"),
            &base.join("boot"),
            "vfat",
            &MountOptions::new(),
        )
        .unwrap();
        hal.mount_device(
            Path::new("/dev/loop0p2"),
            &base.join("system-a"),
            "ext4",
            &MountOptions::new(),
        )
        .unwrap();

        {
            let _guard = MountGuard::new(&hal, base);
        }

        assert!(!hal.is_mounted(&base.join("boot")).unwrap());
        assert!(!hal.is_mounted(&base.join("system-a")).unwrap());
    }

    #[test]
    fn mount_guard_release_skips_unmount() {
        let hal = FakeHal::new();
        let target = Path::new("/mnt/keep");

        hal.mount_device(
            Path::new("/dev/loop1"),
            target,
            "ext4",
            &MountOptions::new(),
        )
        .unwrap();

        {
            let guard = MountGuard::new(&hal, target);
            let _ = guard.release();
        }

        assert!(hal.is_mounted(target).unwrap());
    }

    #[test]
    fn loop_guard_detaches_on_drop() {
        let hal = FakeHal::new();
        let loop_dev = hal
            .losetup_attach(Path::new("/tmp/image.img"), true, false)
            .unwrap();

        {
            let _guard = LoopGuard::new(&hal, loop_dev.clone());
        }

        assert!(hal.has_operation(
            |op| matches!(op, Operation::LosetupDetach { loop_device } if *loop_device == loop_dev)
        ));
        assert!(hal.attached_loops().is_empty());
    }
}
