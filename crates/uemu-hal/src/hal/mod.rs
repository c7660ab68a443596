//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for host operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod convert_ops;
pub mod fake_hal;
pub mod format_ops;
pub mod guards;
pub mod identity_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;
pub mod partition_ops;
pub mod process_ops;

pub use convert_ops::{ConvertOps, ImageFormat};
pub use fake_hal::{FailPoint, FakeHal, Operation};
pub use format_ops::{FormatOps, FormatOptions};
pub use guards::{LoopGuard, MountGuard};
pub use identity_ops::{Identity, IdentityOps};
pub use linux_hal::LinuxHal;
pub use loop_ops::{partition_device, LoopOps};
pub use mount_ops::{MountOps, MountOptions};
pub use partition_ops::{PartedOp, PartitionOps};
pub use process_ops::ProcessOps;

/// Complete HAL combining every host operation the provisioner needs.
pub trait SystemHal:
    MountOps + LoopOps + FormatOps + PartitionOps + ConvertOps + ProcessOps + IdentityOps + Send + Sync
{
}

/// Automatically implement SystemHal for any type implementing all required traits.
impl<T> SystemHal for T where
    T: MountOps
        + LoopOps
        + FormatOps
        + PartitionOps
        + ConvertOps
        + ProcessOps
        + IdentityOps
        + Send
        + Sync
{
}
