//! Process identity (effective uid/gid) operations.

use crate::HalResult;

/// A uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub const ROOT: Identity = Identity { uid: 0, gid: 0 };

    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Reading and switching the effective identity of the process.
///
/// On Linux/glibc `seteuid`/`setegid` apply to every thread of the process, so callers
/// must serialize transitions (see `uemu_core::privilege`).
pub trait IdentityOps {
    /// Real uid the process was started with.
    fn real_uid(&self) -> u32;

    fn effective_identity(&self) -> Identity;

    /// Switch effective uid/gid. Group is changed while still privileged.
    fn set_effective_identity(&self, identity: Identity) -> HalResult<()>;
}
