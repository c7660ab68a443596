//! uemu host abstraction layer.
//!
//! Every operation that touches the host (external tools, mount syscalls, process
//! identity) goes through the traits in [`hal`], so provisioning code can run
//! against [`FakeHal`] in tests and [`LinuxHal`] in production.

pub mod hal;
pub mod procfs;

pub use hal::*;
pub use uemu_error::{HalError, HalResult};
