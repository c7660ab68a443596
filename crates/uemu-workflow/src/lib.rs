//! uemu workflow orchestration.
//!
//! [`create::ProvisioningWorkflow`] sequences the core components into the
//! "create instance" run: preflight, catalog lookup, downloads, image
//! construction and provisioning, boot asset extraction, conversion, stamps.

pub mod chroot;
pub mod create;
pub mod preflight;

#[cfg(test)]
mod test_env;

pub use create::{CreatedInstance, ProvisioningWorkflow};
