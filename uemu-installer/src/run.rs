use anyhow::{Context, Result};
use std::sync::Arc;

use uemu_hal::SystemHal;
use uemu_workflow::{CreatedInstance, ProvisioningWorkflow};

use crate::cli::CreateArgs;

pub const LOG_FILE_NAME: &str = "uemu.log";

/// Run `uemu create` against `hal`.
///
/// Nothing is written to disk before privileges are dropped, so the data root
/// and the log file belong to the invoking user.
pub fn create(args: &CreateArgs, hal: Arc<dyn SystemHal>) -> Result<CreatedInstance> {
    let config = args.config()?;
    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(|| config.data_root.join(LOG_FILE_NAME));

    let workflow = ProvisioningWorkflow::new(hal, config)?;
    uemu_core::logging::init(Some(&log_file));
    log::info!("uemu {} creating {}", env!("CARGO_PKG_VERSION"), args.name);

    workflow
        .create(&args.name)
        .with_context(|| format!("cannot create instance {}", args.name))
}
