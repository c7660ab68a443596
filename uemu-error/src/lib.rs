use std::io;
use thiserror::Error;

pub type HalResult<T> = std::result::Result<T, HalError>;
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Failures raised by host operations (external tools, syscalls).
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device or mount point is busy")]
    DiskBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Failures surfaced by the provisioning components to the workflow.
///
/// None of these are retried; every variant is fatal for the instance being built.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Missing host dependency, unsupported architecture or insufficient privilege.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A privilege transition could not be performed.
    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Partitioning failed: {message}{}", format_tool_output(.output))]
    Partitioning { message: String, output: String },

    #[error("Mount error: {0}")]
    Mount(String),

    /// Boot image (or other binary container) does not match its declared layout.
    #[error("Format error: {0}")]
    Format(String),

    #[error(transparent)]
    Tool(#[from] HalError),

    #[error("Download of {url} failed: {message}")]
    Download { url: String, message: String },

    /// An operation was invoked from the wrong disk image state.
    #[error("Invalid image state: {0}")]
    State(String),
}

impl ProvisionError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn partitioning(msg: impl Into<String>) -> Self {
        Self::Partitioning {
            message: msg.into(),
            output: String::new(),
        }
    }

    pub fn download(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            message: msg.into(),
        }
    }
}

fn format_tool_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(": {}", output)
    }
}
