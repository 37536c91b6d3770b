//! fleetkit-core: Hosts, contexts and fan-out
//!
//! Compiles high-level intent (path, user, group, umask, env) into a single
//! POSIX shell command and runs it, or an scp transfer, across every host of
//! a [`Context`], returning one [`HostResult`] per host in host order.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod transfer;

pub use config::{ContextConfig, FleetConfig, HostConfig};
pub use context::{Context, ExecutionMode};
pub use error::CoreError;
pub use executor::HostResult;
pub use host::Host;
pub use transfer::{DownloadOptions, TransferSummary, TransferredFile, UploadOptions};

pub use fleetkit_exec::{CommandResult, ConnectOptions, KeySource, Output, Stream, TransferError};
