//! fleetkit-exec: Connections, channels and file transfer
//!
//! Opens connections over SSH (russh) or a no-network recording transport,
//! drives remote commands through a per-channel state machine, and speaks the
//! SCP wire protocol for uploads and downloads.

pub mod channel;
pub mod connection;
pub mod error;
pub mod escape;
pub mod keys;
pub mod options;
pub mod recording;
pub mod result;
pub mod scp;
pub mod ssh;
pub mod traits;

pub use channel::{Channel, ChannelState, Drained, RequestKind};
pub use connection::{Connection, normalize_host};
pub use error::{ExecError, TransferError};
pub use escape::{quote, quote_word, split_word};
pub use keys::KeySource;
pub use options::{ConnectOptions, DEFAULT_PORT, ToolkitOptions, TransportOptions};
pub use recording::{DryRunResponder, Invocation, RecordingConnector, RemoteEntry, RemoteNode};
pub use result::{CommandResult, Output, Stream};
pub use scp::{FileAttrs, FileTimes, ScpFlags, ScpMode, ScpSink, ScpSource, SinkEvent};
pub use ssh::RusshConnector;
pub use traits::{ChannelEvent, ChannelId, ConnectTarget, Connector, Transport};
