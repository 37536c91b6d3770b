//! Transport capability traits
//!
//! A [`Connector`] establishes a connection and hands back a boxed
//! [`Transport`], which exposes the channel sub-interface the rest of the
//! crate is written against. Real SSH and the dry-run recorder are both
//! just implementations of these two traits.

use std::fmt;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::options::TransportOptions;
use crate::result::Stream;

/// Identifier of a channel within one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on stdout or stderr
    Data { stream: Stream, bytes: Vec<u8> },
    /// Peer will send no more data
    Eof,
    /// Exit status of the remote program; not terminal
    ExitStatus(u32),
    /// Channel is closed; terminal
    Closed,
}

impl ChannelEvent {
    /// Shorthand for a stdout chunk
    pub fn stdout(bytes: impl Into<Vec<u8>>) -> Self {
        ChannelEvent::Data {
            stream: Stream::Stdout,
            bytes: bytes.into(),
        }
    }

    /// Shorthand for a stderr chunk
    pub fn stderr(bytes: impl Into<Vec<u8>>) -> Self {
        ChannelEvent::Data {
            stream: Stream::Stderr,
            bytes: bytes.into(),
        }
    }
}

/// Endpoint to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Normalized host name
    pub host: String,
    /// Transport options with defaults applied
    pub options: TransportOptions,
}

/// Establishes transports
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connect and authenticate
    ///
    /// # Errors
    /// `ConnectionFailed` / `AuthenticationFailed` with the transport's reason
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, ExecError>;

    /// Short name for logs
    fn transport_type(&self) -> &'static str;
}

/// One established connection and its channels
#[async_trait]
pub trait Transport: Send {
    /// Allocate a new session channel
    async fn open_channel(&mut self) -> Result<ChannelId, ExecError>;

    /// Request execution of `command`; returns once the peer accepted it
    async fn exec(&mut self, id: ChannelId, command: &str) -> Result<(), ExecError>;

    /// Request a subsystem; `Ok(false)` if the peer refused
    async fn subsystem(&mut self, id: ChannelId, name: &str) -> Result<bool, ExecError>;

    /// Write to the channel's input
    async fn send(&mut self, id: ChannelId, data: &[u8]) -> Result<(), ExecError>;

    /// Signal end of input
    async fn send_eof(&mut self, id: ChannelId) -> Result<(), ExecError>;

    /// Wait for the next event on channel `id`
    async fn recv(&mut self, id: ChannelId) -> Result<ChannelEvent, ExecError>;

    /// Ask the peer to close channel `id`
    async fn close_channel(&mut self, id: ChannelId) -> Result<(), ExecError>;

    /// Tear down the connection
    async fn close(&mut self) -> Result<(), ExecError>;
}
