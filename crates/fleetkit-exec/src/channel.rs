//! Channel state machine
//!
//! A [`Channel`] drives one remote program (or subsystem) to completion over
//! a borrowed [`Connection`]:
//!
//! ```text
//! Init -> Opened -> Requested(exec|subsystem) -> Running -> Closing -> Closed
//! ```
//!
//! `Errored` is absorbing and reachable from any non-terminal state. The only
//! suspension point is [`Channel::recv`].

use std::time::Instant;

use tracing::{debug, instrument, trace};

use crate::connection::Connection;
use crate::error::ExecError;
use crate::result::{CommandResult, Output};
use crate::traits::{ChannelEvent, ChannelId};

/// Which request a channel is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Exec,
    Subsystem,
}

/// States of a [`Channel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Opened,
    Requested(RequestKind),
    Running,
    Closing,
    Closed,
    Errored,
}

impl ChannelState {
    /// Whether the channel can make no further progress
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Errored)
    }
}

/// Everything received while draining a channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    pub output: Output,
    /// `None` if the peer closed without reporting a status
    pub exit_code: Option<u32>,
}

/// One command or subsystem session on a connection
///
/// Dropping a channel that was not closed queues its id on the connection;
/// the close request goes out before the next channel opens or when the
/// connection closes, since `Drop` cannot wait on the transport.
#[derive(Debug)]
pub struct Channel<'a> {
    connection: &'a mut Connection,
    id: ChannelId,
    state: ChannelState,
    eof: bool,
    exit_code: Option<u32>,
}

impl<'a> Channel<'a> {
    /// Allocate a channel on `connection`
    ///
    /// # Errors
    /// Returns the transport's error if no channel could be opened
    pub async fn open(connection: &'a mut Connection) -> Result<Self, ExecError> {
        let id = connection.transport.open_channel().await?;
        debug!(host = %connection.host(), channel = %id, "channel opened");
        Ok(Self {
            connection,
            id,
            state: ChannelState::Opened,
            eof: false,
            exit_code: None,
        })
    }

    /// Transport-assigned id
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Exit status received so far
    #[must_use]
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Whether the peer has signalled end of data
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Host this channel runs on
    #[must_use]
    pub fn host(&self) -> &str {
        self.connection.host()
    }

    fn expect_state(&self, operation: &'static str, allowed: &[ChannelState]) -> Result<(), ExecError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExecError::ChannelState {
                operation,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, to: ChannelState) {
        trace!(channel = %self.id, from = ?self.state, to = ?to, "channel transition");
        self.state = to;
    }

    /// Record a failure and move to `Errored`
    fn fail(&mut self, err: ExecError) -> ExecError {
        self.transition(ChannelState::Errored);
        err
    }

    /// Start `command` on the remote side
    ///
    /// # Errors
    /// `ChannelState` unless the channel is `Opened`; the transport's error
    /// if the request is refused or fails (channel becomes `Errored`).
    #[instrument(skip(self), fields(host = %self.connection.host(), channel = %self.id))]
    pub async fn exec(&mut self, command: &str) -> Result<(), ExecError> {
        self.expect_state("exec on", &[ChannelState::Opened])?;
        self.transition(ChannelState::Requested(RequestKind::Exec));

        match self.connection.transport.exec(self.id, command).await {
            Ok(()) => {
                self.transition(ChannelState::Running);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Start subsystem `name`
    ///
    /// Returns `Ok(false)` if the peer refused; the channel then goes back to
    /// `Opened` and may be used for another request.
    ///
    /// # Errors
    /// `ChannelState` unless the channel is `Opened`; transport failures.
    #[instrument(skip(self), fields(host = %self.connection.host(), channel = %self.id))]
    pub async fn subsystem(&mut self, name: &str) -> Result<bool, ExecError> {
        self.expect_state("request subsystem on", &[ChannelState::Opened])?;
        self.transition(ChannelState::Requested(RequestKind::Subsystem));

        match self.connection.transport.subsystem(self.id, name).await {
            Ok(true) => {
                self.transition(ChannelState::Running);
                Ok(true)
            }
            Ok(false) => {
                self.transition(ChannelState::Opened);
                Ok(false)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Write to the remote program's input
    ///
    /// # Errors
    /// `ChannelState` unless `Running`; transport failures.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.expect_state("send on", &[ChannelState::Running])?;
        match self.connection.transport.send(self.id, data).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Signal end of input to the remote program
    ///
    /// # Errors
    /// `ChannelState` unless `Running`; transport failures.
    pub async fn send_eof(&mut self) -> Result<(), ExecError> {
        self.expect_state("send eof on", &[ChannelState::Running])?;
        match self.connection.transport.send_eof(self.id).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Wait for the next event on this channel
    ///
    /// # Errors
    /// `ChannelState` unless `Running` or `Closing`; `ChannelProtocol` for
    /// data after eof or a repeated exit status; transport failures.
    pub async fn recv(&mut self) -> Result<ChannelEvent, ExecError> {
        self.expect_state("receive on", &[ChannelState::Running, ChannelState::Closing])?;

        let event = match self.connection.transport.recv(self.id).await {
            Ok(event) => event,
            Err(e) => return Err(self.fail(e)),
        };

        match &event {
            ChannelEvent::Data { stream, bytes } => {
                if self.eof {
                    return Err(self.fail(ExecError::ChannelProtocol(format!(
                        "{} bytes on {stream:?} after eof",
                        bytes.len()
                    ))));
                }
            }
            ChannelEvent::Eof => self.eof = true,
            ChannelEvent::ExitStatus(code) => {
                if let Some(previous) = self.exit_code {
                    return Err(self.fail(ExecError::ChannelProtocol(format!(
                        "second exit status {code} after {previous}"
                    ))));
                }
                self.exit_code = Some(*code);
            }
            ChannelEvent::Closed => self.transition(ChannelState::Closed),
        }

        Ok(event)
    }

    /// Receive until the channel closes, collecting output and exit status
    ///
    /// # Errors
    /// Any error from [`Channel::recv`]
    pub async fn drain(&mut self) -> Result<Drained, ExecError> {
        self.drain_with(|_| {}).await
    }

    /// Like [`Channel::drain`], handing each event to `on_event` as it arrives
    ///
    /// # Errors
    /// Any error from [`Channel::recv`]
    pub async fn drain_with<F>(&mut self, mut on_event: F) -> Result<Drained, ExecError>
    where
        F: FnMut(&ChannelEvent) + Send,
    {
        let mut output = Output::new();
        loop {
            let event = self.recv().await?;
            on_event(&event);
            match event {
                ChannelEvent::Data { stream, bytes } => output.push(stream, bytes),
                ChannelEvent::Closed => break,
                ChannelEvent::Eof | ChannelEvent::ExitStatus(_) => {}
            }
        }

        Ok(Drained {
            output,
            exit_code: self.exit_code,
        })
    }

    /// Exec `command` and drain the channel to completion
    ///
    /// # Errors
    /// Any error from [`Channel::exec`] or [`Channel::drain`]
    pub async fn run(&mut self, command: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        self.exec(command).await?;
        let drained = self.drain().await?;
        let duration = start.elapsed();

        debug!(
            host = %self.connection.host(),
            exit_code = ?drained.exit_code,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            exit_code: drained.exit_code,
            output: drained.output,
            duration,
        })
    }

    /// Ask the peer to close the channel and wait for confirmation
    ///
    /// A no-op once `Closed`. Events arriving while closing are discarded
    /// apart from the exit status.
    ///
    /// # Errors
    /// `ChannelState` if already `Closing`; transport failures. On an
    /// `Errored` channel the close request is still sent but the state stays
    /// `Errored`.
    pub async fn close(&mut self) -> Result<(), ExecError> {
        match self.state {
            ChannelState::Closed => return Ok(()),
            ChannelState::Errored => {
                return self.connection.transport.close_channel(self.id).await;
            }
            ChannelState::Closing => {
                return Err(ExecError::ChannelState {
                    operation: "close",
                    state: self.state,
                });
            }
            _ => {}
        }

        self.transition(ChannelState::Closing);
        if let Err(e) = self.connection.transport.close_channel(self.id).await {
            return Err(self.fail(e));
        }

        while self.state != ChannelState::Closed {
            self.recv().await?;
        }
        Ok(())
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        if !matches!(self.state, ChannelState::Closed | ChannelState::Closing) {
            debug!(host = %self.connection.host(), channel = %self.id, state = ?self.state, "channel dropped while open");
            self.connection.abandoned.push(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::options::ConnectOptions;
    use crate::recording::{Invocation, RecordingConnector};
    use crate::result::Stream;

    async fn connect(connector: RecordingConnector) -> Connection {
        Connection::open_with("h1", &ConnectOptions::default(), Arc::new(connector))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_status_then_closed() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![
                ChannelEvent::stdout("hello\n"),
                ChannelEvent::Eof,
                ChannelEvent::ExitStatus(0),
                ChannelEvent::Closed,
            ]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();

        let result = channel.run("echo hello").await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout(), "hello\n");
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_closed_without_status() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![ChannelEvent::stdout("partial"), ChannelEvent::Closed]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();

        let result = channel.run("sleep 100").await.unwrap();

        assert_eq!(result.exit_code, None);
        assert_eq!(result.stdout(), "partial");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![
                ChannelEvent::stderr("boom\n"),
                ChannelEvent::ExitStatus(42),
                ChannelEvent::Closed,
            ]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();

        let result = channel.run("exit 42").await.unwrap();

        assert_eq!(result.exit_code, Some(42));
        assert!(!result.success());
        assert_eq!(result.stderr(), "boom\n");
    }

    #[tokio::test]
    async fn test_interleaving_preserved() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![
                ChannelEvent::stdout("a"),
                ChannelEvent::stderr("b"),
                ChannelEvent::stdout("c"),
                ChannelEvent::ExitStatus(0),
                ChannelEvent::Closed,
            ]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("x").await.unwrap();

        let drained = channel.drain().await.unwrap();

        assert_eq!(
            drained.output.chunks(),
            &[
                (Stream::Stdout, b"a".to_vec()),
                (Stream::Stderr, b"b".to_vec()),
                (Stream::Stdout, b"c".to_vec()),
            ]
        );
        assert_eq!(drained.output.stdout(), b"ac");
        assert_eq!(drained.output.stderr(), b"b");
    }

    #[tokio::test]
    async fn test_drain_with_sees_every_event() {
        let connector = RecordingConnector::new();
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("true").await.unwrap();

        let mut seen = Vec::new();
        let drained = channel.drain_with(|e| seen.push(e.clone())).await.unwrap();

        assert_eq!(
            seen,
            vec![ChannelEvent::Eof, ChannelEvent::ExitStatus(0), ChannelEvent::Closed]
        );
        assert_eq!(drained.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_send_requires_running() {
        let mut conn = connect(RecordingConnector::new()).await;
        let mut channel = conn.channel().await.unwrap();

        let err = channel.send(b"data").await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::ChannelState {
                state: ChannelState::Opened,
                ..
            }
        ));

        let err = channel.recv().await.unwrap_err();
        assert!(matches!(err, ExecError::ChannelState { .. }));
    }

    #[tokio::test]
    async fn test_exec_twice_rejected() {
        let mut conn = connect(RecordingConnector::new()).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("true").await.unwrap();

        let err = channel.exec("true").await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::ChannelState {
                state: ChannelState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_data_after_eof_is_protocol_error() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![ChannelEvent::Eof, ChannelEvent::stdout("late"), ChannelEvent::Closed]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("x").await.unwrap();

        let err = channel.drain().await.unwrap_err();

        assert!(matches!(err, ExecError::ChannelProtocol(_)));
        assert_eq!(channel.state(), ChannelState::Errored);
    }

    #[tokio::test]
    async fn test_second_exit_status_is_protocol_error() {
        let connector = RecordingConnector::scripted(|_host, _cmd| {
            vec![ChannelEvent::ExitStatus(0), ChannelEvent::ExitStatus(1), ChannelEvent::Closed]
        });
        let mut conn = connect(connector).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("x").await.unwrap();

        let err = channel.drain().await.unwrap_err();
        assert!(matches!(err, ExecError::ChannelProtocol(_)));
    }

    #[tokio::test]
    async fn test_close_waits_for_confirmation() {
        let connector = RecordingConnector::scripted(|_host, _cmd| vec![ChannelEvent::stdout("x")]);
        let mut conn = connect(connector.clone()).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("cat").await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);

        // closing again is a no-op
        channel.close().await.unwrap();

        assert!(
            connector
                .invocations()
                .iter()
                .any(|i| matches!(i, Invocation::CloseChannel { .. }))
        );
    }

    #[tokio::test]
    async fn test_dropped_channel_is_closed_before_next() {
        let connector = RecordingConnector::scripted(|_host, _cmd| vec![ChannelEvent::stdout("x")]);
        let mut conn = connect(connector.clone()).await;
        {
            let mut channel = conn.channel().await.unwrap();
            channel.exec("tail -f log").await.unwrap();
        }
        let second = conn.channel().await.unwrap();
        assert_eq!(second.id(), ChannelId(1));
        drop(second);
        conn.close().await.unwrap();

        let lifecycle: Vec<_> = connector
            .invocations()
            .into_iter()
            .filter_map(|i| match i {
                Invocation::OpenChannel { channel, .. } => Some(format!("open {channel}")),
                Invocation::CloseChannel { channel, .. } => Some(format!("close {channel}")),
                _ => None,
            })
            .collect();
        assert_eq!(lifecycle, ["open 0", "close 0", "open 1", "close 1"]);
    }

    #[tokio::test]
    async fn test_subsystem_refused_returns_to_opened() {
        let mut conn = connect(RecordingConnector::new()).await;
        let mut channel = conn.channel().await.unwrap();

        assert!(!channel.subsystem("sftp").await.unwrap());
        assert_eq!(channel.state(), ChannelState::Opened);

        channel.exec("true").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Running);
    }

    #[tokio::test]
    async fn test_send_is_recorded() {
        let connector = RecordingConnector::new();
        let mut conn = connect(connector.clone()).await;
        let mut channel = conn.channel().await.unwrap();
        channel.exec("cat").await.unwrap();
        channel.send(b"input").await.unwrap();
        channel.send_eof().await.unwrap();
        channel.drain().await.unwrap();

        assert!(connector.invocations().iter().any(|i| matches!(
            i,
            Invocation::Send { data, .. } if data == b"input"
        )));
    }
}
