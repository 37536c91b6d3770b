//! No-network transport for dry runs and tests
//!
//! [`RecordingConnector`] never touches the network. Every call made against
//! it is appended to a shared [`Invocation`] log, and channel replies come from
//! a [`Responder`], which hands out one [`RemoteSession`] per exec request.
//!
//! The default responder ([`DryRunResponder`]) answers every command with
//! `eof, exit_status 0, closed`, so a dry run looks exactly like a remote
//! that succeeded silently. It also speaks enough SCP to accept uploads into
//! memory and to serve a configured tree for downloads.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ExecError;
use crate::scp::{FileTimes, Record, ScpFlags, ScpMode, detect_mode};
use crate::traits::{ChannelEvent, ChannelId, ConnectTarget, Connector, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call made against the recording transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Connect {
        host: String,
        port: u16,
        user: Option<String>,
    },
    OpenChannel {
        host: String,
        channel: ChannelId,
    },
    Exec {
        host: String,
        channel: ChannelId,
        command: String,
    },
    Subsystem {
        host: String,
        channel: ChannelId,
        name: String,
    },
    Send {
        host: String,
        channel: ChannelId,
        data: Vec<u8>,
    },
    SendEof {
        host: String,
        channel: ChannelId,
    },
    CloseChannel {
        host: String,
        channel: ChannelId,
    },
    Close {
        host: String,
    },
}

/// Simulated remote program behind one channel
pub trait RemoteSession: Send {
    /// Events emitted right after the request is accepted
    fn start(&mut self) -> Vec<ChannelEvent>;

    /// Events emitted in reply to input
    fn input(&mut self, _data: &[u8]) -> Vec<ChannelEvent> {
        Vec::new()
    }

    /// Events emitted when input ends
    fn eof(&mut self) -> Vec<ChannelEvent> {
        Vec::new()
    }
}

/// Emits a fixed list of events on start and ignores input
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession(pub Vec<ChannelEvent>);

impl ScriptedSession {
    /// `eof, exit_status 0, closed`
    #[must_use]
    pub fn success() -> Self {
        Self(vec![
            ChannelEvent::Eof,
            ChannelEvent::ExitStatus(0),
            ChannelEvent::Closed,
        ])
    }
}

impl RemoteSession for ScriptedSession {
    fn start(&mut self) -> Vec<ChannelEvent> {
        std::mem::take(&mut self.0)
    }
}

/// Decides how the simulated remote answers requests
pub trait Responder: Send + Sync {
    /// Session for an exec request
    fn exec(&self, host: &str, command: &str) -> Box<dyn RemoteSession>;

    /// Session for a subsystem request; `None` refuses it
    fn subsystem(&self, _host: &str, _name: &str) -> Option<Box<dyn RemoteSession>> {
        None
    }
}

/// Responder built from a closure returning the events for each command
pub struct FnResponder<F>(pub F);

impl<F> Responder for FnResponder<F>
where
    F: Fn(&str, &str) -> Vec<ChannelEvent> + Send + Sync,
{
    fn exec(&self, host: &str, command: &str) -> Box<dyn RemoteSession> {
        Box::new(ScriptedSession((self.0)(host, command)))
    }
}

/// Remote file or directory served to `scp -f`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub name: String,
    pub mode: u32,
    pub times: FileTimes,
    pub kind: NodeKind,
}

/// Contents of a [`RemoteNode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File(Vec<u8>),
    Dir(Vec<RemoteNode>),
    /// Reported as "No such file or directory"
    Missing,
}

impl RemoteNode {
    /// Regular file with mode 0644
    pub fn file(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mode: 0o644,
            times: FileTimes { mtime: 0, atime: 0 },
            kind: NodeKind::File(contents.into()),
        }
    }

    /// Directory with mode 0755
    pub fn dir(name: impl Into<String>, children: Vec<RemoteNode>) -> Self {
        Self {
            name: name.into(),
            mode: 0o755,
            times: FileTimes { mtime: 0, atime: 0 },
            kind: NodeKind::Dir(children),
        }
    }

    /// Path that does not exist on the remote side
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: 0,
            times: FileTimes { mtime: 0, atime: 0 },
            kind: NodeKind::Missing,
        }
    }

    /// Set permission bits
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Set modification and access times
    #[must_use]
    pub fn with_times(mut self, mtime: u64, atime: u64) -> Self {
        self.times = FileTimes { mtime, atime };
        self
    }
}

/// Entry written by an upload into the in-memory sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the scp target, `/`-separated
    pub path: String,
    pub mode: u32,
    /// Only set when the upload preserved times
    pub times: Option<FileTimes>,
    /// `None` for directories
    pub contents: Option<Vec<u8>>,
}

/// File currently being received by [`MemorySink`]
struct IncomingFile {
    path: String,
    mode: u32,
    times: Option<FileTimes>,
    size: usize,
    contents: Vec<u8>,
}

/// In-memory `scp -t`
struct MemorySink {
    host: String,
    received: Arc<Mutex<Vec<(String, RemoteEntry)>>>,
    buf: Vec<u8>,
    dirs: Vec<String>,
    pending_times: Option<FileTimes>,
    file: Option<IncomingFile>,
}

impl MemorySink {
    fn path_for(&self, name: &str) -> String {
        if self.dirs.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.dirs.join("/"))
        }
    }

    fn store(&self, entry: RemoteEntry) {
        lock(&self.received).push((self.host.clone(), entry));
    }

    /// Consume file body bytes; `true` once the body and its status byte are in
    fn take_body(&mut self) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let need = file.size - file.contents.len();
        let take = need.min(self.buf.len());
        file.contents.extend(self.buf.drain(..take));

        if file.contents.len() < file.size || self.buf.is_empty() {
            return false;
        }
        // status byte that follows the body
        self.buf.remove(0);
        true
    }

    fn handle_record(&mut self, record: Record) {
        match record {
            Record::Times(times) => self.pending_times = Some(times),
            Record::File { mode, size, name } => {
                self.file = Some(IncomingFile {
                    path: self.path_for(&name),
                    mode,
                    times: self.pending_times.take(),
                    size: usize::try_from(size).unwrap_or(usize::MAX),
                    contents: Vec::new(),
                });
            }
            Record::Dir { mode, name } => {
                let entry = RemoteEntry {
                    path: self.path_for(&name),
                    mode,
                    times: self.pending_times.take(),
                    contents: None,
                };
                self.store(entry);
                self.dirs.push(name);
            }
            Record::EndDir => {
                self.dirs.pop();
            }
        }
    }
}

impl RemoteSession for MemorySink {
    fn start(&mut self) -> Vec<ChannelEvent> {
        vec![ChannelEvent::stdout([0])]
    }

    fn input(&mut self, data: &[u8]) -> Vec<ChannelEvent> {
        self.buf.extend_from_slice(data);
        let mut replies = Vec::new();

        loop {
            if self.file.is_some() {
                if !self.take_body() {
                    break;
                }
                if let Some(file) = self.file.take() {
                    self.store(RemoteEntry {
                        path: file.path,
                        mode: file.mode,
                        times: file.times,
                        contents: Some(file.contents),
                    });
                }
                replies.push(ChannelEvent::stdout([0]));
                continue;
            }

            let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

            match Record::parse(&line) {
                Ok(record) => {
                    self.handle_record(record);
                    replies.push(ChannelEvent::stdout([0]));
                }
                Err(e) => {
                    let mut reply = vec![2];
                    reply.extend_from_slice(format!("scp: {e}\n").as_bytes());
                    replies.push(ChannelEvent::stdout(reply));
                }
            }
        }

        replies
    }

    fn eof(&mut self) -> Vec<ChannelEvent> {
        ScriptedSession::success().0
    }
}

/// Outgoing piece of an `scp -f` session
struct SourceStep {
    bytes: Vec<u8>,
    wants_ack: bool,
}

/// In-memory `scp -f`
struct MemorySource {
    steps: VecDeque<SourceStep>,
    failed: bool,
    done: bool,
}

impl MemorySource {
    fn new(nodes: &[RemoteNode], flags: ScpFlags) -> Self {
        let mut source = Self {
            steps: VecDeque::new(),
            failed: false,
            done: false,
        };
        for node in nodes {
            source.plan(node, flags);
        }
        source
    }

    fn step(&mut self, bytes: Vec<u8>, wants_ack: bool) {
        self.steps.push_back(SourceStep { bytes, wants_ack });
    }

    fn error(&mut self, message: String) {
        let mut bytes = vec![1];
        bytes.extend_from_slice(message.as_bytes());
        bytes.push(b'\n');
        self.step(bytes, false);
        self.failed = true;
    }

    fn plan(&mut self, node: &RemoteNode, flags: ScpFlags) {
        match &node.kind {
            NodeKind::Missing => {
                self.error(format!("scp: {}: No such file or directory", node.name));
            }
            NodeKind::Dir(_) if !flags.recursive => {
                self.error(format!("scp: {}: not a regular file", node.name));
            }
            NodeKind::File(contents) => {
                if flags.preserve {
                    self.step(Record::Times(node.times).encode(), true);
                }
                let header = Record::File {
                    mode: node.mode,
                    size: contents.len() as u64,
                    name: node.name.clone(),
                };
                self.step(header.encode(), true);
                let mut body = contents.clone();
                body.push(0);
                self.step(body, true);
            }
            NodeKind::Dir(children) => {
                if flags.preserve {
                    self.step(Record::Times(node.times).encode(), true);
                }
                let header = Record::Dir {
                    mode: node.mode,
                    name: node.name.clone(),
                };
                self.step(header.encode(), true);
                for child in children {
                    self.plan(child, flags);
                }
                self.step(Record::EndDir.encode(), true);
            }
        }
    }

    /// Emit steps until one needs an ack, or finish the session
    fn advance(&mut self) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Some(step) = self.steps.pop_front() {
            events.push(ChannelEvent::stdout(step.bytes));
            if step.wants_ack {
                return events;
            }
        }
        if !self.done {
            self.done = true;
            events.push(ChannelEvent::Eof);
            events.push(ChannelEvent::ExitStatus(u32::from(self.failed)));
            events.push(ChannelEvent::Closed);
        }
        events
    }
}

impl RemoteSession for MemorySource {
    fn start(&mut self) -> Vec<ChannelEvent> {
        Vec::new()
    }

    fn input(&mut self, data: &[u8]) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        for _ in data.iter().filter(|&&b| b == 0) {
            events.extend(self.advance());
        }
        events
    }
}

/// Default responder: silent success, plus in-memory SCP
#[derive(Clone, Default)]
pub struct DryRunResponder {
    received: Arc<Mutex<Vec<(String, RemoteEntry)>>>,
    serving: Arc<Vec<RemoteNode>>,
}

impl DryRunResponder {
    /// Create a responder serving nothing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `nodes` to every `scp -f` request
    #[must_use]
    pub fn serving(mut self, nodes: Vec<RemoteNode>) -> Self {
        self.serving = Arc::new(nodes);
        self
    }

    /// Everything uploaded to `host`, in arrival order
    #[must_use]
    pub fn received_on(&self, host: &str) -> Vec<RemoteEntry> {
        lock(&self.received)
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

impl Responder for DryRunResponder {
    fn exec(&self, host: &str, command: &str) -> Box<dyn RemoteSession> {
        match detect_mode(command) {
            Some((ScpMode::Sink, _)) => Box::new(MemorySink {
                host: host.to_string(),
                received: self.received.clone(),
                buf: Vec::new(),
                dirs: Vec::new(),
                pending_times: None,
                file: None,
            }),
            Some((ScpMode::Source, flags)) => Box::new(MemorySource::new(&self.serving, flags)),
            None => Box::new(ScriptedSession::success()),
        }
    }
}

/// Connector that records instead of connecting
#[derive(Clone)]
pub struct RecordingConnector {
    log: Arc<Mutex<Vec<Invocation>>>,
    responder: Arc<dyn Responder>,
    unreachable: Vec<String>,
    stalled: Vec<String>,
}

impl fmt::Debug for RecordingConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingConnector")
            .field("invocations", &lock(&self.log).len())
            .field("unreachable", &self.unreachable)
            .field("stalled", &self.stalled)
            .finish_non_exhaustive()
    }
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnector {
    /// Recorder with the [`DryRunResponder`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_responder(DryRunResponder::new())
    }

    /// Recorder answering through `responder`
    pub fn with_responder(responder: impl Responder + 'static) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
            unreachable: Vec::new(),
            stalled: Vec::new(),
        }
    }

    /// Recorder answering each `(host, command)` with the events `script` returns
    pub fn scripted<F>(script: F) -> Self
    where
        F: Fn(&str, &str) -> Vec<ChannelEvent> + Send + Sync + 'static,
    {
        Self::with_responder(FnResponder(script))
    }

    /// Make connecting to `host` fail
    #[must_use]
    pub fn unreachable(mut self, host: impl Into<String>) -> Self {
        self.unreachable.push(host.into());
        self
    }

    /// Make connecting to `host` never complete
    #[must_use]
    pub fn stalled(mut self, host: impl Into<String>) -> Self {
        self.stalled.push(host.into());
        self
    }

    /// Snapshot of everything recorded so far
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.log).clone()
    }

    /// `(host, command)` of every exec request, in order
    #[must_use]
    pub fn commands(&self) -> Vec<(String, String)> {
        lock(&self.log)
            .iter()
            .filter_map(|i| match i {
                Invocation::Exec { host, command, .. } => Some((host.clone(), command.clone())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, ExecError> {
        if self.stalled.contains(&target.host) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.contains(&target.host) {
            return Err(ExecError::ConnectionFailed(format!(
                "{}:{}: host unreachable",
                target.host, target.options.port
            )));
        }

        lock(&self.log).push(Invocation::Connect {
            host: target.host.clone(),
            port: target.options.port,
            user: target.options.user.clone(),
        });
        debug!(host = %target.host, "recording transport connected");

        Ok(Box::new(RecordingTransport {
            host: target.host.clone(),
            log: self.log.clone(),
            responder: self.responder.clone(),
            channels: HashMap::new(),
            next_id: 0,
        }))
    }

    fn transport_type(&self) -> &'static str {
        "recording"
    }
}

/// Simulated channel
struct ScriptedChannel {
    session: Option<Box<dyn RemoteSession>>,
    pending: VecDeque<ChannelEvent>,
}

/// Transport handed out by [`RecordingConnector`]
pub struct RecordingTransport {
    host: String,
    log: Arc<Mutex<Vec<Invocation>>>,
    responder: Arc<dyn Responder>,
    channels: HashMap<ChannelId, ScriptedChannel>,
    next_id: u32,
}

impl RecordingTransport {
    fn record(&self, invocation: Invocation) {
        lock(&self.log).push(invocation);
    }

    fn slot(&mut self, id: ChannelId) -> Result<&mut ScriptedChannel, ExecError> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| ExecError::ChannelProtocol(format!("unknown channel {id}")))
    }

    fn start(&mut self, id: ChannelId, mut session: Box<dyn RemoteSession>) -> Result<(), ExecError> {
        let slot = self.slot(id)?;
        slot.pending.extend(session.start());
        slot.session = Some(session);
        Ok(())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn open_channel(&mut self) -> Result<ChannelId, ExecError> {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.insert(
            id,
            ScriptedChannel {
                session: None,
                pending: VecDeque::new(),
            },
        );
        self.record(Invocation::OpenChannel {
            host: self.host.clone(),
            channel: id,
        });
        Ok(id)
    }

    async fn exec(&mut self, id: ChannelId, command: &str) -> Result<(), ExecError> {
        self.record(Invocation::Exec {
            host: self.host.clone(),
            channel: id,
            command: command.to_string(),
        });
        let session = self.responder.exec(&self.host, command);
        self.start(id, session)
    }

    async fn subsystem(&mut self, id: ChannelId, name: &str) -> Result<bool, ExecError> {
        self.record(Invocation::Subsystem {
            host: self.host.clone(),
            channel: id,
            name: name.to_string(),
        });
        match self.responder.subsystem(&self.host, name) {
            Some(session) => {
                self.start(id, session)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send(&mut self, id: ChannelId, data: &[u8]) -> Result<(), ExecError> {
        self.record(Invocation::Send {
            host: self.host.clone(),
            channel: id,
            data: data.to_vec(),
        });
        let slot = self.slot(id)?;
        if let Some(session) = slot.session.as_mut() {
            let replies = session.input(data);
            slot.pending.extend(replies);
        }
        Ok(())
    }

    async fn send_eof(&mut self, id: ChannelId) -> Result<(), ExecError> {
        self.record(Invocation::SendEof {
            host: self.host.clone(),
            channel: id,
        });
        let slot = self.slot(id)?;
        if let Some(session) = slot.session.as_mut() {
            let replies = session.eof();
            slot.pending.extend(replies);
        }
        Ok(())
    }

    async fn recv(&mut self, id: ChannelId) -> Result<ChannelEvent, ExecError> {
        let slot = self.slot(id)?;
        let Some(event) = slot.pending.pop_front() else {
            return Err(ExecError::ChannelProtocol(format!(
                "recording transport has no pending events for channel {id}"
            )));
        };
        if event == ChannelEvent::Closed {
            self.channels.remove(&id);
        }
        Ok(event)
    }

    async fn close_channel(&mut self, id: ChannelId) -> Result<(), ExecError> {
        self.record(Invocation::CloseChannel {
            host: self.host.clone(),
            channel: id,
        });
        if let Some(slot) = self.channels.get_mut(&id)
            && !slot.pending.contains(&ChannelEvent::Closed)
        {
            slot.pending.push_back(ChannelEvent::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.record(Invocation::Close {
            host: self.host.clone(),
        });
        self.channels.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConnectOptions;

    fn target(host: &str) -> ConnectTarget {
        let (options, _) = ConnectOptions::default().split();
        ConnectTarget {
            host: host.to_string(),
            options,
        }
    }

    fn stdout_bytes(events: &[ChannelEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Data { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_records_invocations() {
        let connector = RecordingConnector::new();
        let mut transport = connector.connect(&target("h1")).await.unwrap();
        let id = transport.open_channel().await.unwrap();
        transport.exec(id, "uptime").await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(
            connector.invocations(),
            vec![
                Invocation::Connect {
                    host: "h1".into(),
                    port: 22,
                    user: None
                },
                Invocation::OpenChannel {
                    host: "h1".into(),
                    channel: ChannelId(0)
                },
                Invocation::Exec {
                    host: "h1".into(),
                    channel: ChannelId(0),
                    command: "uptime".into()
                },
                Invocation::Close { host: "h1".into() },
            ]
        );
        assert_eq!(connector.commands(), vec![("h1".into(), "uptime".into())]);
    }

    #[tokio::test]
    async fn test_recv_without_events_is_an_error() {
        let connector = RecordingConnector::scripted(|_, _| Vec::new());
        let mut transport = connector.connect(&target("h1")).await.unwrap();
        let id = transport.open_channel().await.unwrap();
        transport.exec(id, "x").await.unwrap();

        let err = transport.recv(id).await.unwrap_err();
        assert!(matches!(err, ExecError::ChannelProtocol(_)));
    }

    #[test]
    fn test_memory_sink_handles_split_input() {
        let responder = DryRunResponder::new();
        let mut sink = responder.exec("h1", "scp -t -p 'dest'");

        assert_eq!(stdout_bytes(&sink.start()), vec![0]);
        assert_eq!(stdout_bytes(&sink.input(b"T5 0 6 0\n")), vec![0]);
        assert_eq!(stdout_bytes(&sink.input(b"C0640 5 a.t")), Vec::<u8>::new());
        assert_eq!(stdout_bytes(&sink.input(b"xt\nhel")), vec![0]);
        assert_eq!(stdout_bytes(&sink.input(b"lo")), Vec::<u8>::new());
        assert_eq!(stdout_bytes(&sink.input(&[0])), vec![0]);

        assert_eq!(
            responder.received_on("h1"),
            vec![RemoteEntry {
                path: "a.txt".into(),
                mode: 0o640,
                times: Some(FileTimes { mtime: 5, atime: 6 }),
                contents: Some(b"hello".to_vec()),
            }]
        );
        assert!(responder.received_on("h2").is_empty());
    }

    #[test]
    fn test_memory_source_waits_for_acks() {
        let responder = DryRunResponder::new().serving(vec![RemoteNode::file("f", "abc")]);
        let mut source = responder.exec("h1", "scp -f 'f'");

        assert!(source.start().is_empty());
        assert_eq!(stdout_bytes(&source.input(&[0])), b"C0644 3 f\n");
        assert_eq!(stdout_bytes(&source.input(&[0])), b"abc\0");

        let last = source.input(&[0]);
        assert_eq!(
            last,
            vec![ChannelEvent::Eof, ChannelEvent::ExitStatus(0), ChannelEvent::Closed]
        );
    }

    #[test]
    fn test_memory_source_missing_file() {
        let responder = DryRunResponder::new().serving(vec![RemoteNode::missing("nope")]);
        let mut source = responder.exec("h1", "scp -f 'nope'");

        let events = source.input(&[0]);
        let mut expected = vec![1];
        expected.extend_from_slice(b"scp: nope: No such file or directory\n");
        assert_eq!(stdout_bytes(&events), expected);
        assert!(events.contains(&ChannelEvent::ExitStatus(1)));
    }
}
