//! SCP wire protocol over a [`Channel`]
//!
//! The remote side runs `scp -t` (we are the source) or `scp -f` (we are the
//! sink). Control records are single lines:
//!
//! ```text
//! C<mode> <size> <name>\n   file header, followed by <size> bytes and \0
//! D<mode> 0 <name>\n        enter directory
//! E\n                       leave directory
//! T<mtime> 0 <atime> 0\n    times for the next C or D record
//! ```
//!
//! Each record is answered with a single status byte: `\0` ok, `\x01` error
//! followed by a message line, `\x02` fatal error followed by a message line.

use std::collections::VecDeque;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelState};
use crate::error::TransferError;
use crate::escape::{quote, split_word};
use crate::result::Stream;
use crate::traits::ChannelEvent;

const CHUNK_SIZE: usize = 32 * 1024;

/// Which side the remote `scp` plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpMode {
    /// `scp -t`: remote receives
    Sink,
    /// `scp -f`: remote sends
    Source,
}

/// Flags passed to the remote `scp`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScpFlags {
    pub recursive: bool,
    pub preserve: bool,
}

/// Build the remote command line, e.g. `scp -t -r -p '/srv/app'`
#[must_use]
pub fn scp_command(mode: ScpMode, flags: ScpFlags, remote: &str) -> String {
    let mut command = String::from(match mode {
        ScpMode::Sink => "scp -t",
        ScpMode::Source => "scp -f",
    });
    if flags.recursive {
        command.push_str(" -r");
    }
    if flags.preserve {
        command.push_str(" -p");
    }
    command.push(' ');
    command.push_str(&quote(remote));
    command
}

/// Recognize a command compiled around [`scp_command`]
///
/// The scp invocation must be the whole command or the last `&&` step of it,
/// with the exact shape [`scp_command`] writes, optionally inside the
/// `sudo -u|-g NAME sh -c '...'` wrappers a context adds. Commands that only
/// mention scp, such as `grep 'scp -f' auth.log`, are not transfers.
#[must_use]
pub fn detect_mode(command: &str) -> Option<(ScpMode, ScpFlags)> {
    if let Some(rest) = command
        .strip_prefix("sudo -u ")
        .or_else(|| command.strip_prefix("sudo -g "))
    {
        let (_, rest) = split_word(rest)?;
        let (inner, tail) = split_word(rest.strip_prefix(" sh -c ")?)?;
        return if tail.is_empty() { detect_mode(&inner) } else { None };
    }

    command
        .match_indices("scp -")
        .filter(|(idx, _)| *idx == 0 || command[..*idx].ends_with(" && "))
        .find_map(|(idx, _)| parse_scp_step(&command[idx..]))
}

fn parse_scp_step(step: &str) -> Option<(ScpMode, ScpFlags)> {
    let (mode, mut rest) = if let Some(rest) = step.strip_prefix("scp -t ") {
        (ScpMode::Sink, rest)
    } else if let Some(rest) = step.strip_prefix("scp -f ") {
        (ScpMode::Source, rest)
    } else {
        return None;
    };

    let mut flags = ScpFlags::default();
    if let Some(r) = rest.strip_prefix("-r ") {
        flags.recursive = true;
        rest = r;
    }
    if let Some(r) = rest.strip_prefix("-p ") {
        flags.preserve = true;
        rest = r;
    }

    // exactly one path word, nothing after it
    let (_, tail) = split_word(rest)?;
    tail.is_empty().then_some((mode, flags))
}

/// Modification and access time in seconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub mtime: u64,
    pub atime: u64,
}

/// Metadata carried with a file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttrs {
    /// Permission bits (`0o7777` mask)
    pub mode: u32,
    /// Present only in preserve mode
    pub times: Option<FileTimes>,
}

/// One SCP control record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Times(FileTimes),
    File { mode: u32, size: u64, name: String },
    Dir { mode: u32, name: String },
    EndDir,
}

impl Record {
    /// Wire form including the trailing newline
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Record::Times(t) => format!("T{} 0 {} 0\n", t.mtime, t.atime),
            Record::File { mode, size, name } => format!("C{:04o} {size} {name}\n", mode & 0o7777),
            Record::Dir { mode, name } => format!("D{:04o} 0 {name}\n", mode & 0o7777),
            Record::EndDir => "E\n".to_string(),
        }
        .into_bytes()
    }

    /// Parse a record line (without the trailing newline)
    ///
    /// # Errors
    /// `Malformed` for unknown record types, bad numbers, or names that
    /// would escape the target directory.
    pub fn parse(line: &str) -> Result<Record, TransferError> {
        let malformed = || TransferError::Malformed(line.to_string());

        let Some(kind) = line.chars().next() else {
            return Err(malformed());
        };
        let body = &line[kind.len_utf8()..];

        match kind {
            'E' if body.is_empty() => Ok(Record::EndDir),
            'T' => {
                let fields: Vec<&str> = body.split(' ').collect();
                let [mtime, _, atime, _] = fields.as_slice() else {
                    return Err(malformed());
                };
                Ok(Record::Times(FileTimes {
                    mtime: mtime.parse().map_err(|_| malformed())?,
                    atime: atime.parse().map_err(|_| malformed())?,
                }))
            }
            'C' | 'D' => {
                let mut parts = body.splitn(3, ' ');
                let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
                else {
                    return Err(malformed());
                };
                let mode = u32::from_str_radix(mode, 8).map_err(|_| malformed())?;
                let size: u64 = size.parse().map_err(|_| malformed())?;
                if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                    return Err(malformed());
                }
                let name = name.to_string();
                if kind == 'C' {
                    Ok(Record::File { mode, size, name })
                } else {
                    Ok(Record::Dir { mode, name })
                }
            }
            _ => Err(malformed()),
        }
    }
}

/// Buffered byte stream over a running channel
struct ScpIo<'c, 'a> {
    channel: &'c mut Channel<'a>,
    buf: VecDeque<u8>,
    stderr: Vec<u8>,
    closed: bool,
}

impl<'c, 'a> ScpIo<'c, 'a> {
    fn new(channel: &'c mut Channel<'a>) -> Self {
        Self {
            channel,
            buf: VecDeque::new(),
            stderr: Vec::new(),
            closed: false,
        }
    }

    /// Receive until more stdout is buffered; `false` once the channel closed
    async fn fill(&mut self) -> Result<bool, TransferError> {
        while !self.closed {
            match self.channel.recv().await? {
                ChannelEvent::Data {
                    stream: Stream::Stdout,
                    bytes,
                } => {
                    self.buf.extend(bytes);
                    return Ok(true);
                }
                ChannelEvent::Data {
                    stream: Stream::Stderr,
                    bytes,
                } => {
                    warn!(
                        host = %self.channel.host(),
                        stderr = %String::from_utf8_lossy(&bytes).trim_end(),
                        "remote scp"
                    );
                    self.stderr.extend(bytes);
                }
                ChannelEvent::Eof | ChannelEvent::ExitStatus(_) => {}
                ChannelEvent::Closed => self.closed = true,
            }
        }
        Ok(false)
    }

    async fn read_byte(&mut self) -> Result<Option<u8>, TransferError> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(self.buf.pop_front())
    }

    async fn read_line(&mut self) -> Result<String, TransferError> {
        let mut line = Vec::new();
        loop {
            match self.read_byte().await? {
                Some(b'\n') => return Ok(String::from_utf8_lossy(&line).into_owned()),
                Some(b) => line.push(b),
                None => return Err(self.closed_early()),
            }
        }
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, TransferError> {
        while self.buf.is_empty() {
            if !self.fill().await? {
                return Err(self.closed_early());
            }
        }
        let n = max.min(self.buf.len());
        Ok(self.buf.drain(..n).collect())
    }

    /// Read one status byte and turn error replies into `Remote`
    async fn read_reply(&mut self) -> Result<(), TransferError> {
        match self.read_byte().await? {
            Some(0) => Ok(()),
            Some(1 | 2) => {
                let message = self.read_line().await?;
                Err(TransferError::Remote(message))
            }
            Some(other) => Err(TransferError::Malformed(format!(
                "unexpected reply byte {other:#04x}"
            ))),
            None => Err(self.closed_early()),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.channel.send(data).await?;
        Ok(())
    }

    fn stderr_message(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    fn closed_early(&self) -> TransferError {
        let stderr = self.stderr_message();
        if stderr.is_empty() {
            TransferError::Remote("channel closed mid-transfer".to_string())
        } else {
            TransferError::Remote(stderr)
        }
    }

    /// Send eof, drain to close and check the remote exit status
    async fn finish(mut self) -> Result<Option<u32>, TransferError> {
        if self.channel.state() == ChannelState::Running && !self.closed {
            self.channel.send_eof().await?;
        }
        while self.fill().await? {
            self.buf.clear();
        }

        match self.channel.exit_code() {
            Some(0) | None => Ok(self.channel.exit_code()),
            Some(code) => {
                let stderr = self.stderr_message();
                Err(TransferError::Remote(if stderr.is_empty() {
                    format!("scp exited with status {code}")
                } else {
                    stderr
                }))
            }
        }
    }
}

/// Sending side: pushes local files to a remote `scp -t`
pub struct ScpSource<'c, 'a> {
    io: ScpIo<'c, 'a>,
}

impl<'c, 'a> ScpSource<'c, 'a> {
    /// Wait for the remote sink to signal readiness
    ///
    /// # Errors
    /// `Remote` if the sink refuses, channel errors otherwise
    pub async fn start(channel: &'c mut Channel<'a>) -> Result<Self, TransferError> {
        let mut io = ScpIo::new(channel);
        io.read_reply().await?;
        Ok(Self { io })
    }

    async fn record(&mut self, record: &Record) -> Result<(), TransferError> {
        self.io.write(&record.encode()).await?;
        self.io.read_reply().await
    }

    async fn times(&mut self, attrs: &FileAttrs) -> Result<(), TransferError> {
        if let Some(times) = attrs.times {
            self.record(&Record::Times(times)).await?;
        }
        Ok(())
    }

    /// Send one local file as `name`; returns the number of bytes sent
    ///
    /// # Errors
    /// `Io` if the local file cannot be read, `Remote` if the sink rejects it
    pub async fn send_file(
        &mut self,
        local: &Path,
        name: &str,
        attrs: &FileAttrs,
    ) -> Result<u64, TransferError> {
        let mut file = File::open(local)
            .await
            .map_err(|e| TransferError::io(local, &e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransferError::io(local, &e))?
            .len();

        self.times(attrs).await?;
        self.record(&Record::File {
            mode: attrs.mode,
            size,
            name: name.to_string(),
        })
        .await?;

        let mut remaining = size;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| TransferError::io(local, &e))?;
            if n == 0 {
                return Err(TransferError::Io {
                    path: local.to_path_buf(),
                    message: "file shrank while sending".to_string(),
                });
            }
            self.io.write(&buf[..n]).await?;
            remaining -= n as u64;
        }
        self.io.write(&[0]).await?;
        self.io.read_reply().await?;

        debug!(file = %local.display(), name, size, "sent file");
        Ok(size)
    }

    /// Start a directory named `name` on the remote side
    ///
    /// # Errors
    /// `Remote` if the sink rejects it
    pub async fn enter_dir(&mut self, name: &str, attrs: &FileAttrs) -> Result<(), TransferError> {
        self.times(attrs).await?;
        self.record(&Record::Dir {
            mode: attrs.mode,
            name: name.to_string(),
        })
        .await
    }

    /// Finish the current directory
    ///
    /// # Errors
    /// `Remote` if the sink rejects it
    pub async fn leave_dir(&mut self) -> Result<(), TransferError> {
        self.record(&Record::EndDir).await
    }

    /// End the session and check the remote exit status
    ///
    /// # Errors
    /// `Remote` if `scp` exited non-zero
    pub async fn finish(self) -> Result<Option<u32>, TransferError> {
        self.io.finish().await
    }
}

/// What the remote source announced next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// A file follows; call [`ScpSink::recv_file`]
    File { name: String, size: u64, attrs: FileAttrs },
    EnterDir { name: String, attrs: FileAttrs },
    LeaveDir,
}

/// Receiving side: pulls files from a remote `scp -f`
pub struct ScpSink<'c, 'a> {
    io: ScpIo<'c, 'a>,
    pending_times: Option<FileTimes>,
    errors: Vec<String>,
}

impl<'c, 'a> ScpSink<'c, 'a> {
    /// Tell the remote source to begin
    ///
    /// # Errors
    /// Channel errors
    pub async fn start(channel: &'c mut Channel<'a>) -> Result<Self, TransferError> {
        let mut io = ScpIo::new(channel);
        io.write(&[0]).await?;
        Ok(Self {
            io,
            pending_times: None,
            errors: Vec::new(),
        })
    }

    /// Next announced entry, or `None` when the source is done
    ///
    /// Non-fatal error messages from the source are collected and reported
    /// by [`ScpSink::finish`].
    ///
    /// # Errors
    /// `Remote` on a fatal message, `Malformed` on garbage
    pub async fn next(&mut self) -> Result<Option<SinkEvent>, TransferError> {
        loop {
            let Some(first) = self.io.read_byte().await? else {
                return Ok(None);
            };

            match first {
                1 => {
                    let message = self.io.read_line().await?;
                    warn!(host = %self.io.channel.host(), message = %message, "remote scp error");
                    self.errors.push(message);
                }
                2 => {
                    let message = self.io.read_line().await?;
                    return Err(TransferError::Remote(message));
                }
                b'C' | b'D' | b'E' | b'T' => {
                    let rest = self.io.read_line().await?;
                    let record = Record::parse(&format!("{}{rest}", first as char))?;
                    self.io.write(&[0]).await?;

                    match record {
                        Record::Times(times) => self.pending_times = Some(times),
                        Record::File { mode, size, name } => {
                            let attrs = FileAttrs {
                                mode,
                                times: self.pending_times.take(),
                            };
                            return Ok(Some(SinkEvent::File { name, size, attrs }));
                        }
                        Record::Dir { mode, name } => {
                            let attrs = FileAttrs {
                                mode,
                                times: self.pending_times.take(),
                            };
                            return Ok(Some(SinkEvent::EnterDir { name, attrs }));
                        }
                        Record::EndDir => return Ok(Some(SinkEvent::LeaveDir)),
                    }
                }
                other => {
                    return Err(TransferError::Malformed(format!(
                        "unexpected record byte {other:#04x}"
                    )));
                }
            }
        }
    }

    /// Receive the body of the file just announced into `local`
    ///
    /// # Errors
    /// `Io` if `local` cannot be written, `Remote` if the source fails
    pub async fn recv_file(&mut self, local: &Path, size: u64) -> Result<(), TransferError> {
        let mut file = File::create(local)
            .await
            .map_err(|e| TransferError::io(local, &e))?;

        let mut remaining = size;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));
            let chunk = self.io.read_chunk(want).await?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(local, &e))?;
            remaining -= chunk.len() as u64;
        }
        file.flush().await.map_err(|e| TransferError::io(local, &e))?;

        self.io.read_reply().await?;
        self.io.write(&[0]).await?;

        debug!(file = %local.display(), size, "received file");
        Ok(())
    }

    /// End the session; fails if the source reported errors or exited non-zero
    ///
    /// # Errors
    /// `Remote` with the collected messages
    pub async fn finish(self) -> Result<Option<u32>, TransferError> {
        let errors = self.errors;
        let status = self.io.finish().await;
        if !errors.is_empty() {
            return Err(TransferError::Remote(errors.join("; ")));
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command() {
        let flags = ScpFlags {
            recursive: true,
            preserve: true,
        };
        assert_eq!(scp_command(ScpMode::Sink, flags, "app"), "scp -t -r -p 'app'");
        assert_eq!(
            scp_command(ScpMode::Source, ScpFlags::default(), "/var/log/x y"),
            "scp -f '/var/log/x y'"
        );
    }

    #[test]
    fn test_detect_inside_wrapped_command() {
        let wrapped = r"sudo -u app sh -c 'cd /srv && scp -t -p '\''x'\'''";
        assert_eq!(
            detect_mode(wrapped),
            Some((
                ScpMode::Sink,
                ScpFlags {
                    recursive: false,
                    preserve: true
                }
            ))
        );
        assert_eq!(detect_mode("ls -la"), None);
    }

    #[test]
    fn test_detect_ignores_commands_mentioning_scp() {
        assert_eq!(detect_mode("grep 'scp -f' /var/log/auth.log"), None);
        assert_eq!(detect_mode("echo use scp -t to receive"), None);
        assert_eq!(detect_mode("cd /srv && scp -t 'a' && echo done"), None);
        assert_eq!(
            detect_mode(r"sudo -u app sh -c 'grep '\''scp -t'\'' log'"),
            None
        );
    }

    #[test]
    fn test_detect_compiled_commands() {
        let flags = ScpFlags {
            recursive: true,
            preserve: false,
        };
        let plain = scp_command(ScpMode::Source, flags, "dir with && in it");
        assert_eq!(detect_mode(&plain), Some((ScpMode::Source, flags)));

        let nested = format!(
            "sudo -u ops sh -c {}",
            quote(&format!("sudo -g 'web team' sh -c {}", quote(&format!("umask 022 && {plain}"))))
        );
        assert_eq!(detect_mode(&nested), Some((ScpMode::Source, flags)));
    }

    #[test]
    fn test_encode() {
        let file = Record::File {
            mode: 0o100_644,
            size: 12,
            name: "a.txt".into(),
        };
        assert_eq!(file.encode(), b"C0644 12 a.txt\n");
        assert_eq!(
            Record::Times(FileTimes {
                mtime: 1_700_000_000,
                atime: 1_700_000_100
            })
            .encode(),
            b"T1700000000 0 1700000100 0\n"
        );
        assert_eq!(
            Record::Dir {
                mode: 0o755,
                name: "d".into()
            }
            .encode(),
            b"D0755 0 d\n"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Record::parse("C0600 5 name with spaces").unwrap(),
            Record::File {
                mode: 0o600,
                size: 5,
                name: "name with spaces".into()
            }
        );
        assert_eq!(Record::parse("E").unwrap(), Record::EndDir);
        assert_eq!(
            Record::parse("T10 0 20 0").unwrap(),
            Record::Times(FileTimes { mtime: 10, atime: 20 })
        );
    }

    #[test]
    fn test_parse_rejects_escaping_names() {
        assert!(Record::parse("C0644 1 ../etc/passwd").is_err());
        assert!(Record::parse("D0755 0 ..").is_err());
        assert!(Record::parse("C0644 x a").is_err());
        assert!(Record::parse("Xwhat").is_err());
        assert!(Record::parse("").is_err());
    }
}
