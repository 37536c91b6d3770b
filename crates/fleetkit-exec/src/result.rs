//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Output stream a chunk arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Output of one remote command, in arrival order across both streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    chunks: Vec<(Stream, Vec<u8>)>,
}

impl Output {
    /// Create an empty output log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    pub fn push(&mut self, stream: Stream, bytes: impl Into<Vec<u8>>) {
        self.chunks.push((stream, bytes.into()));
    }

    /// Chunks in arrival order, tagged by stream
    #[must_use]
    pub fn chunks(&self) -> &[(Stream, Vec<u8>)] {
        &self.chunks
    }

    /// Whether nothing was received
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Both streams concatenated in arrival order
    #[must_use]
    pub fn merged(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }

    /// All bytes from one stream
    #[must_use]
    pub fn stream(&self, stream: Stream) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|(s, _)| *s == stream)
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }

    /// stdout bytes
    #[must_use]
    pub fn stdout(&self) -> Vec<u8> {
        self.stream(Stream::Stdout)
    }

    /// stderr bytes
    #[must_use]
    pub fn stderr(&self) -> Vec<u8> {
        self.stream(Stream::Stderr)
    }
}

/// Result of a command execution on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status reported by the remote side
    ///
    /// `None` when the channel closed without an exit status (for example
    /// the process was killed by a signal). This is still a successful
    /// execution from fleetkit's point of view.
    pub exit_code: Option<u32>,
    /// Interleaved stdout/stderr
    pub output: Output,
    /// Time from exec request to channel close
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout as (lossy) UTF-8
    #[must_use]
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.stdout()).into_owned()
    }

    /// stderr as (lossy) UTF-8
    #[must_use]
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.stderr()).into_owned()
    }

    /// Both streams in arrival order as (lossy) UTF-8
    #[must_use]
    pub fn combined_output(&self) -> String {
        String::from_utf8_lossy(&self.output.merged()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Output {
        let mut output = Output::new();
        output.push(Stream::Stdout, "one\n");
        output.push(Stream::Stderr, "warn\n");
        output.push(Stream::Stdout, "two\n");
        output
    }

    #[test]
    fn test_merged_keeps_arrival_order() {
        assert_eq!(sample().merged(), b"one\nwarn\ntwo\n");
    }

    #[test]
    fn test_per_stream() {
        let output = sample();
        assert_eq!(output.stdout(), b"one\ntwo\n");
        assert_eq!(output.stderr(), b"warn\n");
    }

    #[test]
    fn test_success_requires_zero() {
        let mut result = CommandResult {
            exit_code: Some(0),
            output: sample(),
            duration: Duration::from_millis(3),
        };
        assert!(result.success());

        result.exit_code = None;
        assert!(!result.success());
        assert_eq!(result.combined_output(), "one\nwarn\ntwo\n");
    }
}
