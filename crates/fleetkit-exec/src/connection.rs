//! Connection lifecycle over a pluggable transport

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::channel::Channel;
use crate::error::ExecError;
use crate::options::{ConnectOptions, TransportOptions};
use crate::recording::RecordingConnector;
use crate::ssh::RusshConnector;
use crate::traits::{ChannelId, ConnectTarget, Connector, Transport};

/// An open connection to one host
///
/// Owned by whoever opened it and closed by consuming it with
/// [`Connection::close`], so a connection cannot be closed twice. Only one
/// [`Channel`] can borrow it at a time.
pub struct Connection {
    host: String,
    options: TransportOptions,
    dry_run: bool,
    connector: Arc<dyn Connector>,
    pub(crate) transport: Box<dyn Transport>,
    /// Channels dropped without being closed
    pub(crate) abandoned: Vec<ChannelId>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.options.port)
            .field("dry_run", &self.dry_run)
            .field("transport", &self.connector.transport_type())
            .finish_non_exhaustive()
    }
}

/// Trim and lowercase a host name; `None` if nothing is left
#[must_use]
pub fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

impl Connection {
    /// Open a connection, choosing the transport from `options.dry_run`
    ///
    /// # Errors
    /// `NoHost` for an empty host, `ConfigError` for a zero connect timeout,
    /// `Timeout` if the connect timeout elapses, otherwise whatever the
    /// transport reports.
    pub async fn open(host: &str, options: &ConnectOptions) -> Result<Self, ExecError> {
        let connector: Arc<dyn Connector> = if options.dry_run.unwrap_or(false) {
            Arc::new(RecordingConnector::new())
        } else {
            Arc::new(RusshConnector::new())
        };
        Self::open_with(host, options, connector).await
    }

    /// Open a connection through an explicitly supplied connector
    ///
    /// # Errors
    /// Same as [`Connection::open`].
    #[instrument(skip(options, connector), fields(transport = connector.transport_type()))]
    pub async fn open_with(
        host: &str,
        options: &ConnectOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ExecError> {
        let host = normalize_host(host).ok_or(ExecError::NoHost)?;
        let (transport_options, toolkit) = options.split();

        let target = ConnectTarget {
            host: host.clone(),
            options: transport_options.clone(),
        };

        let transport = match toolkit.timeout {
            Some(timeout) if timeout.is_zero() => {
                return Err(ExecError::ConfigError(
                    "connect timeout must be greater than zero".to_string(),
                ));
            }
            Some(timeout) => tokio::time::timeout(timeout, connector.connect(&target))
                .await
                .map_err(|_| ExecError::Timeout { timeout })??,
            None => connector.connect(&target).await?,
        };

        debug!(host = %host, port = transport_options.port, "connection open");

        Ok(Self {
            host,
            options: transport_options,
            dry_run: toolkit.dry_run,
            connector,
            transport,
            abandoned: Vec::new(),
        })
    }

    /// Close the connection
    ///
    /// # Errors
    /// Returns the transport's error if the disconnect fails
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn close(mut self) -> Result<(), ExecError> {
        self.close_abandoned().await;
        self.transport.close().await?;
        info!(host = %self.host, "connection closed");
        Ok(())
    }

    /// Open a fresh connection to the same host
    ///
    /// Keeps port and the other transport options of this connection, drops
    /// the original timeout, and applies `overrides` on top. The transport is
    /// reused unless `overrides` sets `dry_run`. This connection is left
    /// open; close it separately.
    ///
    /// # Errors
    /// Same as [`Connection::open`].
    pub async fn reopen(&self, overrides: &ConnectOptions) -> Result<Self, ExecError> {
        let options = ConnectOptions::merge(&self.options.to_connect_options(), overrides);
        if overrides.dry_run.is_some() {
            Self::open(&self.host, &options).await
        } else {
            Self::open_with(&self.host, &options, self.connector.clone()).await
        }
    }

    /// Open a channel on this connection
    ///
    /// # Errors
    /// Returns the transport's error if no channel could be allocated
    pub async fn channel(&mut self) -> Result<Channel<'_>, ExecError> {
        self.close_abandoned().await;
        Channel::open(self).await
    }

    async fn close_abandoned(&mut self) {
        for id in std::mem::take(&mut self.abandoned) {
            if let Err(e) = self.transport.close_channel(id).await {
                warn!(host = %self.host, channel = %id, error = %e, "failed to close abandoned channel");
            }
        }
    }

    /// Normalized host name
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port in use
    #[must_use]
    pub fn port(&self) -> u16 {
        self.options.port
    }

    /// Transport options in effect
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Whether the connection was opened in dry-run mode
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Name of the transport behind this connection
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        self.connector.transport_type()
    }
}
