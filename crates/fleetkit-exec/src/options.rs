//! Connection options and their precedence rules

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::keys::KeySource;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Options for opening a connection to one host
///
/// Every field is optional so that host-specific options can be layered on
/// top of shared ones with [`ConnectOptions::merge`]. Defaults are applied
/// when the connection is opened, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// SSH port (defaults to 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for password authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key for public-key authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<KeySource>,
    /// Allow interactive prompts during authentication (defaults to false)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_interaction: Option<bool>,
    /// Connection establishment timeout in milliseconds (unset = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Substitute the recording transport for the network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

impl ConnectOptions {
    /// Layer `specific` on top of `shared`; set fields of `specific` win
    #[must_use]
    pub fn merge(shared: &ConnectOptions, specific: &ConnectOptions) -> ConnectOptions {
        ConnectOptions {
            port: specific.port.or(shared.port),
            user: specific.user.clone().or_else(|| shared.user.clone()),
            password: specific.password.clone().or_else(|| shared.password.clone()),
            identity: specific.identity.clone().or_else(|| shared.identity.clone()),
            user_interaction: specific.user_interaction.or(shared.user_interaction),
            timeout_ms: specific.timeout_ms.or(shared.timeout_ms),
            dry_run: specific.dry_run.or(shared.dry_run),
        }
    }

    /// Split into transport-level and toolkit-level options, applying defaults
    #[must_use]
    pub fn split(&self) -> (TransportOptions, ToolkitOptions) {
        let transport = TransportOptions {
            port: self.port.unwrap_or(DEFAULT_PORT),
            user: self.user.clone(),
            password: self.password.clone(),
            identity: self.identity.clone(),
            user_interaction: self.user_interaction.unwrap_or(false),
        };
        let toolkit = ToolkitOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            dry_run: self.dry_run.unwrap_or(false),
        };
        (transport, toolkit)
    }

    /// Set port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set login user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set identity
    #[must_use]
    pub fn with_identity(mut self, identity: KeySource) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set connect timeout
    ///
    /// Stored in whole milliseconds, rounding a non-zero sub-millisecond
    /// value up to 1 ms. A zero timeout is rejected when connecting.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms = Some(if millis == 0 && !timeout.is_zero() { 1 } else { millis });
        self
    }

    /// Enable or disable dry-run
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }
}

/// Options consumed by the transport itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub identity: Option<KeySource>,
    pub user_interaction: bool,
}

impl TransportOptions {
    /// Convert back to mergeable form (timeout and dry-run are not carried)
    #[must_use]
    pub fn to_connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            port: Some(self.port),
            user: self.user.clone(),
            password: self.password.clone(),
            identity: self.identity.clone(),
            user_interaction: Some(self.user_interaction),
            timeout_ms: None,
            dry_run: None,
        }
    }
}

/// Options consumed by fleetkit around the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolkitOptions {
    /// Bounds connection establishment only, never command duration
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_wins() {
        let shared = ConnectOptions::default().with_user("deploy").with_port(2222);
        let specific = ConnectOptions::default().with_user("root");

        let merged = ConnectOptions::merge(&shared, &specific);

        assert_eq!(merged.user.as_deref(), Some("root"));
        assert_eq!(merged.port, Some(2222));
    }

    #[test]
    fn test_split_defaults() {
        let (transport, toolkit) = ConnectOptions::default().split();

        assert_eq!(transport.port, 22);
        assert!(!transport.user_interaction);
        assert_eq!(toolkit.timeout, None);
        assert!(!toolkit.dry_run);
    }

    #[test]
    fn test_split_timeout() {
        let opts = ConnectOptions::default().with_timeout(Duration::from_secs(5));
        let (_, toolkit) = opts.split();
        assert_eq!(toolkit.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_sub_second_timeout_kept() {
        let opts = ConnectOptions::default().with_timeout(Duration::from_millis(500));
        assert_eq!(opts.timeout_ms, Some(500));
        assert_eq!(opts.split().1.timeout, Some(Duration::from_millis(500)));

        let tiny = ConnectOptions::default().with_timeout(Duration::from_micros(10));
        assert_eq!(tiny.timeout_ms, Some(1));
    }

    #[test]
    fn test_deserialize() {
        let opts: ConnectOptions = serde_json::from_str(
            r#"{"port": 2200, "user": "ops", "identity": {"path": "/keys/id"}, "dry_run": true}"#,
        )
        .unwrap();

        assert_eq!(opts.port, Some(2200));
        assert_eq!(
            opts.identity,
            Some(KeySource::Path(std::path::PathBuf::from("/keys/id")))
        );
        assert_eq!(opts.dry_run, Some(true));
    }
}
