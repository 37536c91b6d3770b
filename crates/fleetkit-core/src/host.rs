//! Host identity and per-host connection options

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use fleetkit_exec::ConnectOptions;

use crate::error::CoreError;

/// One remote endpoint
///
/// Immutable once built; equality is structural over name and options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    name: String,
    #[serde(default)]
    options: ConnectOptions,
}

impl Host {
    /// Host with no options of its own
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ConnectOptions::default(),
        }
    }

    /// Host with its own connection options
    pub fn with_options(name: impl Into<String>, options: ConnectOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    /// Parse `[user@]name[:port]`, with `[addr]:port` for IPv6 literals
    ///
    /// # Errors
    /// `InvalidHost` for an empty name or a bad port
    pub fn parse(spec: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidHost {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = spec.trim();
        let (user, rest) = match trimmed.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some(_) => return Err(invalid("empty user")),
            None => (None, trimmed),
        };

        let (name, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let Some((addr, tail)) = bracketed.split_once(']') else {
                return Err(invalid("unclosed '['"));
            };
            match tail {
                "" => (addr, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (addr, Some(port)),
                    None => return Err(invalid("unexpected text after ']'")),
                },
            }
        } else if rest.matches(':').count() == 1 {
            let (name, port) = rest.split_once(':').unwrap_or((rest, ""));
            (name, Some(port))
        } else {
            // bare IPv6 literal or plain name
            (rest, None)
        };

        if name.is_empty() {
            return Err(invalid("empty host name"));
        }

        let mut options = ConnectOptions::default();
        if let Some(port) = port {
            let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
            options = options.with_port(port);
        }
        if let Some(user) = user {
            options = options.with_user(user);
        }

        Ok(Self {
            name: name.to_string(),
            options,
        })
    }

    /// Host name as given
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options specific to this host
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// This host's options layered over `shared`
    #[must_use]
    pub fn merged(&self, shared: &ConnectOptions) -> ConnectOptions {
        ConnectOptions::merge(shared, &self.options)
    }

    /// New host whose options also carry `shared` underneath its own
    #[must_use]
    pub fn with_shared(&self, shared: &ConnectOptions) -> Self {
        Self {
            name: self.name.clone(),
            options: self.merged(shared),
        }
    }
}

impl FromStr for Host {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.options.user {
            write!(f, "{user}@")?;
        }
        if self.name.contains(':') {
            write!(f, "[{}]", self.name)?;
        } else {
            write!(f, "{}", self.name)?;
        }
        if let Some(port) = self.options.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let host = Host::parse("deploy@web1.example.com:2222").unwrap();
        assert_eq!(host.name(), "web1.example.com");
        assert_eq!(host.options().user.as_deref(), Some("deploy"));
        assert_eq!(host.options().port, Some(2222));
        assert_eq!(host.to_string(), "deploy@web1.example.com:2222");
    }

    #[test]
    fn test_parse_plain_and_ipv6() {
        assert_eq!(Host::parse("web1").unwrap(), Host::new("web1"));
        assert_eq!(Host::parse("::1").unwrap().name(), "::1");

        let host = Host::parse("[fe80::1]:2200").unwrap();
        assert_eq!(host.name(), "fe80::1");
        assert_eq!(host.options().port, Some(2200));
        assert_eq!(host.to_string(), "[fe80::1]:2200");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Host::parse(""), Err(CoreError::InvalidHost { .. })));
        assert!(Host::parse("web1:ssh").is_err());
        assert!(Host::parse("@web1").is_err());
        assert!(Host::parse("[::1").is_err());
        assert!(Host::parse("web1:70000").is_err());
    }

    #[test]
    fn test_host_options_win_over_shared() {
        let shared = ConnectOptions::default().with_user("deploy").with_port(2222);
        let host = Host::parse("root@web1").unwrap();

        let merged = host.merged(&shared);
        assert_eq!(merged.user.as_deref(), Some("root"));
        assert_eq!(merged.port, Some(2222));

        assert_eq!(host.with_shared(&shared).options(), &merged);
    }

    #[test]
    fn test_structural_equality() {
        let a = Host::with_options("h1", ConnectOptions::default().with_port(22));
        let b = Host::parse("h1:22").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Host::new("h1"));
    }
}
