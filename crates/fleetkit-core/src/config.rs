//! Fleet configuration file types
//!
//! ```toml
//! log_level = "info"
//!
//! [defaults]
//! user = "deploy"
//! timeout_ms = 10000
//!
//! [[host]]
//! name = "web1.example.com"
//!
//! [[host]]
//! name = "root@db1.example.com:2222"
//! identity = { path = "/home/me/.ssh/id_ed25519" }
//!
//! [context]
//! path = "/srv/app"
//! env = { RUST_LOG = "info" }
//! parallel = true
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use fleetkit_exec::ConnectOptions;

use crate::context::Context;
use crate::error::CoreError;
use crate::host::Host;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Options shared by every host
    #[serde(default)]
    pub defaults: ConnectOptions,
    /// Hosts in run order
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
    /// Shared execution settings
    #[serde(default)]
    pub context: ContextConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            defaults: ConnectOptions::default(),
            hosts: Vec::new(),
            context: ContextConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One `[[host]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// `[user@]name[:port]`
    pub name: String,
    /// Host-specific options; these win over the shorthand in `name`
    #[serde(flatten)]
    pub options: ConnectOptions,
}

impl HostConfig {
    /// Build the [`Host`]
    ///
    /// # Errors
    /// `InvalidHost` if `name` does not parse
    pub fn to_host(&self) -> Result<Host, CoreError> {
        let parsed = Host::parse(&self.name)?;
        Ok(Host::with_options(
            parsed.name(),
            ConnectOptions::merge(parsed.options(), &self.options),
        ))
    }
}

/// The `[context]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub path: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub umask: Option<String>,
    pub env: BTreeMap<String, String>,
    pub parallel: bool,
}

impl ContextConfig {
    /// Apply these settings on top of `ctx`
    #[must_use]
    pub fn apply(&self, ctx: &Context) -> Context {
        let mut ctx = ctx.parallel(self.parallel);
        if let Some(path) = &self.path {
            ctx = ctx.path(path.clone());
        }
        if let Some(user) = &self.user {
            ctx = ctx.user(user.clone());
        }
        if let Some(group) = &self.group {
            ctx = ctx.group(group.clone());
        }
        if let Some(umask) = &self.umask {
            ctx = ctx.umask(umask.clone());
        }
        if !self.env.is_empty() {
            ctx = ctx.env(self.env.clone());
        }
        ctx
    }
}

impl FleetConfig {
    /// Parse from TOML text
    ///
    /// # Errors
    /// `Config` with the parser's message
    pub fn from_toml(text: &str) -> Result<Self, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Hosts in file order
    ///
    /// # Errors
    /// `InvalidHost` for the first entry that does not parse
    pub fn hosts(&self) -> Result<Vec<Host>, CoreError> {
        self.hosts.iter().map(HostConfig::to_host).collect()
    }

    /// Context over the configured hosts with the configured settings
    ///
    /// # Errors
    /// Same as [`FleetConfig::hosts`]
    pub fn to_context(&self) -> Result<Context, CoreError> {
        let ctx = Context::with_options(self.hosts()?, self.defaults.clone());
        Ok(self.context.apply(&ctx))
    }
}

#[cfg(test)]
mod tests {
    use fleetkit_exec::KeySource;

    use super::*;
    use crate::context::ExecutionMode;

    const SAMPLE: &str = r#"
log_level = "debug"

[defaults]
user = "deploy"
timeout_ms = 10000

[[host]]
name = "web1"

[[host]]
name = "root@db1:2222"
identity = { path = "/keys/db" }

[context]
path = "/srv/app"
umask = "027"
env = { APP_ENV = "prod" }
parallel = true
"#;

    #[test]
    fn test_parse_sample() {
        let config = FleetConfig::from_toml(SAMPLE).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.defaults.timeout_ms, Some(10_000));

        let hosts = config.hosts().unwrap();
        assert_eq!(hosts[0], Host::new("web1"));
        assert_eq!(hosts[1].name(), "db1");
        assert_eq!(hosts[1].options().port, Some(2222));
        assert_eq!(hosts[1].options().user.as_deref(), Some("root"));
        assert_eq!(
            hosts[1].options().identity,
            Some(KeySource::Path("/keys/db".into()))
        );
    }

    #[test]
    fn test_to_context() {
        let ctx = FleetConfig::from_toml(SAMPLE).unwrap().to_context().unwrap();

        assert_eq!(ctx.hosts().len(), 2);
        assert_eq!(ctx.mode(), ExecutionMode::Parallel);
        assert_eq!(ctx.shared_options().user.as_deref(), Some("deploy"));
        assert_eq!(
            ctx.build("ls"),
            "cd /srv/app && umask 027 && export APP_ENV='prod' && ls"
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = FleetConfig::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.hosts.is_empty());
        assert_eq!(config.context, ContextConfig::default());
    }

    #[test]
    fn test_bad_host_reported() {
        let config = FleetConfig::from_toml("[[host]]\nname = \"web1:notaport\"\n").unwrap();
        assert!(matches!(config.hosts(), Err(CoreError::InvalidHost { .. })));
    }
}
