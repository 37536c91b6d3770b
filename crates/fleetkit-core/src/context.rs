//! Execution context and command compilation
//!
//! A [`Context`] is an immutable bundle of hosts plus the settings shared by
//! every command run against them. Each mutator returns a new value and
//! leaves the original untouched, so contexts can be derived from each other
//! freely:
//!
//! ```
//! use fleetkit_core::{Context, Host};
//!
//! let base = Context::new(vec![Host::new("web1")]);
//! let app = base.path("/srv/app").user("app");
//!
//! assert_eq!(base.build("ls"), "ls");
//! assert_eq!(app.build("ls"), "sudo -u app sh -c 'cd /srv/app && ls'");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetkit_exec::{ConnectOptions, Connector, quote, quote_word};

use crate::error::CoreError;
use crate::host::Host;

/// How a context fans out over its hosts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One host after another
    #[default]
    Sequential,
    /// All hosts at once; results still come back in host order
    Parallel,
}

/// Hosts plus shared execution settings
#[derive(Debug, Clone)]
pub struct Context {
    hosts: Arc<[Host]>,
    shared: ConnectOptions,
    path: Option<String>,
    user: Option<String>,
    group: Option<String>,
    umask: Option<String>,
    env: BTreeMap<String, String>,
    mode: ExecutionMode,
    connector: Option<Arc<dyn Connector>>,
}

impl Context {
    /// Context over `hosts` with no shared options
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        Self::with_options(hosts, ConnectOptions::default())
    }

    /// Context over `hosts`; each host's own options win over `shared`
    pub fn with_options(hosts: impl IntoIterator<Item = Host>, shared: ConnectOptions) -> Self {
        Self {
            hosts: hosts.into_iter().collect(),
            shared,
            path: None,
            user: None,
            group: None,
            umask: None,
            env: BTreeMap::new(),
            mode: ExecutionMode::Sequential,
            connector: None,
        }
    }

    /// Run commands from `path` (inserted as-is, so `~` still expands)
    #[must_use]
    pub fn path(&self, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..self.clone()
        }
    }

    /// Run commands as `user` via `sudo -u`
    #[must_use]
    pub fn user(&self, user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..self.clone()
        }
    }

    /// Run commands with primary group `group` via `sudo -g`
    #[must_use]
    pub fn group(&self, group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..self.clone()
        }
    }

    /// Set the file mode creation mask, e.g. `"022"`
    #[must_use]
    pub fn umask(&self, umask: impl Into<String>) -> Self {
        Self {
            umask: Some(umask.into()),
            ..self.clone()
        }
    }

    /// Replace the exported environment
    #[must_use]
    pub fn env<K, V>(&self, env: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: env.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..self.clone()
        }
    }

    /// Run hosts concurrently (`true`) or one after another (`false`)
    #[must_use]
    pub fn parallel(&self, parallel: bool) -> Self {
        Self {
            mode: if parallel {
                ExecutionMode::Parallel
            } else {
                ExecutionMode::Sequential
            },
            ..self.clone()
        }
    }

    /// Open connections through `connector` instead of picking one from the
    /// options
    #[must_use]
    pub fn connector(&self, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector: Some(connector),
            ..self.clone()
        }
    }

    /// Hosts in order
    #[must_use]
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Options shared by every host
    #[must_use]
    pub fn shared_options(&self) -> &ConnectOptions {
        &self.shared
    }

    /// Fan-out mode
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub(crate) fn injected_connector(&self) -> Option<Arc<dyn Connector>> {
        self.connector.clone()
    }

    /// Check the context can run anything at all
    ///
    /// # Errors
    /// `NoHosts` if there are no hosts; `Config` for an environment variable
    /// name that is not a valid shell identifier, or a user, group or umask
    /// that is empty or starts with `-` (sudo and umask would read it as an
    /// option even when quoted).
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.hosts.is_empty() {
            return Err(CoreError::NoHosts);
        }
        for (what, value) in [("user", &self.user), ("group", &self.group), ("umask", &self.umask)] {
            if let Some(value) = value
                && (value.is_empty() || value.starts_with('-'))
            {
                return Err(CoreError::Config(format!("invalid {what} {value:?}")));
            }
        }
        if let Some(key) = self.env.keys().find(|k| !is_identifier(k)) {
            return Err(CoreError::Config(format!(
                "invalid environment variable name {key:?}"
            )));
        }
        Ok(())
    }

    /// Compile `command` into the single shell string sent to every host
    ///
    /// Applied in a fixed order: env export, umask, cd, then the group
    /// wrapper and finally the user wrapper outermost. Wrapped payloads are
    /// single-quoted, so `command` may itself contain quotes.
    #[must_use]
    pub fn build(&self, command: &str) -> String {
        let mut compiled = command.to_string();

        if !self.env.is_empty() {
            let exports: Vec<String> = self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={}", quote(value)))
                .collect();
            compiled = format!("export {} && {compiled}", exports.join(" "));
        }
        if let Some(umask) = &self.umask {
            compiled = format!("umask {} && {compiled}", quote_word(umask));
        }
        if let Some(path) = &self.path {
            compiled = format!("cd {path} && {compiled}");
        }
        if let Some(group) = &self.group {
            compiled = format!("sudo -g {} sh -c {}", quote_word(group), quote(&compiled));
        }
        if let Some(user) = &self.user {
            compiled = format!("sudo -u {} sh -c {}", quote_word(user), quote(&compiled));
        }

        compiled
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(vec![Host::new("h1")])
    }

    #[test]
    fn test_plain_command_is_verbatim() {
        assert_eq!(ctx().build("echo 'hi' | wc -c"), "echo 'hi' | wc -c");
    }

    #[test]
    fn test_env_sorted_and_quoted() {
        let c = ctx().env([("NODE_ENV", "production"), ("A", "x y")]);
        assert_eq!(
            c.build("printenv NODE_ENV"),
            "export A='x y' NODE_ENV='production' && printenv NODE_ENV"
        );
    }

    #[test]
    fn test_env_replaces() {
        let c = ctx().env([("A", "1")]).env([("B", "2")]);
        assert_eq!(c.build("true"), "export B='2' && true");
    }

    #[test]
    fn test_full_composition_order() {
        let c = ctx()
            .env([("K", "v")])
            .umask("077")
            .path("/tmp")
            .user("deploy");
        assert_eq!(
            c.build("pwd"),
            r"sudo -u deploy sh -c 'cd /tmp && umask 077 && export K='\''v'\'' && pwd'"
        );
    }

    #[test]
    fn test_group_inside_user() {
        let c = ctx().user("app").group("www");
        assert_eq!(
            c.build("id"),
            r"sudo -u app sh -c 'sudo -g www sh -c '\''id'\'''"
        );
    }

    #[test]
    fn test_mutators_do_not_touch_original() {
        let base = ctx();
        let derived = base.path("/srv").parallel(true);

        assert_eq!(base.build("ls"), "ls");
        assert_eq!(base.mode(), ExecutionMode::Sequential);
        assert_eq!(derived.build("ls"), "cd /srv && ls");
        assert_eq!(derived.mode(), ExecutionMode::Parallel);
        assert_eq!(derived.hosts(), base.hosts());
    }

    #[test]
    fn test_build_is_deterministic() {
        let c = ctx()
            .env([("B", "2"), ("A", "1"), ("C", "it's")])
            .group("ops");
        assert_eq!(c.build("make"), c.build("make"));
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            Context::new(Vec::new()).validate(),
            Err(CoreError::NoHosts)
        ));
        assert!(matches!(
            ctx().env([("BAD-NAME", "x")]).validate(),
            Err(CoreError::Config(_))
        ));
        assert!(ctx().env([("_OK1", "x")]).validate().is_ok());
    }

    #[test]
    fn test_option_like_names_rejected() {
        for bad in [ctx().user("-s"), ctx().group("--help"), ctx().umask("-S"), ctx().user("")] {
            assert!(matches!(bad.validate(), Err(CoreError::Config(_))));
        }
        assert!(ctx().user("web-admin").group("ops").umask("022").validate().is_ok());
    }

    #[test]
    fn test_odd_user_is_quoted() {
        assert_eq!(
            ctx().user("my user").build("id"),
            "sudo -u 'my user' sh -c 'id'"
        );
    }
}
