//! SSH transport using russh crate

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::KeySource;
use crate::traits::{ChannelEvent, ChannelId, ConnectTarget, Connector, Transport};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // host-key trust storage is left to the caller's environment
        Ok(true)
    }
}

/// Connects over the network with russh
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

impl RusshConnector {
    /// Create a new connector
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    #[instrument(skip(self, target), fields(host = %target.host, port = target.options.port))]
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, ExecError> {
        let options = &target.options;
        let user = options
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        if options.user_interaction {
            return Err(ExecError::ConfigError(
                "interactive authentication is not supported".to_string(),
            ));
        }

        info!(host = %target.host, port = options.port, user = %user, "connecting to SSH");

        let config = Arc::new(client::Config::default());

        let mut session = client::connect(
            config,
            (target.host.as_str(), options.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        if let Some(password) = &options.password {
            let auth_res = session
                .authenticate_password(&user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if !auth_res.success() {
                return Err(ExecError::AuthenticationFailed(
                    "password authentication failed".to_string(),
                ));
            }
        } else {
            let source = options.identity.clone().unwrap_or(KeySource::Agent);
            let key_pair = source.key_file()?.load()?;

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let auth_res = session
                .authenticate_publickey(
                    &user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if !auth_res.success() {
                return Err(ExecError::AuthenticationFailed(
                    "public key authentication failed".to_string(),
                ));
            }
        }

        info!(host = %target.host, "SSH connected and authenticated");

        Ok(Box::new(RusshTransport {
            host: target.host.clone(),
            session,
            channels: HashMap::new(),
            next_id: 0,
        }))
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

/// Open russh channel plus messages that arrived while waiting for a reply
struct ChannelSlot {
    channel: russh::Channel<client::Msg>,
    pending: VecDeque<ChannelMsg>,
}

/// Established russh session
pub struct RusshTransport {
    host: String,
    session: client::Handle<SshClientHandler>,
    channels: HashMap<ChannelId, ChannelSlot>,
    next_id: u32,
}

impl RusshTransport {
    fn slot(&mut self, id: ChannelId) -> Result<&mut ChannelSlot, ExecError> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| ExecError::ChannelProtocol(format!("unknown channel {id}")))
    }

    /// Wait for the reply to a `want_reply` request, keeping anything else
    async fn wait_reply(&mut self, id: ChannelId) -> Result<bool, ExecError> {
        let slot = self.slot(id)?;
        loop {
            match slot.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(true),
                Some(ChannelMsg::Failure) => return Ok(false),
                Some(ChannelMsg::Close) | None => {
                    return Err(ExecError::ChannelProtocol(format!(
                        "channel {id} closed before request was answered"
                    )));
                }
                Some(msg) => slot.pending.push_back(msg),
            }
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open_channel(&mut self) -> Result<ChannelId, ExecError> {
        let channel = self.session.channel_open_session().await?;
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.insert(
            id,
            ChannelSlot {
                channel,
                pending: VecDeque::new(),
            },
        );
        debug!(host = %self.host, channel = %id, "opened session channel");
        Ok(id)
    }

    async fn exec(&mut self, id: ChannelId, command: &str) -> Result<(), ExecError> {
        self.slot(id)?.channel.exec(true, command).await?;
        if self.wait_reply(id).await? {
            Ok(())
        } else {
            Err(ExecError::ChannelProtocol(format!(
                "exec request refused on channel {id}"
            )))
        }
    }

    async fn subsystem(&mut self, id: ChannelId, name: &str) -> Result<bool, ExecError> {
        self.slot(id)?.channel.request_subsystem(true, name).await?;
        self.wait_reply(id).await
    }

    async fn send(&mut self, id: ChannelId, data: &[u8]) -> Result<(), ExecError> {
        self.slot(id)?.channel.data(data).await?;
        Ok(())
    }

    async fn send_eof(&mut self, id: ChannelId) -> Result<(), ExecError> {
        self.slot(id)?.channel.eof().await?;
        Ok(())
    }

    async fn recv(&mut self, id: ChannelId) -> Result<ChannelEvent, ExecError> {
        let host = self.host.clone();
        let event = {
            let slot = self.slot(id)?;
            loop {
                let msg = match slot.pending.pop_front() {
                    Some(msg) => Some(msg),
                    None => slot.channel.wait().await,
                };

                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        return Ok(ChannelEvent::stdout(data.to_vec()));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        return Ok(ChannelEvent::stderr(data.to_vec()));
                    }
                    Some(ChannelMsg::ExtendedData { ext, .. }) => {
                        return Err(ExecError::ChannelProtocol(format!(
                            "unknown extended data type {ext} on channel {id}"
                        )));
                    }
                    Some(ChannelMsg::Eof) => return Ok(ChannelEvent::Eof),
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        return Ok(ChannelEvent::ExitStatus(exit_status));
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        warn!(host = %host, channel = %id, signal = ?signal_name, "remote process killed by signal");
                    }
                    Some(ChannelMsg::Close) | None => break ChannelEvent::Closed,
                    Some(_) => {}
                }
            }
        };
        self.channels.remove(&id);
        Ok(event)
    }

    async fn close_channel(&mut self, id: ChannelId) -> Result<(), ExecError> {
        // already gone if the peer closed first
        if let Some(slot) = self.channels.get_mut(&id) {
            slot.channel.close().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.channels.clear();
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        info!(host = %self.host, "SSH disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConnectOptions;

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_connection() {
        let (options, _) = ConnectOptions::default().split();
        let target = ConnectTarget {
            host: "localhost".to_string(),
            options,
        };
        let mut transport = RusshConnector::new().connect(&target).await.unwrap();
        let id = transport.open_channel().await.unwrap();
        transport.exec(id, "true").await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interactive_rejected() {
        let (mut options, _) = ConnectOptions::default().split();
        options.user_interaction = true;
        let target = ConnectTarget {
            host: "localhost".to_string(),
            options,
        };
        let err = RusshConnector::new().connect(&target).await.err().unwrap();
        assert!(matches!(err, ExecError::ConfigError(_)));
    }
}
