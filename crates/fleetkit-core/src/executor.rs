//! Fan-out of per-host work across a context

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use fleetkit_exec::{CommandResult, ConnectOptions, Connection, Connector, ExecError};

use crate::context::{Context, ExecutionMode};
use crate::error::CoreError;

/// Outcome for one host, positioned like the host in its context
#[derive(Debug, Clone)]
pub struct HostResult<T> {
    /// Host name as given in the context
    pub host: String,
    pub result: Result<T, CoreError>,
}

impl<T> HostResult<T> {
    /// Whether this host succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything a per-host task needs, owned so it can move into a task
pub(crate) struct HostJob {
    pub(crate) host: String,
    options: ConnectOptions,
    connector: Option<Arc<dyn Connector>>,
}

impl HostJob {
    /// Open a connection with this host's merged options
    pub(crate) async fn connect(&self) -> Result<Connection, ExecError> {
        match &self.connector {
            Some(connector) => Connection::open_with(&self.host, &self.options, connector.clone()).await,
            None => Connection::open(&self.host, &self.options).await,
        }
    }
}

/// Close `connection`, logging rather than returning a failure
pub(crate) async fn close_quietly(connection: Connection) {
    let host = connection.host().to_string();
    if let Err(e) = connection.close().await {
        warn!(host = %host, error = %e, "failed to close connection");
    }
}

impl Context {
    /// Run `command` on every host
    ///
    /// The command is compiled once with [`Context::build`]. Each host gets
    /// its own connection and channel; a failure on one host becomes that
    /// host's entry and never stops the others. A non-zero exit status is a
    /// successful result carrying that code.
    ///
    /// # Errors
    /// Fails before touching any host if [`Context::validate`] fails.
    #[instrument(skip(self), fields(hosts = self.hosts().len(), mode = ?self.mode()))]
    pub async fn run(&self, command: &str) -> Result<Vec<HostResult<CommandResult>>, CoreError> {
        let compiled: Arc<str> = Arc::from(self.build(command));
        info!(command = %compiled, "running command");

        self.fan_out(move |job| {
            let compiled = compiled.clone();
            async move { run_on_host(job, &compiled).await }
        })
        .await
    }

    /// Run `task` once per host according to the execution mode
    pub(crate) async fn fan_out<T, F, Fut>(&self, task: F) -> Result<Vec<HostResult<T>>, CoreError>
    where
        T: Send + 'static,
        F: Fn(HostJob) -> Fut,
        Fut: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        self.validate()?;

        let jobs = self.hosts().iter().map(|host| HostJob {
            host: host.name().to_string(),
            options: host.merged(self.shared_options()),
            connector: self.injected_connector(),
        });

        let mut results = Vec::with_capacity(self.hosts().len());
        match self.mode() {
            ExecutionMode::Sequential => {
                for job in jobs {
                    let host = job.host.clone();
                    let handle = tokio::spawn(task(job));
                    results.push(collect(host, handle.await));
                }
            }
            ExecutionMode::Parallel => {
                let handles: Vec<_> = jobs
                    .map(|job| (job.host.clone(), tokio::spawn(task(job))))
                    .collect();
                // awaited in host order, not completion order
                for (host, handle) in handles {
                    results.push(collect(host, handle.await));
                }
            }
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        info!(total = results.len(), failed, "fan-out finished");
        Ok(results)
    }
}

fn collect<T>(
    host: String,
    joined: Result<Result<T, CoreError>, tokio::task::JoinError>,
) -> HostResult<T> {
    let result = match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!(host = %host, error = %e, "host failed");
            Err(e)
        }
        Err(e) => {
            error!(host = %host, error = %e, "host task panicked");
            Err(CoreError::TaskFailed(e.to_string()))
        }
    };
    HostResult { host, result }
}

async fn run_on_host(job: HostJob, command: &str) -> Result<CommandResult, CoreError> {
    let mut connection = job.connect().await?;
    let outcome = exec_and_drain(&mut connection, command).await;
    close_quietly(connection).await;

    let result = outcome?;
    info!(host = %job.host, exit_code = ?result.exit_code, "command finished");
    Ok(result)
}

async fn exec_and_drain(connection: &mut Connection, command: &str) -> Result<CommandResult, ExecError> {
    let mut channel = connection.channel().await?;
    channel.run(command).await
}
