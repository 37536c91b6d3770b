//! fleetkit CLI
//!
//! Runs a shell command, or copies files, across every configured host

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::bail;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetkit_core::{
    CommandResult, Context, DownloadOptions, FleetConfig, Host, HostResult, TransferSummary,
    UploadOptions,
};

mod config;

#[derive(Parser)]
#[command(name = "fleetkit")]
#[command(about = "Run commands and copy files across a fleet over SSH", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Target host as `[user@]name[:port]`; replaces configured hosts
    #[arg(short = 'H', long = "host", global = true)]
    hosts: Vec<String>,

    /// Remote working directory
    #[arg(long, global = true)]
    path: Option<String>,

    /// Run as this user (sudo -u)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Run with this group (sudo -g)
    #[arg(long, global = true)]
    group: Option<String>,

    /// File mode creation mask, e.g. 022
    #[arg(long, global = true)]
    umask: Option<String>,

    /// Environment variable as KEY=VALUE; replaces configured env
    #[arg(short, long = "env", value_parser = parse_env, global = true)]
    env: Vec<(String, String)>,

    /// Run on all hosts at once
    #[arg(long, global = true)]
    parallel: bool,

    /// Connect to nothing; print the command each host would run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command on every host
    Run {
        /// Command line, passed to the remote shell as one string
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Copy a local file or directory to every host
    Upload {
        /// Local source
        local: PathBuf,
        /// Remote destination (defaults to the local name)
        #[arg(long = "as")]
        target: Option<String>,
        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,
        /// Preserve mode and times
        #[arg(short, long)]
        preserve: bool,
    },

    /// Copy a remote file or directory from every host
    Download {
        /// Remote source
        remote: String,
        /// Local destination (defaults to the remote name)
        #[arg(long = "as")]
        target: Option<PathBuf>,
        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,
        /// Preserve mode and times
        #[arg(short, long)]
        preserve: bool,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Configured context with command-line settings layered on top
fn build_context(cli: &Cli, config: &FleetConfig) -> Result<Context> {
    let hosts = if cli.hosts.is_empty() {
        config.hosts()?
    } else {
        cli.hosts
            .iter()
            .map(|h| Host::parse(h))
            .collect::<Result<Vec<_>, _>>()?
    };
    if hosts.is_empty() {
        bail!("no hosts given; pass -H or add [[host]] entries to the config");
    }

    let mut shared = config.defaults.clone();
    if cli.dry_run {
        shared = shared.with_dry_run(true);
    }

    let mut ctx = config.context.apply(&Context::with_options(hosts, shared));
    if let Some(path) = &cli.path {
        ctx = ctx.path(path.clone());
    }
    if let Some(user) = &cli.user {
        ctx = ctx.user(user.clone());
    }
    if let Some(group) = &cli.group {
        ctx = ctx.group(group.clone());
    }
    if let Some(umask) = &cli.umask {
        ctx = ctx.umask(umask.clone());
    }
    if !cli.env.is_empty() {
        ctx = ctx.env(cli.env.clone());
    }
    if cli.parallel {
        ctx = ctx.parallel(true);
    }
    Ok(ctx)
}

/// Compiled remote command, shown per host in dry-run mode
fn preview(cli: &Cli, ctx: &Context) -> Option<String> {
    if !cli.dry_run {
        return None;
    }
    match &cli.command {
        Commands::Run { command } => Some(ctx.build(&command.join(" "))),
        Commands::Upload {
            local,
            target,
            recursive,
            preserve,
        } => ctx
            .upload_command(local, &upload_options(target, *recursive, *preserve))
            .ok(),
        Commands::Download {
            remote,
            target,
            recursive,
            preserve,
        } => Some(ctx.download_command(remote, &download_options(target, *recursive, *preserve))),
    }
}

fn upload_options(target: &Option<String>, recursive: bool, preserve: bool) -> UploadOptions {
    UploadOptions {
        recursive,
        preserve,
        target: target.clone(),
    }
}

fn download_options(target: &Option<PathBuf>, recursive: bool, preserve: bool) -> DownloadOptions {
    DownloadOptions {
        recursive,
        preserve,
        target: target.clone(),
    }
}

fn print_run(results: &[HostResult<CommandResult>], preview: Option<&str>) -> Result<usize> {
    let mut stdout = std::io::stdout().lock();
    let mut failed = 0;

    for r in results {
        match &r.result {
            Ok(result) => {
                let status = result
                    .exit_code
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                writeln!(stdout, "==> {} (exit {status})", r.host)?;
                if let Some(command) = preview {
                    writeln!(stdout, "    dry run: {command}")?;
                }
                stdout.write_all(&result.output.merged())?;
            }
            Err(e) => {
                failed += 1;
                writeln!(stdout, "==> {} failed: {e}", r.host)?;
            }
        }
    }
    Ok(failed)
}

fn print_transfers(results: &[HostResult<TransferSummary>], preview: Option<&str>) -> Result<usize> {
    let mut stdout = std::io::stdout().lock();
    let mut failed = 0;

    for r in results {
        match &r.result {
            Ok(summary) => {
                writeln!(
                    stdout,
                    "==> {}: {} files, {} bytes",
                    r.host,
                    summary.file_count(),
                    summary.total_bytes()
                )?;
                if let Some(command) = preview {
                    writeln!(stdout, "    dry run: {command}")?;
                }
                for file in &summary.files {
                    writeln!(stdout, "    {} ({} bytes)", file.path.display(), file.size)?;
                }
            }
            Err(e) => {
                failed += 1;
                writeln!(stdout, "==> {} failed: {e}", r.host)?;
            }
        }
    }
    Ok(failed)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let (config, source) = match &cli.config {
        Some(path) => (config::load(path)?, Some(path.clone())),
        None => match config::load_default()? {
            Some((config, path)) => (config, Some(path)),
            None => (FleetConfig::default(), None),
        },
    };

    init_tracing(&config.log_level, cli.json_logs)?;
    match &source {
        Some(path) => info!(config = %path.display(), "loaded configuration"),
        None => warn!("no config file found, using defaults"),
    }

    let ctx = build_context(&cli, &config)?;
    let total = ctx.hosts().len();

    let preview = preview(&cli, &ctx);
    let preview = preview.as_deref();

    let failed = match &cli.command {
        Commands::Run { command } => print_run(&ctx.run(&command.join(" ")).await?, preview)?,
        Commands::Upload {
            local,
            target,
            recursive,
            preserve,
        } => {
            let options = upload_options(target, *recursive, *preserve);
            print_transfers(&ctx.upload(local, &options).await?, preview)?
        }
        Commands::Download {
            remote,
            target,
            recursive,
            preserve,
        } => {
            let options = download_options(target, *recursive, *preserve);
            print_transfers(&ctx.download(remote, &options).await?, preview)?
        }
    };

    if failed > 0 {
        bail!("{failed} of {total} hosts failed");
    }
    Ok(())
}
