//! Upload and download across a context's hosts
//!
//! Every transfer is one `scp` session per host, started through
//! [`Context::build`] so the context's path, user, group, umask and env
//! apply to the remote `scp` just like to any other command. Relative remote
//! paths therefore resolve against the context's path.

use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::{FileTime, set_file_times};
use tracing::{debug, info, instrument, warn};

use fleetkit_exec::{
    Connection, FileAttrs, FileTimes, ScpFlags, ScpMode, ScpSink, ScpSource, SinkEvent,
    TransferError, scp::scp_command,
};

use crate::context::Context;
use crate::error::CoreError;
use crate::executor::{HostJob, HostResult, close_quietly};

/// Options for [`Context::upload`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Copy a directory and everything below it
    pub recursive: bool,
    /// Carry mode bits and modification/access times
    pub preserve: bool,
    /// Remote destination; defaults to the local file name
    pub target: Option<String>,
}

impl UploadOptions {
    #[must_use]
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    #[must_use]
    pub fn preserve(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    /// Upload as `target` instead of the local name
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Options for [`Context::download`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Copy a directory and everything below it
    pub recursive: bool,
    /// Apply the remote mode bits and modification/access times locally
    pub preserve: bool,
    /// Local destination; defaults to the remote file name
    pub target: Option<PathBuf>,
}

impl DownloadOptions {
    #[must_use]
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    #[must_use]
    pub fn preserve(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    /// Download to `target` instead of the remote name
    #[must_use]
    pub fn target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// One file copied by a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferredFile {
    /// Path relative to the transferred tree, starting with its top name
    pub path: PathBuf,
    pub size: u64,
}

/// Files copied for one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files: Vec<TransferredFile>,
}

impl TransferSummary {
    /// Number of files copied
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Bytes copied across all files
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Wrap `err` as `Partial` once anything has been transferred
fn partial(summary: &TransferSummary, err: TransferError) -> TransferError {
    match summary.file_count() {
        0 => err,
        transferred => TransferError::Partial {
            transferred,
            reason: Box::new(err),
        },
    }
}

enum UploadStep {
    EnterDir {
        name: String,
        attrs: FileAttrs,
    },
    File {
        local: PathBuf,
        name: String,
        rel: PathBuf,
        attrs: FileAttrs,
    },
    LeaveDir,
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn unix_secs(time: FileTime) -> u64 {
    u64::try_from(time.unix_seconds()).unwrap_or(0)
}

fn local_attrs(meta: &Metadata, preserve: bool) -> FileAttrs {
    let times = preserve.then(|| FileTimes {
        mtime: unix_secs(FileTime::from_last_modification_time(meta)),
        atime: unix_secs(FileTime::from_last_access_time(meta)),
    });
    FileAttrs {
        mode: mode_bits(meta),
        times,
    }
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransferError::Invalid(format!("{} has no usable file name", path.display())))
}

/// Lay out the records to send for `local`
fn plan_upload(local: &Path, options: &UploadOptions) -> Result<Vec<UploadStep>, TransferError> {
    let meta = fs::metadata(local).map_err(|e| TransferError::io(local, &e))?;
    let name = file_name(local)?;
    let mut steps = Vec::new();

    if meta.is_file() {
        steps.push(UploadStep::File {
            local: local.to_path_buf(),
            rel: PathBuf::from(&name),
            name,
            attrs: local_attrs(&meta, options.preserve),
        });
    } else if meta.is_dir() {
        if !options.recursive {
            return Err(TransferError::Invalid(format!(
                "{} is a directory; upload it recursively",
                local.display()
            )));
        }
        plan_dir(local, &meta, Path::new(""), options.preserve, &mut steps)?;
    } else {
        return Err(TransferError::Invalid(format!(
            "{} is not a regular file or directory",
            local.display()
        )));
    }

    Ok(steps)
}

fn plan_dir(
    dir: &Path,
    meta: &Metadata,
    parent_rel: &Path,
    preserve: bool,
    steps: &mut Vec<UploadStep>,
) -> Result<(), TransferError> {
    let name = file_name(dir)?;
    let rel = parent_rel.join(&name);
    steps.push(UploadStep::EnterDir {
        name,
        attrs: local_attrs(meta, preserve),
    });

    let mut entries = fs::read_dir(dir)
        .and_then(|rd| rd.map(|e| e.map(|e| e.path())).collect::<Result<Vec<_>, _>>())
        .map_err(|e| TransferError::io(dir, &e))?;
    entries.sort();

    for path in entries {
        let meta = fs::metadata(&path).map_err(|e| TransferError::io(&path, &e))?;
        if meta.is_dir() {
            plan_dir(&path, &meta, &rel, preserve, steps)?;
        } else if meta.is_file() {
            let name = file_name(&path)?;
            steps.push(UploadStep::File {
                rel: rel.join(&name),
                local: path,
                name,
                attrs: local_attrs(&meta, preserve),
            });
        } else {
            warn!(path = %path.display(), "skipping special file");
        }
    }

    steps.push(UploadStep::LeaveDir);
    Ok(())
}

async fn send_steps(
    source: &mut ScpSource<'_, '_>,
    steps: &[UploadStep],
    summary: &mut TransferSummary,
) -> Result<(), TransferError> {
    for step in steps {
        match step {
            UploadStep::EnterDir { name, attrs } => source.enter_dir(name, attrs).await?,
            UploadStep::File {
                local,
                name,
                rel,
                attrs,
            } => {
                let size = source.send_file(local, name, attrs).await?;
                summary.files.push(TransferredFile {
                    path: rel.clone(),
                    size,
                });
            }
            UploadStep::LeaveDir => source.leave_dir().await?,
        }
    }
    Ok(())
}

async fn upload_over(
    connection: &mut Connection,
    command: &str,
    steps: &[UploadStep],
) -> Result<TransferSummary, TransferError> {
    let mut channel = connection.channel().await?;
    channel.exec(command).await?;

    let mut source = ScpSource::start(&mut channel).await?;
    let mut summary = TransferSummary::default();
    if let Err(e) = send_steps(&mut source, steps, &mut summary).await {
        return Err(partial(&summary, e));
    }
    source.finish().await.map_err(|e| partial(&summary, e))?;
    Ok(summary)
}

async fn upload_on_host(
    job: HostJob,
    command: &str,
    steps: &[UploadStep],
) -> Result<TransferSummary, CoreError> {
    let mut connection = job.connect().await?;
    let outcome = upload_over(&mut connection, command, steps).await;
    close_quietly(connection).await;

    let summary = outcome?;
    info!(host = %job.host, files = summary.file_count(), bytes = summary.total_bytes(), "upload finished");
    Ok(summary)
}

/// Apply received mode bits and times to `path`
fn apply_attrs(path: &Path, attrs: &FileAttrs) -> Result<(), TransferError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(attrs.mode & 0o7777))
            .map_err(|e| TransferError::io(path, &e))?;
    }
    if let Some(times) = attrs.times {
        let atime = FileTime::from_unix_time(i64::try_from(times.atime).unwrap_or(i64::MAX), 0);
        let mtime = FileTime::from_unix_time(i64::try_from(times.mtime).unwrap_or(i64::MAX), 0);
        set_file_times(path, atime, mtime).map_err(|e| TransferError::io(path, &e))?;
    }
    Ok(())
}

/// Directory being received: local path, relative path, attributes
type OpenDir = (PathBuf, PathBuf, FileAttrs);

fn locate(dest: &Path, parent: Option<&OpenDir>, name: &str) -> (PathBuf, PathBuf) {
    match parent {
        Some((dir, rel, _)) => (dir.join(name), rel.join(name)),
        None if dest.is_dir() => (dest.join(name), PathBuf::from(name)),
        None => (dest.to_path_buf(), PathBuf::from(name)),
    }
}

async fn receive_into(
    sink: &mut ScpSink<'_, '_>,
    dest: &Path,
    options: &DownloadOptions,
    summary: &mut TransferSummary,
) -> Result<(), TransferError> {
    let mut dirs: Vec<OpenDir> = Vec::new();

    while let Some(event) = sink.next().await? {
        match event {
            SinkEvent::File { name, size, attrs } => {
                let (local, rel) = locate(dest, dirs.last(), &name);
                sink.recv_file(&local, size).await?;
                if options.preserve {
                    apply_attrs(&local, &attrs)?;
                }
                summary.files.push(TransferredFile { path: rel, size });
            }
            SinkEvent::EnterDir { name, attrs } => {
                if !options.recursive {
                    return Err(TransferError::Malformed(format!(
                        "directory {name} in a non-recursive download"
                    )));
                }
                let (local, rel) = locate(dest, dirs.last(), &name);
                tokio::fs::create_dir_all(&local)
                    .await
                    .map_err(|e| TransferError::io(&local, &e))?;
                debug!(dir = %local.display(), "entered directory");
                dirs.push((local, rel, attrs));
            }
            SinkEvent::LeaveDir => {
                let Some((local, _, attrs)) = dirs.pop() else {
                    return Err(TransferError::Malformed(
                        "directory end without a start".to_string(),
                    ));
                };
                // after the children, so a read-only mode cannot block them
                if options.preserve {
                    apply_attrs(&local, &attrs)?;
                }
            }
        }
    }
    Ok(())
}

async fn download_over(
    connection: &mut Connection,
    command: &str,
    dest: &Path,
    options: &DownloadOptions,
) -> Result<TransferSummary, TransferError> {
    let mut channel = connection.channel().await?;
    channel.exec(command).await?;

    let mut sink = ScpSink::start(&mut channel).await?;
    let mut summary = TransferSummary::default();
    if let Err(e) = receive_into(&mut sink, dest, options, &mut summary).await {
        return Err(partial(&summary, e));
    }
    sink.finish().await.map_err(|e| partial(&summary, e))?;
    Ok(summary)
}

async fn download_on_host(
    job: HostJob,
    command: &str,
    dest: PathBuf,
    options: &DownloadOptions,
) -> Result<TransferSummary, CoreError> {
    let mut connection = job.connect().await?;
    let outcome = download_over(&mut connection, command, &dest, options).await;
    close_quietly(connection).await;

    let summary = outcome?;
    info!(host = %job.host, files = summary.file_count(), dest = %dest.display(), "download finished");
    Ok(summary)
}

/// `logs/app.log` for host `web1` becomes `logs/web1/app.log`
fn host_destination(dest: &Path, host: &str) -> PathBuf {
    match (dest.parent(), dest.file_name()) {
        (Some(parent), Some(file)) => parent.join(host).join(file),
        _ => dest.join(host),
    }
}

impl Context {
    /// Command [`Context::upload`] starts on each host for `local`
    ///
    /// # Errors
    /// `Invalid` if there is no target and `local` has no usable file name.
    pub fn upload_command(
        &self,
        local: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> Result<String, TransferError> {
        let remote = match &options.target {
            Some(target) => target.clone(),
            None => file_name(local.as_ref())?,
        };
        let flags = ScpFlags {
            recursive: options.recursive,
            preserve: options.preserve,
        };
        Ok(self.build(&scp_command(ScpMode::Sink, flags, &remote)))
    }

    /// Command [`Context::download`] starts on each host for `remote`
    #[must_use]
    pub fn download_command(&self, remote: &str, options: &DownloadOptions) -> String {
        let flags = ScpFlags {
            recursive: options.recursive,
            preserve: options.preserve,
        };
        self.build(&scp_command(ScpMode::Source, flags, remote))
    }

    /// Copy `local` to every host
    ///
    /// The local tree is read once up front. If it cannot be read, or is a
    /// directory without `recursive`, every host gets that error without a
    /// connection being opened.
    ///
    /// # Errors
    /// Fails before touching any host if [`Context::validate`] fails.
    #[instrument(skip(self, local, options), fields(local = %local.as_ref().display()))]
    pub async fn upload(
        &self,
        local: impl AsRef<Path>,
        options: &UploadOptions,
    ) -> Result<Vec<HostResult<TransferSummary>>, CoreError> {
        let local = local.as_ref();
        let prepared = plan_upload(local, options).and_then(|steps| {
            let command: Arc<str> = Arc::from(self.upload_command(local, options)?);
            Ok((command, Arc::new(steps)))
        });
        if let Err(e) = &prepared {
            warn!(error = %e, "upload cannot start");
        }

        self.fan_out(move |job| {
            let prepared = prepared.clone();
            async move {
                let (command, steps) = prepared?;
                upload_on_host(job, &command, &steps).await
            }
        })
        .await
    }

    /// Copy `remote` from every host
    ///
    /// With more than one host, each host's copy goes into a subdirectory
    /// named after the host next to the destination.
    ///
    /// # Errors
    /// Fails before touching any host if [`Context::validate`] fails.
    #[instrument(skip(self, options))]
    pub async fn download(
        &self,
        remote: &str,
        options: &DownloadOptions,
    ) -> Result<Vec<HostResult<TransferSummary>>, CoreError> {
        let trimmed = remote.trim_end_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);

        let prepared = match (&options.target, name) {
            (Some(target), _) => Ok(target.clone()),
            (None, "" | "." | "..") => Err(TransferError::Invalid(format!(
                "cannot derive a local name from {remote:?}"
            ))),
            (None, name) => Ok(PathBuf::from(name)),
        }
        .map(|dest| {
            let command: Arc<str> = Arc::from(self.download_command(remote, options));
            (command, Arc::new(dest))
        });

        let per_host = self.hosts().len() > 1;
        let options = Arc::new(options.clone());

        self.fan_out(move |job| {
            let prepared = prepared.clone();
            let options = options.clone();
            async move {
                let (command, dest) = prepared?;
                let dest = if per_host {
                    let dest = host_destination(&dest, &job.host);
                    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| TransferError::io(parent, &e))?;
                    }
                    dest
                } else {
                    (*dest).clone()
                };
                download_on_host(job, &command, dest, &options).await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_only_after_progress() {
        let mut summary = TransferSummary::default();
        let err = partial(&summary, TransferError::Remote("x".into()));
        assert!(matches!(err, TransferError::Remote(_)));

        summary.files.push(TransferredFile {
            path: "a".into(),
            size: 1,
        });
        let err = partial(&summary, TransferError::Remote("x".into()));
        assert!(matches!(err, TransferError::Partial { transferred: 1, .. }));
    }

    #[test]
    fn test_transfer_commands_go_through_context() {
        let ctx = Context::new(vec![crate::host::Host::new("h1")]).path("/srv").umask("022");

        let upload = ctx
            .upload_command("/tmp/site", &UploadOptions::default().recursive(true))
            .unwrap();
        assert_eq!(upload, "cd /srv && umask 022 && scp -t -r 'site'");

        let download = ctx.download_command("logs/app.log", &DownloadOptions::default().preserve(true));
        assert_eq!(download, "cd /srv && umask 022 && scp -f -p 'logs/app.log'");
    }

    #[test]
    fn test_host_destination() {
        assert_eq!(
            host_destination(Path::new("logs/app.log"), "web1"),
            PathBuf::from("logs/web1/app.log")
        );
        assert_eq!(
            host_destination(Path::new("app.log"), "web1"),
            PathBuf::from("web1/app.log")
        );
    }

    #[test]
    fn test_plan_rejects_directory_without_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan_upload(dir.path(), &UploadOptions::default()).err().unwrap();
        assert!(matches!(err, TransferError::Invalid(_)));
    }

    #[test]
    fn test_plan_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan_upload(&dir.path().join("nope"), &UploadOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Io { .. }));
    }

    #[test]
    fn test_plan_walks_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("site");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("z.txt"), "z").unwrap();
        fs::write(root.join("b/a.txt"), "a").unwrap();

        let steps = plan_upload(&root, &UploadOptions::default().recursive(true)).unwrap();
        let rendered: Vec<String> = steps
            .iter()
            .map(|s| match s {
                UploadStep::EnterDir { name, .. } => format!("D {name}"),
                UploadStep::File { rel, .. } => format!("C {}", rel.display()),
                UploadStep::LeaveDir => "E".to_string(),
            })
            .collect();

        assert_eq!(
            rendered,
            ["D site", "D b", "C site/b/a.txt", "E", "C site/z.txt", "E"]
        );
    }
}
