//! Private key sources for public-key authentication

use std::io::Write;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, load_secret_key};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::ExecError;

/// Where the private key comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Key file on disk
    Path(PathBuf),
    /// A running ssh-agent (rejected at connect time)
    Agent,
    /// Base64 of the key file, read from the named environment variable
    Env(String),
}

/// A key file ready to load; env keys live in a temp file until drop
#[derive(Debug)]
pub(crate) enum KeyFile {
    Disk(PathBuf),
    Temp(NamedTempFile),
}

impl KeyFile {
    pub(crate) fn path(&self) -> &Path {
        match self {
            KeyFile::Disk(path) => path,
            KeyFile::Temp(file) => file.path(),
        }
    }

    /// Parse the key
    pub(crate) fn load(&self) -> Result<PrivateKey, ExecError> {
        load_secret_key(self.path(), None).map_err(|e| {
            ExecError::SshKeyError(format!("{}: {e}", self.path().display()))
        })
    }
}

impl KeySource {
    /// Locate the key file, materializing `Env` keys as a 0600 temp file
    ///
    /// # Errors
    /// `SshKeyError` for agent sources, a missing or group/world readable
    /// key file, an unset variable, or bad base64.
    pub(crate) fn key_file(&self) -> Result<KeyFile, ExecError> {
        match self {
            KeySource::Path(path) => {
                check_permissions(path)?;
                Ok(KeyFile::Disk(path.clone()))
            }
            KeySource::Agent => Err(ExecError::SshKeyError(
                "ssh-agent authentication is not supported, set a password or identity"
                    .to_string(),
            )),
            KeySource::Env(var) => {
                let encoded = std::env::var(var)
                    .map_err(|_| ExecError::SshKeyError(format!("{var} is not set")))?;
                let decoded = decode(&encoded)
                    .map_err(|e| ExecError::SshKeyError(format!("{var}: invalid base64: {e}")))?;
                Ok(KeyFile::Temp(write_temp(&decoded)?))
            }
        }
    }
}

fn decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), ExecError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(ExecError::SshKeyError(format!(
            "{}: permissions {:o} are too open",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(path: &Path) -> Result<(), ExecError> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))
}

// NamedTempFile is created 0600 on unix
fn write_temp(key: &[u8]) -> Result<NamedTempFile, ExecError> {
    let io = |e: std::io::Error| ExecError::SshKeyError(format!("temporary key file: {e}"));
    let mut file = tempfile::Builder::new()
        .prefix("fleetkit-key-")
        .tempfile()
        .map_err(io)?;
    file.write_all(key).map_err(io)?;
    file.flush().map_err(io)?;
    debug!(path = %file.path().display(), "wrote temporary key file");
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_lives_until_drop() {
        let var = "FLEETKIT_TEST_KEY_ROUNDTRIP";
        // SAFETY: variable name is unique to this test
        unsafe { std::env::set_var(var, "bm90IHJlYWxseSBhIGtleQ==") };

        let key = KeySource::Env(var.to_string()).key_file().unwrap();
        let path = key.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"not really a key");
        assert!(key.load().is_err());

        drop(key);
        assert!(!path.exists());
    }

    #[test]
    fn test_env_key_unset() {
        let err = KeySource::Env("FLEETKIT_TEST_KEY_UNSET".to_string())
            .key_file()
            .unwrap_err();
        assert!(err.to_string().contains("FLEETKIT_TEST_KEY_UNSET"));
    }

    #[test]
    fn test_missing_key_file() {
        let err = KeySource::Path(PathBuf::from("/nonexistent/id_ed25519"))
            .key_file()
            .unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_open_key_file_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let file = NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = KeySource::Path(file.path().to_path_buf())
            .key_file()
            .unwrap_err();
        assert!(err.to_string().contains("too open"));
    }

    #[test]
    fn test_agent_rejected() {
        assert!(KeySource::Agent.key_file().is_err());
    }
}
