//! Connection-info record for attaching to a running adaptor

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a running adaptor can be reached and how to authenticate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub socket_path: PathBuf,
    pub token: String,
    pub pid: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ConnectionInfo {
    pub fn new(socket_path: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            token: token.into(),
            pid: std::process::id(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Write the record atomically, readable only by the owner
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| Error::Io(e.error))?;

        debug!("Wrote connection info to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Remove the record; a missing file is not an error
    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fresh random token for authenticating channel peers
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
