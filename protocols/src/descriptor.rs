//! On-disk session descriptors and the well-known gate directory.
//!
//! Each running gate owns three files in the gate directory, all sharing
//! the session-id stem: `<sid>.json` (the descriptor), `<sid>.sock` (the
//! request endpoint) and `<sid>-stream.sock` (the publish endpoint).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type DescriptorResult<T> = Result<T, DescriptorError>;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor parse failed for {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("descriptor at {path} has malformed session id {sid:?}")]
    BadSessionId { path: PathBuf, sid: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Descriptor file contents, one per gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDescriptor {
    /// 16-byte UUID rendered as 32 hex chars.
    pub session_id: String,
    pub name: String,
    pub pid: i32,
    pub interpreter_version: String,
    pub project_path: String,
    /// `ipc://<absolute socket path>` of the request endpoint.
    pub endpoint: String,
    /// `ipc://<absolute socket path>` of the publish endpoint.
    pub stream_endpoint: String,
    /// ISO-8601 local timestamp.
    pub started_at: String,
}

impl GateDescriptor {
    pub fn new(
        session_id: Uuid,
        name: impl Into<String>,
        interpreter_version: impl Into<String>,
        project_path: impl Into<String>,
        dir: &Path,
    ) -> Self {
        let sid = session_id.simple().to_string();
        Self {
            endpoint: format!("ipc://{}", socket_path(dir, &sid).display()),
            stream_endpoint: format!("ipc://{}", stream_socket_path(dir, &sid).display()),
            session_id: sid,
            name: name.into(),
            pid: std::process::id() as i32,
            interpreter_version: interpreter_version.into(),
            project_path: project_path.into(),
            started_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }

    pub fn session_uuid(&self) -> Option<Uuid> {
        Uuid::try_parse(&self.session_id).ok()
    }

    /// First 8 chars of the session id.
    pub fn short_key(&self) -> &str {
        &self.session_id[..self.session_id.len().min(8)]
    }

    pub fn started_at_local(&self) -> Option<DateTime<Local>> {
        DateTime::parse_from_rfc3339(&self.started_at)
            .ok()
            .map(|t| t.with_timezone(&Local))
    }

    pub fn request_socket(&self) -> Option<PathBuf> {
        endpoint_to_path(&self.endpoint)
    }

    pub fn stream_socket(&self) -> Option<PathBuf> {
        endpoint_to_path(&self.stream_endpoint)
    }

    /// Whether the process named by this descriptor is still alive,
    /// checked with a no-op signal.
    pub fn process_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    pub fn load(path: &Path) -> DescriptorResult<Self> {
        let bytes = fs::read(path)?;
        let descriptor: Self =
            serde_json::from_slice(&bytes).map_err(|source| DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if descriptor.session_uuid().is_none() {
            return Err(DescriptorError::BadSessionId {
                path: path.to_path_buf(),
                sid: descriptor.session_id.clone(),
            });
        }
        Ok(descriptor)
    }

    pub fn write_to(&self, dir: &Path) -> DescriptorResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = descriptor_path(dir, &self.session_id);
        let body = serde_json::to_vec_pretty(self).map_err(|source| DescriptorError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, body)?;
        Ok(path)
    }
}

/// Strip the `ipc://` scheme from an endpoint URI.
pub fn endpoint_to_path(endpoint: &str) -> Option<PathBuf> {
    endpoint.strip_prefix("ipc://").map(PathBuf::from)
}

/// Per-user gate directory, `<cache>/repl-gateway/gates`.
pub fn default_gates_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("repl-gateway")
        .join("gates")
}

pub fn descriptor_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.json"))
}

pub fn socket_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.sock"))
}

pub fn stream_socket_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}-stream.sock"))
}

/// Remove a session's descriptor and both socket files. Missing files are
/// not an error.
pub fn remove_session_files(dir: &Path, session_id: &str) {
    for path in [
        descriptor_path(dir, session_id),
        socket_path(dir, session_id),
        stream_socket_path(dir, session_id),
    ] {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "could not remove session file");
            }
        }
    }
}

/// Liveness probe via signal 0.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // EPERM means the process exists but belongs to someone else.
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}
