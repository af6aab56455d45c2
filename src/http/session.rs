//! MCP session store.
//!
//! Client-visible sessions keyed by the `Mcp-Session-Id` header, mirrored
//! to a persistence file so an initialized id survives broker restarts
//! until the retention window expires. A reaper drops sessions idle past
//! the configured threshold from both the table and the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpSessionState {
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone)]
pub struct McpSession {
    pub id: Uuid,
    pub state: McpSessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistFile {
    sessions: HashMap<String, PersistEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistEntry {
    created_at: String,
    last_seen: String,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, McpSession>>,
    path: PathBuf,
}

impl SessionStore {
    /// Load persisted sessions, dropping entries older than `retention`.
    pub fn load(path: PathBuf, retention: Duration) -> Self {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let mut sessions = HashMap::new();

        let persisted: PersistFile = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        for (id, entry) in persisted.sessions {
            let Ok(id) = Uuid::try_parse(&id) else {
                continue;
            };
            let Some(last_seen) = parse_time(&entry.last_seen) else {
                continue;
            };
            if last_seen < cutoff {
                debug!(session = %id, "dropping session past retention");
                continue;
            }
            let created_at = parse_time(&entry.created_at).unwrap_or(last_seen);
            sessions.insert(
                id,
                McpSession {
                    id,
                    // A persisted session was initialized by definition.
                    state: McpSessionState::Initialized,
                    created_at,
                    last_activity: last_seen,
                },
            );
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "restored persisted MCP sessions");
        }

        let store = Self {
            sessions: Mutex::new(sessions),
            path,
        };
        store.save();
        store
    }

    /// Resolve the session for a request.
    ///
    /// On `initialize` an unknown or absent id yields a fresh session; on
    /// other methods an unknown supplied id is accepted leniently as an
    /// already-initialized session so clients survive broker restarts that
    /// outlived the persistence file.
    pub fn get_or_create(&self, id: Option<Uuid>, is_initialize: bool) -> McpSession {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();

        if let Some(id) = id {
            if let Some(session) = sessions.get_mut(&id) {
                session.last_activity = now;
                if is_initialize {
                    session.state = McpSessionState::Initialized;
                }
                let session = session.clone();
                self.save_locked(&sessions);
                return session;
            }
        }

        let session = match id {
            // Lenient resume: a supplied-but-unknown id on a non-initialize
            // request becomes an already-initialized session.
            Some(id) if !is_initialize => McpSession {
                id,
                state: McpSessionState::Initialized,
                created_at: now,
                last_activity: now,
            },
            _ => McpSession {
                id: Uuid::new_v4(),
                state: if is_initialize {
                    McpSessionState::Initialized
                } else {
                    McpSessionState::Uninitialized
                },
                created_at: now,
                last_activity: now,
            },
        };
        sessions.insert(session.id, session.clone());
        self.save_locked(&sessions);
        session
    }

    pub fn touch(&self, id: Uuid) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&id) {
            session.last_activity = Utc::now();
            self.save_locked(&sessions);
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<McpSession> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Close sessions idle beyond `idle`, pruning them from persistence.
    pub fn reap_idle(&self, idle: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle).unwrap_or_default();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.last_activity >= cutoff);
        let reaped = before - sessions.len();
        if reaped > 0 {
            info!(reaped, "reaped idle MCP sessions");
            self.save_locked(&sessions);
        }
        reaped
    }

    fn save(&self) {
        self.save_locked(&self.sessions.lock());
    }

    fn save_locked(&self, sessions: &HashMap<Uuid, McpSession>) {
        let persisted = PersistFile {
            sessions: sessions
                .values()
                .map(|session| {
                    (
                        session.id.to_string(),
                        PersistEntry {
                            created_at: session.created_at.to_rfc3339(),
                            last_seen: session.last_activity.to_rfc3339(),
                        },
                    )
                })
                .collect(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&persisted) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "could not persist sessions");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize sessions"),
        }
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
