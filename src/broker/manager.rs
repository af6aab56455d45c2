//! Life-cycle of all gate connections.
//!
//! Two long-lived tasks run against the shared connection table: the
//! watcher discovers new descriptors, the health checker pings and repairs
//! existing connections and keeps the tool registry in sync with each
//! gate's catalog. A third pump drives the stream drain when no UI is
//! attached. All three observe one running flag and exit within a poll
//! interval of shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gate_protocol::ipc::IpcContext;
use gate_protocol::messages::StreamMessage;

use crate::broker::connection::{ConnStatus, Connection, EvalState};
use crate::broker::discovery;
use crate::broker::registry::ToolRegistry;
use crate::config::BrokerConfig;
use crate::prefs::Preferences;

/// Callback fired whenever broker-visible state changes.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// A stream message surfaced to the drain consumer, tagged with the
/// originating connection's display name.
#[derive(Debug, Clone)]
pub struct TaggedMessage {
    pub display_name: String,
    pub message: StreamMessage,
}

pub struct ConnectionManager {
    connections: RwLock<Vec<Arc<Connection>>>,
    ctx: Arc<IpcContext>,
    registry: Arc<ToolRegistry>,
    prefs: Arc<Preferences>,
    config: BrokerConfig,
    callbacks: Mutex<Vec<ChangeCallback>>,
    running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<ToolRegistry>,
        prefs: Arc<Preferences>,
    ) -> Arc<Self> {
        discovery::sweep_orphan_sockets(&config.gates_dir);
        Arc::new(Self {
            connections: RwLock::new(Vec::new()),
            ctx: IpcContext::new(config.ipc.clone()),
            registry,
            prefs,
            config,
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Spawn the watcher, health, and drain-pump tasks.
    ///
    /// Embedders with their own UI loop may skip the pump and call
    /// [`drain_stream_messages`](Self::drain_stream_messages) themselves.
    pub fn start(self: &Arc<Self>, with_drain_pump: bool) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            while watcher.running.load(Ordering::Relaxed) {
                watcher.watcher_tick().await;
                tokio::time::sleep(watcher.config.watcher_interval).await;
            }
        });

        let health = Arc::clone(self);
        tokio::spawn(async move {
            while health.running.load(Ordering::Relaxed) {
                tokio::time::sleep(health.config.health_interval).await;
                if health.running.load(Ordering::Relaxed) {
                    health.health_tick().await;
                }
            }
        });

        if with_drain_pump {
            let pump = Arc::clone(self);
            tokio::spawn(async move {
                while pump.running.load(Ordering::Relaxed) {
                    let _ = pump.drain_stream_messages();
                    tokio::time::sleep(pump.config.drain_interval).await;
                }
            });
        }
    }

    pub fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.lock().push(callback);
    }

    fn fire_change(&self) {
        for callback in self.callbacks.lock().iter() {
            callback();
        }
    }

    /// Snapshot of the connection table.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Find a connection by short key, full session id, or display name.
    pub fn find(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| {
                c.short_key() == key
                    || c.session_id().simple().to_string() == key
                    || c.display_name() == key
            })
            .cloned()
    }

    pub fn find_by_session(&self, session_id: Uuid) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.session_id() == session_id)
            .cloned()
    }

    /// The connection a session-less tool call targets: the single
    /// connected gate, or none when that is ambiguous.
    pub fn default_connection(&self) -> Option<Arc<Connection>> {
        let connected: Vec<Arc<Connection>> = self
            .connections
            .read()
            .iter()
            .filter(|c| c.status() == ConnStatus::Connected)
            .cloned()
            .collect();
        match connected.as_slice() {
            [single] => Some(Arc::clone(single)),
            _ => connected.first().cloned(),
        }
    }

    pub fn gate_attached(&self) -> bool {
        self.connections
            .read()
            .iter()
            .any(|c| c.status() == ConnStatus::Connected)
    }

    /// Drain every connection's subscribe socket, routing tagged frames to
    /// inboxes and returning the rest for display.
    pub fn drain_stream_messages(&self) -> Vec<TaggedMessage> {
        let snapshot = self.connections();
        let mut surfaced = Vec::new();
        for connection in snapshot {
            let display_name = connection.display_name();
            for message in connection.drain_stream() {
                surfaced.push(TaggedMessage {
                    display_name: display_name.clone(),
                    message,
                });
            }
        }
        surfaced
    }

    /// Flip the running flag and tear down all connections.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        let snapshot = self.connections();
        for connection in snapshot {
            connection.disconnect().await;
        }
        info!("connection manager stopped");
    }

    // ------------------------------------------------------------------
    // Watcher
    // ------------------------------------------------------------------

    async fn watcher_tick(&self) {
        let known: Vec<Uuid> = self
            .connections
            .read()
            .iter()
            .map(|c| c.session_id())
            .collect();

        let mut added = false;
        for descriptor in discovery::scan(&self.config.gates_dir) {
            let Some(session_id) = descriptor.session_uuid() else {
                continue;
            };
            if known.contains(&session_id) {
                continue;
            }
            match Connection::connect(
                Arc::clone(&self.ctx),
                &descriptor,
                self.prefs.mirror_default(),
            )
            .await
            {
                Ok(connection) => {
                    self.assign_display_name(&connection);
                    let namespace = self.registry.register_session_tools(
                        session_id,
                        &connection.namespace_hint(),
                        &connection.catalog(),
                    );
                    connection.set_namespace(namespace);
                    self.connections.write().push(connection);
                    added = true;
                }
                Err(e) => {
                    warn!(
                        session = %descriptor.short_key(),
                        error = %e,
                        "could not connect discovered gate"
                    );
                }
            }
        }

        if added {
            self.fire_change();
        }
    }

    /// Derive a display name from the project path basename, deduplicated
    /// against the other live connections.
    fn assign_display_name(&self, connection: &Arc<Connection>) {
        let base = display_base(&connection.project_path(), connection.friendly_name());
        let taken: Vec<String> = self
            .connections
            .read()
            .iter()
            .filter(|c| c.session_id() != connection.session_id())
            .map(|c| c.display_name())
            .collect();
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        connection.set_display_name(candidate);
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_tick(&self) {
        // Snapshot outside the lock so consumers holding it are never
        // blocked behind socket traffic.
        let snapshot = self.connections();
        let mut changed = false;
        let mut to_remove: Vec<Uuid> = Vec::new();

        for connection in snapshot {
            match connection.status() {
                ConnStatus::Connected => {
                    if connection.eval_state() != EvalState::Idle {
                        // Socket is busy streaming; a real ping would queue
                        // behind the eval. Count it as alive.
                        connection.touch_synthetic_ping();
                        continue;
                    }
                    let old_project = connection.project_path();
                    let old_hash = connection.catalog_hash();
                    match connection.ping().await {
                        Ok(pong) => {
                            if pong.project_path != old_project {
                                self.assign_display_name(&connection);
                                changed = true;
                            }
                            if connection.catalog_hash() != old_hash {
                                self.registry
                                    .unregister_session_tools(connection.session_id());
                                let namespace = self.registry.register_session_tools(
                                    connection.session_id(),
                                    &connection.namespace_hint(),
                                    &connection.catalog(),
                                );
                                connection.set_namespace(namespace);
                                changed = true;
                            }
                        }
                        Err(e) => {
                            debug!(session = %connection.short_key(), error = %e, "ping failed");
                            connection.disconnect().await;
                            if connection.descriptor_exists() {
                                changed = true;
                            } else {
                                to_remove.push(connection.session_id());
                            }
                        }
                    }
                }
                ConnStatus::Disconnected => {
                    if connection.descriptor_exists() {
                        match connection.reconnect().await {
                            Ok(()) => {
                                // The gate may have come back with a
                                // different catalog (restart); re-register
                                // unconditionally.
                                self.registry
                                    .unregister_session_tools(connection.session_id());
                                let namespace = self.registry.register_session_tools(
                                    connection.session_id(),
                                    &connection.namespace_hint(),
                                    &connection.catalog(),
                                );
                                connection.set_namespace(namespace);
                                changed = true;
                            }
                            Err(e) => {
                                debug!(
                                    session = %connection.short_key(),
                                    error = %e,
                                    "reconnect attempt failed"
                                );
                            }
                        }
                    } else {
                        to_remove.push(connection.session_id());
                    }
                }
                ConnStatus::Connecting => {}
            }
        }

        if !to_remove.is_empty() {
            self.connections
                .write()
                .retain(|c| !to_remove.contains(&c.session_id()));
            for session_id in &to_remove {
                self.registry.unregister_session_tools(*session_id);
                info!(session = %session_id.simple(), "gate removed");
            }
            changed = true;
        }

        if changed {
            self.fire_change();
        }
    }
}

fn display_base(project_path: &str, friendly_name: &str) -> String {
    let base = Path::new(project_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if base.is_empty() {
        if friendly_name.is_empty() {
            "repl".to_string()
        } else {
            friendly_name.to_string()
        }
    } else {
        base.to_string()
    }
}
