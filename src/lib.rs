//! repl-gateway broker library.
//!
//! The broker discovers interpreter gates over their descriptor directory,
//! multiplexes tool invocations onto them, and fronts everything to
//! MCP clients over HTTP/SSE. All shared state hangs off one
//! [`BrokerContext`] passed explicitly to every component.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

pub mod broker;
pub mod builtins;
pub mod config;
pub mod error;
pub mod http;
pub mod prefs;

pub use broker::{ConnectionManager, ToolRegistry};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use http::SessionStore;
pub use prefs::Preferences;

use rgw_auth::{NonceStore, SecurityConfig};

/// Sweep cadence for the session reaper and nonce store.
const REAPER_TICK: Duration = Duration::from_secs(60);

/// Maximum age of an unconsumed nonce.
const NONCE_MAX_AGE: Duration = Duration::from_secs(600);

/// Everything the broker shares across components. No hidden globals.
pub struct BrokerContext {
    pub config: BrokerConfig,
    pub security: SecurityConfig,
    pub registry: Arc<ToolRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub sessions: Arc<SessionStore>,
    pub nonces: Arc<NonceStore>,
    pub prefs: Arc<Preferences>,
    pub log_level: Mutex<String>,
    pub started_at: Instant,
}

impl BrokerContext {
    pub fn new(config: BrokerConfig, security: SecurityConfig) -> Arc<Self> {
        let prefs = Arc::new(Preferences::load(config.preferences_file()));
        let registry = Arc::new(ToolRegistry::with_builtins(builtins::builtin_tools()));
        let manager = ConnectionManager::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&prefs),
        );
        let sessions = Arc::new(SessionStore::load(
            config.sessions_file(),
            config.session_retention,
        ));
        Arc::new(Self {
            config,
            security,
            registry,
            manager,
            sessions,
            nonces: Arc::new(NonceStore::new()),
            prefs,
            log_level: Mutex::new("info".to_string()),
            started_at: Instant::now(),
        })
    }

    /// Start the manager tasks and the session/nonce reaper.
    pub fn start_background(self: &Arc<Self>) {
        self.manager.start(true);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAPER_TICK).await;
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                let reaped = ctx.sessions.reap_idle(ctx.config.session_reap_idle);
                if reaped > 0 {
                    debug!(reaped, "session reaper pass");
                }
                ctx.nonces.sweep(NONCE_MAX_AGE);
            }
        });
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
