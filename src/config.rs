//! Broker configuration.
//!
//! Every interval and deadline the broker uses lives here so embedders and
//! tests can tighten them; the defaults match production behavior.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use gate_protocol::descriptor;
use gate_protocol::ipc::IpcConfig;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Directory scanned for gate descriptors.
    pub gates_dir: PathBuf,
    /// Directory for broker-owned state (session persistence, preferences).
    pub state_dir: PathBuf,
    /// Discovery poll interval for the watcher task.
    pub watcher_interval: Duration,
    /// Ping interval for the health-check task.
    pub health_interval: Duration,
    /// Tick of the built-in stream-drain pump.
    pub drain_interval: Duration,
    /// Default deadline for asynchronous gate operations.
    pub async_deadline: Duration,
    /// MCP sessions idle beyond this are reaped.
    pub session_reap_idle: Duration,
    /// Persisted MCP sessions older than this are dropped on load.
    pub session_retention: Duration,
    pub ipc: IpcConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8642,
            gates_dir: descriptor::default_gates_dir(),
            state_dir: default_state_dir(),
            watcher_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            drain_interval: Duration::from_millis(25),
            async_deadline: Duration::from_secs(60),
            session_reap_idle: Duration::from_secs(300),
            session_retention: Duration::from_secs(30 * 24 * 60 * 60),
            ipc: IpcConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn sessions_file(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.state_dir.join("preferences.json")
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("repl-gateway")
}
