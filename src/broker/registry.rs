//! Tool registry: built-in tools plus per-session dynamic tools.
//!
//! Session tools are exposed under a namespace prefix resolved against the
//! namespaces currently in use, so the exposed name set stays unique across
//! every connected gate. Mutations enqueue a `tools/list_changed`
//! notification that the dispatcher flushes on its next stream.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use gate_protocol::tools::ToolDescriptor;

use crate::BrokerContext;

/// Method name queued for clients when the catalog mutates.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// A broker-side tool with a handler.
#[async_trait]
pub trait BuiltinTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn call(&self, broker: &BrokerContext, args: Map<String, Value>)
        -> Result<Value, String>;
}

/// Where a registered tool's implementation lives.
#[derive(Clone)]
pub enum ToolKind {
    Builtin(Arc<dyn BuiltinTool>),
    Session {
        session_id: Uuid,
        namespace: String,
        /// Name the gate knows the tool by, without the namespace prefix.
        remote_name: String,
    },
}

/// One registry entry.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Internal id: the exposed name with dots replaced by underscores.
    pub id: String,
    /// Exposed, unique tool name.
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub kind: ToolKind,
}

impl RegisteredTool {
    pub fn session_id(&self) -> Option<Uuid> {
        match &self.kind {
            ToolKind::Session { session_id, .. } => Some(*session_id),
            ToolKind::Builtin(_) => None,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    tools: Vec<RegisteredTool>,
    pending_notifications: Vec<String>,
}

/// Process-wide tool table, guarded by a single mutex.
#[derive(Default)]
pub struct ToolRegistry {
    inner: Mutex<RegistryInner>,
}

fn tool_id(name: &str) -> String {
    name.replace('.', "_")
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(builtins: Vec<Arc<dyn BuiltinTool>>) -> Self {
        let registry = Self::new();
        {
            let mut inner = registry.inner.lock();
            for builtin in builtins {
                inner.tools.push(RegisteredTool {
                    id: tool_id(builtin.name()),
                    name: builtin.name().to_string(),
                    description: builtin.description().to_string(),
                    input_schema: builtin.input_schema(),
                    kind: ToolKind::Builtin(builtin),
                });
            }
        }
        registry
    }

    pub fn list(&self) -> Vec<RegisteredTool> {
        self.inner.lock().tools.clone()
    }

    pub fn find(&self, name: &str) -> Option<RegisteredTool> {
        self.inner
            .lock()
            .tools
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Namespaces currently carried by session tools.
    pub fn used_namespaces(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut namespaces: Vec<String> = inner
            .tools
            .iter()
            .filter_map(|t| match &t.kind {
                ToolKind::Session { namespace, .. } => Some(namespace.clone()),
                ToolKind::Builtin(_) => None,
            })
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    /// Register a gate's tool catalog under a collision-free namespace
    /// derived from `hint`, replacing whatever the session had registered
    /// before. Returns the resolved namespace.
    pub fn register_session_tools(
        &self,
        session_id: Uuid,
        hint: &str,
        descriptors: &[ToolDescriptor],
    ) -> String {
        let mut inner = self.inner.lock();
        inner
            .tools
            .retain(|t| t.session_id() != Some(session_id));

        let namespace = resolve_namespace(hint, &inner.tools);
        for descriptor in descriptors {
            let exposed = format!("{namespace}.{}", descriptor.name);
            inner.tools.push(RegisteredTool {
                id: tool_id(&exposed),
                name: exposed,
                description: descriptor.description.clone(),
                input_schema: descriptor.input_schema(),
                kind: ToolKind::Session {
                    session_id,
                    namespace: namespace.clone(),
                    remote_name: descriptor.name.clone(),
                },
            });
        }
        info!(
            session = %session_id.simple(),
            namespace = %namespace,
            tools = descriptors.len(),
            "registered session tools"
        );
        inner.pending_notifications.push(TOOLS_LIST_CHANGED.to_string());
        namespace
    }

    /// Drop all tools registered by a session.
    pub fn unregister_session_tools(&self, session_id: Uuid) {
        let mut inner = self.inner.lock();
        let before = inner.tools.len();
        inner
            .tools
            .retain(|t| t.session_id() != Some(session_id));
        if inner.tools.len() != before {
            debug!(session = %session_id.simple(), "unregistered session tools");
            inner.pending_notifications.push(TOOLS_LIST_CHANGED.to_string());
        }
    }

    /// Take the queued change notifications for flushing.
    pub fn take_notifications(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().pending_notifications)
    }

    pub fn has_pending_notifications(&self) -> bool {
        !self.inner.lock().pending_notifications.is_empty()
    }
}

/// Resolve a namespace hint against the table: the hint itself when free,
/// otherwise the first free of `hint_2`, `hint_3`, ….
fn resolve_namespace(hint: &str, tools: &[RegisteredTool]) -> String {
    let hint = if hint.is_empty() { "session" } else { hint };
    let in_use = |candidate: &str| {
        tools.iter().any(|t| match &t.kind {
            ToolKind::Session { namespace, .. } => namespace == candidate,
            ToolKind::Builtin(_) => false,
        })
    };
    if !in_use(hint) {
        return hint.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{hint}_{n}");
        if !in_use(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
