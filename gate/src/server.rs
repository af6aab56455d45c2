//! Gate request loop and session lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gate_protocol::descriptor::{self, GateDescriptor};
use gate_protocol::ipc::{IpcConfig, IpcContext, PublishSocket, RequestListener, RequestStream};
use gate_protocol::messages::{
    GateOptions, GateReply, GateRequest, PongInfo, StreamChannel, StreamMessage, ToolOutcome,
};
use gate_protocol::wire::{self, WireError};

use crate::error::{GateError, GateResult};
use crate::eval::{run_eval, EvalEnv, Mirror};
use crate::interpreter::Interpreter;
use crate::session_tools::{coerce_arguments, SessionToolBinding, ToolContext};
#[cfg(unix)]
use crate::tty::TtyHandoff;

/// Interval at which the request loop wakes to observe the shutdown flag.
const LOOP_TICK: Duration = Duration::from_secs(1);

/// Pause after acknowledging a restart so the publish backlog drains.
const RESTART_DRAIN: Duration = Duration::from_millis(100);

/// What a gate does when asked to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Exec the interpreter image over the current process, preserving pid
    /// and controlling terminal.
    Exec,
    /// Tear the session down and bring it back up inside the current
    /// process, keeping the session id. For embedders that own their
    /// process lifecycle, and for tests.
    Respawn,
}

/// Gate configuration supplied by the embedding interpreter.
pub struct GateConfig {
    /// Friendly session name shown by the broker.
    pub name: String,
    /// Namespace hint for session-tool prefixing.
    pub namespace: String,
    pub project_path: PathBuf,
    /// Reuse an existing session id (restart) instead of generating one.
    pub session_id: Option<Uuid>,
    /// Start even when stdin is not a terminal.
    pub force: bool,
    pub allow_restart: bool,
    pub allow_mirror: bool,
    /// Initial mirror state; the broker may flip it via `set_option`.
    pub mirror_repl: bool,
    /// Override of the well-known gate directory.
    pub gates_dir: Option<PathBuf>,
    pub tools: Vec<SessionToolBinding>,
    pub restart_mode: RestartMode,
    /// Argument vector for the replacement process; defaults to the
    /// original argv.
    pub restart_argv: Option<Vec<String>>,
    pub ipc: IpcConfig,
}

impl GateConfig {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            project_path: PathBuf::new(),
            session_id: None,
            force: false,
            allow_restart: true,
            allow_mirror: true,
            mirror_repl: false,
            gates_dir: None,
            tools: Vec::new(),
            restart_mode: RestartMode::Exec,
            restart_argv: None,
            ipc: IpcConfig::default(),
        }
    }
}

/// Handle returned to the embedder; keep it alive for the session.
pub struct GateHandle {
    session_id: Uuid,
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl GateHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Request shutdown and wait for the session files to be removed.
    pub async fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.task.await;
    }
}

/// Start a gate inside this process.
///
/// Returns `Ok(None)` without doing anything when the process is
/// non-interactive and `force` is not set.
pub async fn start(
    interpreter: Arc<dyn Interpreter>,
    config: GateConfig,
) -> GateResult<Option<GateHandle>> {
    use std::io::IsTerminal;
    if !config.force && !std::io::stdin().is_terminal() {
        debug!("stdin is not a terminal and force is unset; gate not started");
        return Ok(None);
    }

    let mut config = config;
    if config.namespace.is_empty() {
        config.namespace = config
            .project_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repl")
            .to_string();
    }

    let session_id = config.session_id.unwrap_or_else(Uuid::new_v4);
    let dir = config
        .gates_dir
        .clone()
        .unwrap_or_else(descriptor::default_gates_dir);
    let shutdown = Arc::new(AtomicBool::new(false));

    // Bind synchronously so bind failures surface to the caller.
    let session = GateSession::bind(&interpreter, &config, session_id, &dir)?;
    info!(
        session = %session.descriptor.short_key(),
        socket = %session.listener.path().display(),
        "gate listening"
    );

    let task = tokio::spawn(run_loop(
        session,
        interpreter,
        config,
        dir.clone(),
        Arc::clone(&shutdown),
    ));

    Ok(Some(GateHandle {
        session_id,
        shutdown,
        task,
    }))
}

/// One bound incarnation of a session: sockets plus descriptor.
struct GateSession {
    listener: RequestListener,
    publisher: Arc<PublishSocket>,
    descriptor: GateDescriptor,
    session_id: Uuid,
}

impl GateSession {
    fn bind(
        interpreter: &Arc<dyn Interpreter>,
        config: &GateConfig,
        session_id: Uuid,
        dir: &PathBuf,
    ) -> GateResult<Self> {
        std::fs::create_dir_all(dir)?;
        let sid = session_id.simple().to_string();
        let ctx = IpcContext::new(config.ipc.clone());
        let listener = RequestListener::bind(descriptor::socket_path(dir, &sid))?;
        let publisher = Arc::new(PublishSocket::bind(
            &ctx,
            descriptor::stream_socket_path(dir, &sid),
        )?);
        let descriptor = GateDescriptor::new(
            session_id,
            &config.name,
            interpreter.version(),
            config.project_path.display().to_string(),
            dir,
        );
        descriptor.write_to(dir)?;
        Ok(Self {
            listener,
            publisher,
            descriptor,
            session_id,
        })
    }
}

enum Flow {
    Continue,
    Shutdown,
    Restart,
}

enum Outcome {
    Shutdown,
    Restart,
}

/// Per-incarnation state shared with async eval and tool tasks.
struct GateRuntime {
    interpreter: Arc<dyn Interpreter>,
    tools: Vec<SessionToolBinding>,
    publisher: Arc<PublishSocket>,
    mirror: Arc<Mirror>,
    eval_lock: Arc<tokio::sync::Mutex<()>>,
    started: Instant,
    namespace: String,
    project_path: PathBuf,
    allow_restart: bool,
    allow_mirror: bool,
    #[cfg(unix)]
    tty: parking_lot::Mutex<Option<TtyHandoff>>,
}

impl GateRuntime {
    fn eval_env(&self) -> EvalEnv {
        EvalEnv {
            interpreter: Arc::clone(&self.interpreter),
            publisher: Arc::clone(&self.publisher),
            mirror: Arc::clone(&self.mirror),
            eval_lock: Arc::clone(&self.eval_lock),
        }
    }

    fn restore_tty(&self) {
        #[cfg(unix)]
        if let Some(handoff) = self.tty.lock().take() {
            handoff.restore();
        }
    }
}

async fn run_loop(
    mut session: GateSession,
    interpreter: Arc<dyn Interpreter>,
    config: GateConfig,
    dir: PathBuf,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let runtime = Arc::new(GateRuntime {
            interpreter: Arc::clone(&interpreter),
            tools: config.tools.clone(),
            publisher: Arc::clone(&session.publisher),
            mirror: Arc::new(Mirror::new(config.allow_mirror, config.mirror_repl)),
            eval_lock: Arc::new(tokio::sync::Mutex::new(())),
            started: Instant::now(),
            namespace: config.namespace.clone(),
            project_path: config.project_path.clone(),
            allow_restart: config.allow_restart,
            allow_mirror: config.allow_mirror,
            #[cfg(unix)]
            tty: parking_lot::Mutex::new(None),
        });

        let outcome = serve_session(&session, &runtime, &shutdown).await;

        if matches!(outcome, Outcome::Restart) {
            tokio::time::sleep(RESTART_DRAIN).await;
        }
        runtime.restore_tty();
        session.publisher.close().await;
        let sid = session.session_id.simple().to_string();
        descriptor::remove_session_files(&dir, &sid);

        match outcome {
            Outcome::Shutdown => break,
            Outcome::Restart => match config.restart_mode {
                RestartMode::Exec => {
                    let argv = crate::restart::restart_argv(config.restart_argv.as_deref());
                    let err = crate::restart::exec_in_place(
                        &argv,
                        session.session_id,
                        &config.namespace,
                    );
                    error!(error = %err, "restart exec failed");
                    std::process::exit(1);
                }
                RestartMode::Respawn => {
                    match GateSession::bind(&interpreter, &config, session.session_id, &dir) {
                        Ok(next) => {
                            info!(session = %next.descriptor.short_key(), "gate respawned");
                            session = next;
                        }
                        Err(e) => {
                            error!(error = %e, "gate respawn failed");
                            break;
                        }
                    }
                }
            },
        }
    }
}

async fn serve_session(
    session: &GateSession,
    runtime: &Arc<GateRuntime>,
    shutdown: &Arc<AtomicBool>,
) -> Outcome {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Outcome::Shutdown;
        }
        match session.listener.accept(LOOP_TICK).await {
            Ok(None) => continue,
            Ok(Some(mut stream)) => {
                if let Some(outcome) = serve_stream(&mut stream, runtime, shutdown).await {
                    return outcome;
                }
            }
            Err(e) => {
                error!(error = %e, "request accept failed");
                return Outcome::Shutdown;
            }
        }
    }
}

/// Serve one broker connection. Returns `Some` when the whole session must
/// end, `None` when the peer went away and the gate should re-accept.
async fn serve_stream(
    stream: &mut RequestStream,
    runtime: &Arc<GateRuntime>,
    shutdown: &Arc<AtomicBool>,
) -> Option<Outcome> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Some(Outcome::Shutdown);
        }
        let frame = match stream.read_request(LOOP_TICK).await {
            Ok(None) => continue,
            Ok(Some(frame)) => frame,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("broker connection closed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "request read failed");
                return None;
            }
        };

        let (reply, flow) = dispatch(&frame, runtime).await;
        let encoded = match wire::encode(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "could not encode reply");
                return None;
            }
        };
        if let Err(e) = stream.send_reply(&encoded).await {
            warn!(error = %e, "reply send failed");
            return None;
        }

        match flow {
            Flow::Continue => {}
            Flow::Shutdown => return Some(Outcome::Shutdown),
            Flow::Restart => return Some(Outcome::Restart),
        }
    }
}

async fn dispatch(frame: &[u8], runtime: &Arc<GateRuntime>) -> (GateReply, Flow) {
    let request: GateRequest = match wire::decode(frame) {
        Ok(request) => request,
        Err(e) => {
            return (
                GateReply::Error {
                    message: format!("malformed request: {e}"),
                },
                Flow::Continue,
            )
        }
    };

    match request {
        GateRequest::Ping => (GateReply::Pong(pong_info(runtime)), Flow::Continue),

        GateRequest::Eval { code, display_code } => {
            let record = run_eval(&runtime.eval_env(), code, display_code).await;
            (GateReply::EvalResult(record), Flow::Continue)
        }

        GateRequest::EvalAsync {
            code,
            display_code,
            request_id,
        } => {
            spawn_async_eval(runtime, code, display_code, request_id.clone());
            (GateReply::Accepted { request_id }, Flow::Continue)
        }

        GateRequest::SetOption { key, value } => (set_option(runtime, &key, value), Flow::Continue),

        GateRequest::GetOptions => (
            GateReply::Options(GateOptions {
                mirror_repl: runtime.mirror.enabled(),
                allow_mirror: runtime.allow_mirror,
            }),
            Flow::Continue,
        ),

        GateRequest::SetTty { path } => (set_tty(runtime, &path), Flow::Continue),

        GateRequest::RestoreTty => {
            runtime.restore_tty();
            (GateReply::Ok, Flow::Continue)
        }

        GateRequest::ToolCall { name, arguments } => {
            let reply = match invoke_tool(runtime, &name, arguments, None).await {
                Ok(value) => GateReply::ToolResult { value },
                Err(message) => GateReply::Error { message },
            };
            (reply, Flow::Continue)
        }

        GateRequest::ToolCallAsync {
            name,
            arguments,
            request_id,
        } => {
            spawn_async_tool(runtime, name, arguments, request_id.clone());
            (GateReply::Accepted { request_id }, Flow::Continue)
        }

        GateRequest::ListTools => (
            GateReply::Tools {
                tools: runtime.tools.iter().map(|b| b.descriptor.clone()).collect(),
            },
            Flow::Continue,
        ),

        GateRequest::Shutdown => (GateReply::Ok, Flow::Shutdown),

        GateRequest::Restart => {
            if runtime.allow_restart {
                (GateReply::Ok, Flow::Restart)
            } else {
                (
                    GateReply::Error {
                        message: GateError::RestartNotAllowed.to_string(),
                    },
                    Flow::Continue,
                )
            }
        }
    }
}

fn pong_info(runtime: &GateRuntime) -> PongInfo {
    PongInfo {
        pid: std::process::id() as i32,
        uptime_secs: runtime.started.elapsed().as_secs_f64(),
        interpreter_version: runtime.interpreter.version(),
        project_path: runtime.project_path.display().to_string(),
        tools: runtime.tools.iter().map(|b| b.descriptor.clone()).collect(),
        namespace: runtime.namespace.clone(),
        allow_restart: runtime.allow_restart,
        allow_mirror: runtime.allow_mirror,
        mirror_repl: runtime.mirror.enabled(),
    }
}

fn set_option(runtime: &GateRuntime, key: &str, value: Value) -> GateReply {
    match key {
        "mirror_repl" => {
            let Some(on) = value.as_bool() else {
                return GateReply::Error {
                    message: "mirror_repl expects a boolean".to_string(),
                };
            };
            if on && !runtime.allow_mirror {
                return GateReply::Error {
                    message: GateError::MirrorNotAllowed.to_string(),
                };
            }
            runtime.mirror.set_enabled(on);
            GateReply::OptionSet {
                key: key.to_string(),
                value,
            }
        }
        other => GateReply::Error {
            message: GateError::UnknownOption(other.to_string()).to_string(),
        },
    }
}

#[cfg(unix)]
fn set_tty(runtime: &GateRuntime, path: &str) -> GateReply {
    match TtyHandoff::install(path) {
        Ok(handoff) => {
            let (rows, cols) = (handoff.rows, handoff.cols);
            if let Some(previous) = runtime.tty.lock().replace(handoff) {
                previous.restore();
            }
            GateReply::TtyInstalled {
                tty_path: path.to_string(),
                rows,
                cols,
            }
        }
        Err(e) => GateReply::Error {
            message: e.to_string(),
        },
    }
}

#[cfg(not(unix))]
fn set_tty(_runtime: &GateRuntime, _path: &str) -> GateReply {
    GateReply::Error {
        message: GateError::TtyUnsupported.to_string(),
    }
}

fn spawn_async_eval(
    runtime: &Arc<GateRuntime>,
    code: String,
    display_code: Option<String>,
    request_id: String,
) {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        let record = run_eval(&runtime.eval_env(), code, display_code).await;
        let channel = if record.is_failure() {
            StreamChannel::EvalError
        } else {
            StreamChannel::EvalComplete
        };
        publish_terminal(&runtime, channel, &request_id, &record).await;
    });
}

fn spawn_async_tool(
    runtime: &Arc<GateRuntime>,
    name: String,
    arguments: serde_json::Map<String, Value>,
    request_id: String,
) {
    let runtime = Arc::clone(runtime);
    tokio::spawn(async move {
        // Progress lines flow through a channel so handlers on the blocking
        // worker never touch the socket directly.
        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(64);
        let forwarder = {
            let runtime = Arc::clone(&runtime);
            let request_id = request_id.clone();
            tokio::spawn(async move {
                while let Some(text) = progress_rx.recv().await {
                    match wire::encode(&StreamMessage::progress(request_id.as_str(), text)) {
                        Ok(frame) => runtime.publisher.publish(&frame).await,
                        Err(e) => warn!(error = %e, "could not encode progress frame"),
                    }
                }
            })
        };

        let result = invoke_tool(&runtime, &name, arguments, Some(progress_tx)).await;
        let _ = forwarder.await;

        let (channel, outcome) = match result {
            Ok(value) => (
                StreamChannel::ToolComplete,
                ToolOutcome {
                    value,
                    error: None,
                    dropped_chunks: 0,
                },
            ),
            Err(message) => (StreamChannel::ToolError, ToolOutcome::failure(message)),
        };
        publish_terminal(&runtime, channel, &request_id, &outcome).await;
    });
}

async fn publish_terminal<T: serde::Serialize>(
    runtime: &GateRuntime,
    channel: StreamChannel,
    request_id: &str,
    record: &T,
) {
    let payload = match wire::encode(record) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "could not encode terminal record");
            return;
        }
    };
    match wire::encode(&StreamMessage::terminal(channel, request_id, payload)) {
        Ok(frame) => runtime.publisher.publish(&frame).await,
        Err(e) => error!(error = %e, "could not encode terminal frame"),
    }
}

async fn invoke_tool(
    runtime: &Arc<GateRuntime>,
    name: &str,
    arguments: serde_json::Map<String, Value>,
    progress_tx: Option<mpsc::Sender<String>>,
) -> Result<Value, String> {
    let binding = runtime
        .tools
        .iter()
        .find(|b| b.descriptor.name == name)
        .cloned()
        .ok_or_else(|| GateError::UnknownTool(name.to_string()).to_string())?;

    let coerced = coerce_arguments(&binding.descriptor, arguments)?;

    let context = ToolContext::new(progress_tx.map(|tx| {
        Box::new(move |text: &str| {
            let _ = tx.blocking_send(text.to_string());
        }) as Box<dyn Fn(&str) + Send + Sync>
    }));

    let _execution = runtime.eval_lock.lock().await;
    let handler = Arc::clone(&binding.handler);
    tokio::task::spawn_blocking(move || handler(coerced, &context))
        .await
        .map_err(|e| format!("tool handler aborted: {e}"))?
}
