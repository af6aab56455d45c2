//! Output capture for evaluations.
//!
//! Every eval gets a fresh pair of line sinks. The interpreter writes into
//! them from a blocking worker; per-channel forwarder tasks buffer each
//! completed line, publish it on the stream socket, and mirror it when
//! mirroring is on. Dropping the sinks closes the channels, so joining the
//! forwarders guarantees all output frames precede the terminal event.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gate_protocol::ipc::PublishSocket;
use gate_protocol::messages::{EvalRecord, StreamChannel, StreamMessage};
use gate_protocol::wire;

use crate::interpreter::{EvalStreams, EvalValue, Interpreter};

/// Marker prepended to mirrored input lines.
const MIRROR_PROMPT: &str = "rgw> ";

/// Mirroring of gate traffic onto the interpreter's original stdout.
///
/// Strictly a developer-visibility aid: any write failure (the original
/// pipe may be gone) disables mirroring and is swallowed.
pub(crate) struct Mirror {
    allowed: bool,
    enabled: AtomicBool,
}

impl Mirror {
    pub fn new(allowed: bool, initially_on: bool) -> Self {
        Self {
            allowed,
            enabled: AtomicBool::new(allowed && initially_on),
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(self.allowed && on, Ordering::Relaxed);
    }

    pub fn echo_input(&self, display_code: &str) {
        for line in display_code.lines() {
            self.write_line(&format!("{MIRROR_PROMPT}{line}"));
        }
    }

    pub fn write_line(&self, line: &str) {
        if !self.enabled() {
            return;
        }
        use io::Write;
        let mut stdout = io::stdout().lock();
        if writeln!(stdout, "{line}").is_err() || stdout.flush().is_err() {
            debug!("mirror write failed; disabling mirroring");
            self.enabled.store(false, Ordering::Relaxed);
        }
    }
}

/// `io::Write` adapter that turns byte writes into complete lines on an
/// mpsc channel. The trailing partial line, if any, is flushed on drop.
pub(crate) struct OutputSink {
    tx: mpsc::Sender<String>,
    partial: String,
}

impl OutputSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            partial: String::new(),
        }
    }

    fn emit(&mut self, line: String) {
        // Receiver lives for the whole eval; an error only means the
        // forwarder is gone, in which case output is silently discarded.
        let _ = self.tx.blocking_send(line);
    }
}

impl io::Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.push_str(&String::from_utf8_lossy(buf));
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.emit(line.trim_end_matches('\n').to_string());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.emit(line);
        }
    }
}

/// Everything [`run_eval`] needs from the gate.
pub(crate) struct EvalEnv {
    pub interpreter: Arc<dyn Interpreter>,
    pub publisher: Arc<PublishSocket>,
    pub mirror: Arc<Mirror>,
    /// Serializes actual interpreter execution; concurrent async evals
    /// queue here while their streaming machinery stays independent.
    pub eval_lock: Arc<tokio::sync::Mutex<()>>,
}

async fn forward_lines(
    mut rx: mpsc::Receiver<String>,
    channel: StreamChannel,
    publisher: Arc<PublishSocket>,
    mirror: Arc<Mirror>,
) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
        match wire::encode(&StreamMessage::output(channel, line.clone())) {
            Ok(frame) => publisher.publish(&frame).await,
            Err(e) => warn!(error = %e, "could not encode output frame"),
        }
        mirror.write_line(&line);
        lines.push(line);
    }
    lines
}

fn spawn_forwarder(
    channel: StreamChannel,
    env: &EvalEnv,
) -> (mpsc::Sender<String>, JoinHandle<Vec<String>>) {
    let (tx, rx) = mpsc::channel(256);
    let join = tokio::spawn(forward_lines(
        rx,
        channel,
        Arc::clone(&env.publisher),
        Arc::clone(&env.mirror),
    ));
    (tx, join)
}

/// Run one evaluation to completion, streaming its output.
///
/// All `stdout`/`stderr` frames for this eval are published before this
/// function returns, which is what lets async callers publish the terminal
/// event strictly after the output it describes.
pub(crate) async fn run_eval(env: &EvalEnv, code: String, display_code: Option<String>) -> EvalRecord {
    env.mirror
        .echo_input(display_code.as_deref().unwrap_or(&code));

    let (out_tx, out_join) = spawn_forwarder(StreamChannel::Stdout, env);
    let (err_tx, err_join) = spawn_forwarder(StreamChannel::Stderr, env);

    let interpreter = Arc::clone(&env.interpreter);
    let outcome = {
        let _execution = env.eval_lock.lock().await;
        tokio::task::spawn_blocking(move || {
            let mut stdout = OutputSink::new(out_tx);
            let mut stderr = OutputSink::new(err_tx);
            let mut streams = EvalStreams {
                stdout: &mut stdout,
                stderr: &mut stderr,
            };
            interpreter.eval(&code, &mut streams)
        })
        .await
    };

    // Sinks are dropped once the closure finishes (or unwinds), closing the
    // channels; the forwarders then drain and finish.
    let stdout_lines = out_join.await.unwrap_or_default();
    let stderr_lines = err_join.await.unwrap_or_default();

    let record = match outcome {
        Ok(EvalValue::Value { repr }) => EvalRecord {
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
            value_repr: repr,
            exception: None,
            backtrace: None,
            dropped_chunks: 0,
        },
        Ok(EvalValue::Exception { message, backtrace }) => EvalRecord {
            stdout: stdout_lines.join("\n"),
            stderr: stderr_lines.join("\n"),
            value_repr: String::new(),
            exception: Some(message),
            backtrace: Some(backtrace),
            dropped_chunks: 0,
        },
        Err(join_error) => {
            warn!(error = %join_error, "evaluation worker aborted");
            let mut record = EvalRecord::failure(format!("evaluation aborted: {join_error}"));
            record.stdout = stdout_lines.join("\n");
            record.stderr = stderr_lines.join("\n");
            record
        }
    };

    if record.exception.is_none() && !record.value_repr.is_empty() {
        env.mirror.write_line(&record.value_repr);
    }
    record
}
