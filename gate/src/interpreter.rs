//! The seam between the gate and its host interpreter.

use std::io::Write;

/// Output streams handed to an evaluation.
///
/// The gate owns the far end of both: every complete line is buffered for
/// the final result record, published on the stream socket, and optionally
/// mirrored to the interpreter's original stdout.
pub struct EvalStreams<'a> {
    pub stdout: &'a mut (dyn Write + Send),
    pub stderr: &'a mut (dyn Write + Send),
}

/// What an evaluation produced.
///
/// User-code exceptions are values here, never panics: the gate renders
/// them into the result record and keeps serving.
#[derive(Debug, Clone)]
pub enum EvalValue {
    /// The interpreter's canonical display form of the result.
    Value { repr: String },
    Exception {
        message: String,
        backtrace: String,
    },
}

/// A host interpreter capable of evaluating code.
///
/// `eval` is called on a blocking worker with the gate's eval lock held, so
/// implementations may freely touch single-threaded interpreter state.
pub trait Interpreter: Send + Sync + 'static {
    /// Interpreter version string reported in `pong`.
    fn version(&self) -> String;

    /// Evaluate `code`, writing any produced output to `streams`.
    fn eval(&self, code: &str, streams: &mut EvalStreams<'_>) -> EvalValue;
}
