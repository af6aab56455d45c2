//! Deterministic scripted interpreter for integration tests.
//!
//! The command language is line-oriented; an eval runs every line in order:
//!
//! - `print <n> <text>` — write `<text>` to stdout `<n>` times, one line each
//! - `eprint <text>` — write one line to stderr
//! - `sleep <ms>` — block the eval worker
//! - `value <repr>` — set the result repr
//! - `raise <message>` — finish with an exception
//!
//! A bare `<int> + <int>` line evaluates to its sum, which keeps simple
//! arithmetic probes working without a command prefix.

use std::io::Write;
use std::time::Duration;

use crate::interpreter::{EvalStreams, EvalValue, Interpreter};

/// Scripted stand-in for a real interpreter.
#[derive(Debug, Default)]
pub struct ScriptedInterpreter {
    version: String,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self {
            version: "scripted-1.0".to_string(),
        }
    }
}

impl Interpreter for ScriptedInterpreter {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn eval(&self, code: &str, streams: &mut EvalStreams<'_>) -> EvalValue {
        let mut repr = "nothing".to_string();

        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(sum) = eval_addition(line) {
                repr = sum.to_string();
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => {
                    let (count, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    let count: usize = count.parse().unwrap_or(1);
                    for _ in 0..count {
                        let _ = writeln!(streams.stdout, "{text}");
                    }
                }
                "eprint" => {
                    let _ = writeln!(streams.stderr, "{rest}");
                }
                "sleep" => {
                    let ms: u64 = rest.parse().unwrap_or(0);
                    std::thread::sleep(Duration::from_millis(ms));
                }
                "value" => {
                    repr = rest.to_string();
                }
                "raise" => {
                    return EvalValue::Exception {
                        message: rest.to_string(),
                        backtrace: format!("scripted backtrace for: {rest}"),
                    };
                }
                other => {
                    return EvalValue::Exception {
                        message: format!("unknown command: {other}"),
                        backtrace: String::new(),
                    };
                }
            }
        }

        EvalValue::Value { repr }
    }
}

fn eval_addition(line: &str) -> Option<i64> {
    let (lhs, rhs) = line.split_once('+')?;
    let lhs: i64 = lhs.trim().parse().ok()?;
    let rhs: i64 = rhs.trim().parse().ok()?;
    Some(lhs + rhs)
}
