//! In-place restart of the host interpreter process.
//!
//! The gate execs the interpreter image over itself, preserving the pid and
//! controlling terminal. The environment handshake lets the replacement
//! process skip its default automatic gate start and instead bring up a
//! gate forced onto the same session id, so the broker's connection record
//! survives the swap.

use uuid::Uuid;

/// Set on the replacement process while a restart is in flight.
pub const RESTART_ENV: &str = "RGW_GATE_RESTART";
/// Session id the replacement gate must reuse.
pub const SESSION_ENV: &str = "RGW_GATE_SESSION_ID";
/// Namespace the replacement gate must reuse.
pub const NAMESPACE_ENV: &str = "RGW_GATE_NAMESPACE";

/// Check whether this process was exec'd as part of a gate restart.
///
/// Returns the session id to resume, and clears the handshake variables so
/// a later unrelated spawn does not inherit them.
pub fn restart_pending() -> Option<(Uuid, Option<String>)> {
    if std::env::var_os(RESTART_ENV).is_none() {
        return None;
    }
    let sid = std::env::var(SESSION_ENV).ok()?;
    let sid = Uuid::try_parse(&sid).ok()?;
    let namespace = std::env::var(NAMESPACE_ENV).ok();
    std::env::remove_var(RESTART_ENV);
    std::env::remove_var(SESSION_ENV);
    std::env::remove_var(NAMESPACE_ENV);
    Some((sid, namespace))
}

/// Build the argument vector for the replacement process: the configured
/// one if the embedder supplied it, the original `argv` otherwise.
pub(crate) fn restart_argv(configured: Option<&[String]>) -> Vec<String> {
    match configured {
        Some(argv) if !argv.is_empty() => argv.to_vec(),
        _ => std::env::args().collect(),
    }
}

/// Replace the current process image. Only returns on failure.
#[cfg(unix)]
pub(crate) fn exec_in_place(
    argv: &[String],
    session_id: Uuid,
    namespace: &str,
) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    let mut command = std::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env(RESTART_ENV, "1")
        .env(SESSION_ENV, session_id.simple().to_string())
        .env(NAMESPACE_ENV, namespace);
    command.exec()
}

#[cfg(not(unix))]
pub(crate) fn exec_in_place(
    _argv: &[String],
    _session_id: Uuid,
    _namespace: &str,
) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "in-place restart requires unix",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_argv_prefers_configured() {
        let configured = vec!["interp".to_string(), "--flag".to_string()];
        assert_eq!(restart_argv(Some(&configured)), configured);

        let fallback = restart_argv(None);
        assert!(!fallback.is_empty());
    }

    #[test]
    fn test_restart_pending_requires_env() {
        // Env not set in the test runner.
        assert!(restart_pending().is_none());
    }
}
