//! Gate discovery over the well-known descriptor directory.

use std::path::Path;

use tracing::{debug, info, warn};

use gate_protocol::descriptor::{self, GateDescriptor};

/// Scan the gate directory and return descriptors of live gates.
///
/// Descriptors whose process is gone are stale: the descriptor and both
/// socket files are removed on the spot. Unparseable descriptor files are
/// treated the same way; a healthy gate rewrites its descriptor on restart.
pub fn scan(dir: &Path) -> Vec<GateDescriptor> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "could not read gate directory");
            return Vec::new();
        }
    };

    let mut live = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match GateDescriptor::load(&path) {
            Ok(descriptor) if descriptor.process_alive() => live.push(descriptor),
            Ok(descriptor) => {
                info!(
                    session = %descriptor.short_key(),
                    pid = descriptor.pid,
                    "reaping stale gate descriptor"
                );
                descriptor::remove_session_files(dir, &descriptor.session_id);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "removing unreadable gate descriptor");
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    descriptor::remove_session_files(dir, stem);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }
    live
}

/// One-time startup sweep: remove socket files whose descriptor is absent.
pub fn sweep_orphan_sockets(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sock") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let sid = stem.strip_suffix("-stream").unwrap_or(stem);
        if !descriptor::descriptor_path(dir, sid).exists() {
            debug!(path = %path.display(), "removing orphan socket file");
            let _ = std::fs::remove_file(&path);
        }
    }
}
