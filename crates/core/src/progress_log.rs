//! Best-effort debug log file appends.
//!
//! `vscodelm::serve_stdio` optionally traces every frame to a file when a
//! debug path is configured, swallowing write errors rather than letting
//! logging failures take down the bridge. Same idea here: callers may wire
//! a `DebugLog` into the session for frame-level tracing without it being
//! able to fail anything.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

pub struct DebugLog {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl DebugLog {
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn to_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            file: Mutex::new(None),
        }
    }

    /// Append a line. Interleaving across concurrent writers is acceptable;
    /// failures are logged once at `warn` and otherwise ignored.
    pub fn append(&self, line: &str) {
        let Some(path) = &self.path else { return };
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "failed to open debug log");
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = writeln!(f, "{line}") {
                warn!(error = %e, "failed to append to debug log");
            }
        }
    }
}
