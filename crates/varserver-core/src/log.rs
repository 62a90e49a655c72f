//! `varserver_log` persistence (spec §6 "Persisted state"): one line per
//! processed command when session logging is enabled.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
};

use chrono::Utc;

/// Append-only sink for one session's command log. Each `VariableServer`
/// instance's sessions own their own handle, so there is no cross-session
/// interleaving hazard: the session that logs a line is the only writer of
/// that line.
pub struct SessionLog {
    file: File,
}

impl SessionLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// `{timestamp_rfc3339}\t{client_tag}\t{command_text}\t{outcome}`
    pub fn record(&mut self, client_tag: &str, command_text: &str, outcome: &str) {
        let timestamp = Utc::now().to_rfc3339();
        if let Err(err) =
            writeln!(self.file, "{timestamp}\t{client_tag}\t{command_text}\t{outcome}")
        {
            tracing::warn!(?err, "varserver-core: failed to append to session log");
        }
    }
}
