//! Transition audit log.
//!
//! With `[audit] path` set, every call state transition is appended to
//! that file as one JSON object per line. Otherwise transitions go to the
//! tracing log.

use crate::config::AuditConfig;
use anyhow::{Context, Result};
use ringline_core::{AuditSink, ChannelAuditSink, TracingAuditSink, TransitionRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Build the sink the call store reports to.
///
/// The writer task, if any, ends once the sink and every clone of it are
/// dropped and the queued records are flushed.
///
/// # Errors
///
/// Returns an error if the audit file cannot be opened.
pub async fn open_sink(config: &AuditConfig) -> Result<(Arc<dyn AuditSink>, Option<JoinHandle<()>>)> {
    match &config.path {
        Some(path) => {
            let file = open_log(path).await?;
            let (sink, rx) = ChannelAuditSink::new();
            info!("Writing call audit log to {}", path.display());
            let writer = tokio::spawn(write_records(file, path.clone(), rx));
            Ok((Arc::new(sink), Some(writer)))
        }
        None => Ok((Arc::new(TracingAuditSink), None)),
    }
}

async fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open audit log: {}", path.display()))
}

async fn write_records(
    mut file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<TransitionRecord>,
) {
    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(call_id = %record.call_id, error = %e, "Failed to encode audit record");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = file.write_all(&line).await {
            warn!(path = %path.display(), error = %e, "Failed to write audit record");
        }
    }

    if let Err(e) = file.flush().await {
        warn!(path = %path.display(), error = %e, "Failed to flush audit log");
    }
}
