//! File-browser sessions: directory listing and chunked transfer.
//!
//! Filesystem calls run on the blocking pool; results come back as
//! `file_list` and `file_chunk` outputs on the session queue (Block
//! policy). Errors are reported in-band so a bad path never kills the
//! session.

use std::path::Path;

use base64::Engine;
use chrono::{DateTime, Utc};
use sentinel_core::frames::{kind, output, FileEntry, Frame};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::queue::FrameQueue;
use super::SessionInput;

/// Bytes of file content per `file_chunk` frame, before base64 expansion.
const CHUNK_SIZE: usize = 65_536;

/// Start a file-browser session worker.
pub fn spawn(session_id: &str, queue: FrameQueue) -> (mpsc::Sender<SessionInput>, JoinHandle<()>) {
    let (input_tx, input_rx) = mpsc::channel(16);
    let worker = tokio::spawn(run_worker(session_id.to_string(), input_rx, queue));
    (input_tx, worker)
}

async fn run_worker(
    session_id: String,
    mut input_rx: mpsc::Receiver<SessionInput>,
    queue: FrameQueue,
) {
    while let Some(input) = input_rx.recv().await {
        let done = match input {
            SessionInput::Close => true,
            SessionInput::ListFiles { path } => handle_list(&session_id, &path, &queue).await,
            SessionInput::Download { path } => handle_download(&session_id, &path, &queue).await,
            SessionInput::Upload { path, data } => {
                handle_upload(&session_id, &path, data, &queue).await
            }
            other => {
                warn!("File session {session_id}: unsupported input {other:?}");
                false
            }
        };
        if done {
            break;
        }
    }
    queue.close();
    debug!("File session {session_id} ended");
}

/// Returns `true` when the queue is gone and the worker should stop.
async fn handle_list(session_id: &str, path: &str, queue: &FrameQueue) -> bool {
    let path_owned = path.to_string();
    let listed = tokio::task::spawn_blocking(move || list_dir(&path_owned)).await;

    let payload = match listed {
        Ok(Ok(entries)) => json!({
            "session_id": session_id,
            "subtype": output::FILE_LIST,
            "path": path,
            "entries": entries,
        }),
        Ok(Err(e)) => json!({
            "session_id": session_id,
            "subtype": output::FILE_LIST,
            "path": path,
            "entries": [],
            "error": e,
        }),
        Err(e) => json!({
            "session_id": session_id,
            "subtype": output::FILE_LIST,
            "path": path,
            "entries": [],
            "error": e.to_string(),
        }),
    };
    queue
        .push(Frame::new(kind::SESSION_OUTPUT, payload))
        .await
        .is_err()
}

async fn handle_download(session_id: &str, path: &str, queue: &FrameQueue) -> bool {
    let path_owned = path.to_string();
    let read: Result<Vec<u8>, String> = match tokio::task::spawn_blocking(move || {
        std::fs::read(&path_owned).map_err(|e| e.to_string())
    })
    .await
    {
        Ok(result) => result,
        Err(e) => Err(e.to_string()),
    };

    let data = match read {
        Ok(data) => data,
        Err(message) => {
            let payload = json!({
                "session_id": session_id,
                "subtype": output::FILE_CHUNK,
                "path": path,
                "offset": 0,
                "data": "",
                "eof": true,
                "error": message,
            });
            return queue
                .push(Frame::new(kind::SESSION_OUTPUT, payload))
                .await
                .is_err();
        }
    };

    let b64 = base64::engine::general_purpose::STANDARD;
    let total = data.len();
    let mut offset = 0usize;
    loop {
        let end = (offset + CHUNK_SIZE).min(total);
        let eof = end == total;
        let payload = json!({
            "session_id": session_id,
            "subtype": output::FILE_CHUNK,
            "path": path,
            "offset": offset,
            "data": b64.encode(&data[offset..end]),
            "eof": eof,
        });
        if queue
            .push(Frame::new(kind::SESSION_OUTPUT, payload))
            .await
            .is_err()
        {
            return true;
        }
        if eof {
            return false;
        }
        offset = end;
    }
}

async fn handle_upload(session_id: &str, path: &str, data: Vec<u8>, queue: &FrameQueue) -> bool {
    let size = data.len();
    let path_owned = path.to_string();
    let written = tokio::task::spawn_blocking(move || {
        if let Some(parent) = Path::new(&path_owned).parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&path_owned, &data).map_err(|e| e.to_string())
    })
    .await;

    let mut payload = json!({
        "session_id": session_id,
        "subtype": output::FILE_CHUNK,
        "path": path,
        "offset": size,
        "data": "",
        "eof": true,
    });
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => payload["error"] = json!(e),
        Err(e) => payload["error"] = json!(e.to_string()),
    }
    queue
        .push(Frame::new(kind::SESSION_OUTPUT, payload))
        .await
        .is_err()
}

fn list_dir(path: &str) -> Result<Vec<FileEntry>, String> {
    let entries = std::fs::read_dir(path).map_err(|e| e.to_string())?;
    let mut result = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue, // raced with deletion
        };
        let modified = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        result.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            is_directory: meta.is_dir(),
            size: meta.len(),
            modified,
        });
    }
    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}
