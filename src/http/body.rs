//! Request Body Collection
//!
//! Bodies accumulate in memory up to `MAX_BODY_MEM`, spill to a temp file
//! (`xapiand_upload.XXXXXX` under the system temp dir) up to
//! `MAX_BODY_SIZE`, and are rejected beyond that. The spill path unlinks
//! itself when the collected body drops, so a connection never leaves an
//! upload behind.

use std::io::Write;

use tokio_stream::StreamExt;

use crate::error::{Error, Result};

pub const MAX_BODY_MEM: usize = 5 * 1024 * 1024;
pub const MAX_BODY_SIZE: usize = 250 * 1024 * 1024;

pub enum RequestBody {
    Memory(Vec<u8>),
    Spilled {
        file: std::fs::File,
        path: tempfile::TempPath,
        size: u64,
    },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Memory(bytes) => bytes.len() as u64,
            RequestBody::Spilled { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, RequestBody::Spilled { .. })
    }

    /// Materialise the full body, reading the spill file back if needed.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            RequestBody::Memory(bytes) => Ok(bytes),
            RequestBody::Spilled { path, .. } => std::fs::read(&path)
                .map_err(|e| Error::StorageError(format!("read spilled body: {}", e))),
        }
    }
}

/// Drain the request body with the memory/spill/reject discipline.
pub async fn collect_body(body: axum::body::Body) -> Result<RequestBody> {
    let mut stream = body.into_data_stream();
    let mut collected = RequestBody::Memory(Vec::new());

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::ClientDisconnect(format!("body read: {}", e)))?;
        if collected.len() + chunk.len() as u64 > MAX_BODY_SIZE as u64 {
            return Err(Error::PayloadTooLarge);
        }

        match &mut collected {
            RequestBody::Memory(bytes) => {
                if bytes.len() + chunk.len() > MAX_BODY_MEM {
                    collected = spill(std::mem::take(bytes), &chunk)?;
                } else {
                    bytes.extend_from_slice(&chunk);
                }
            }
            RequestBody::Spilled { file, size, .. } => {
                file.write_all(&chunk)
                    .map_err(|_| Error::PayloadTooLarge)?;
                *size += chunk.len() as u64;
            }
        }
    }

    if let RequestBody::Spilled { file, .. } = &mut collected {
        file.flush().map_err(|_| Error::PayloadTooLarge)?;
    }
    Ok(collected)
}

fn spill(buffered: Vec<u8>, chunk: &[u8]) -> Result<RequestBody> {
    let named = tempfile::Builder::new()
        .prefix("xapiand_upload.")
        .tempfile()
        .map_err(|_| Error::PayloadTooLarge)?;
    let (mut file, path) = named.into_parts();

    file.write_all(&buffered)
        .and_then(|_| file.write_all(chunk))
        .map_err(|_| Error::PayloadTooLarge)?;

    tracing::debug!(
        "Spilled request body to {} ({} bytes so far)",
        path.display(),
        buffered.len() + chunk.len()
    );

    Ok(RequestBody::Spilled {
        file,
        size: (buffered.len() + chunk.len()) as u64,
        path,
    })
}
