//! Replication Protocol
//!
//! Server side: answers `MSG_GET_CHANGESETS` with either the changesets
//! the peer is missing, or a whole-database copy (filenames + file
//! streams + footer) when the changeset window no longer reaches back far
//! enough. Always ends with `REPLY_END_OF_CHANGES`.
//!
//! Client side: pulls an index from a peer. Changesets apply atomically in
//! arrival order; a full copy installs the received files and reopens.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use super::codec::{
    self, ChangesetFrame, DbFooter, GetChangesets, RemoteReplyType, ReplicationMessageType,
    ReplicationReplyType, SWITCH_TO_REPL,
};
use super::connection::{BinaryConnection, ReplClient};
use crate::context::NodeContext;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{Error, Result};
use crate::storage::pool::{DB_SPAWN, DB_WRITABLE, DatabaseHandle};

// ── Server ───────────────────────────────────────────────────────────────

pub async fn server_dispatch(
    conn: &Arc<BinaryConnection>,
    type_byte: u8,
    payload: &[u8],
) -> Result<()> {
    let msg = ReplicationMessageType::try_from(type_byte)?;
    match msg {
        ReplicationMessageType::GetChangesets => handle_get_changesets(conn, payload).await,
    }
}

async fn handle_get_changesets(conn: &Arc<BinaryConnection>, payload: &[u8]) -> Result<()> {
    let request: GetChangesets = codec::from_payload(payload)?;
    tracing::debug!(
        "Changesets requested for {} from revision {}",
        request.index_path,
        request.from_revision
    );

    let endpoints = EndpointSet::single(Endpoint::local(
        &conn.ctx.resolver.local_node_name(),
        &request.index_path,
    ));
    let handle = match conn.ctx.pool.checkout(&endpoints, 0).await {
        Ok(handle) => handle,
        Err(e) => {
            conn.send_message(
                ReplicationReplyType::Fail as u8,
                e.to_string().as_bytes(),
            )?;
            return Ok(());
        }
    };

    let shard = handle.read().await;
    match shard.changesets_since(request.from_revision) {
        Some(changesets) => {
            for changeset in changesets {
                let frame = ChangesetFrame { changeset };
                conn.send_message(
                    ReplicationReplyType::Changeset as u8,
                    &codec::to_payload(&frame)?,
                )?;
            }
        }
        None => {
            // The peer is too far behind; ship the whole database.
            for (name, path) in shard.storage_files() {
                conn.send_message(ReplicationReplyType::DbFilename as u8, name.as_bytes())?;
                conn.send_file(ReplicationReplyType::DbFiledata as u8, &path)
                    .await?;
            }
            let footer = DbFooter {
                revision: shard.revision(),
            };
            conn.send_message(
                ReplicationReplyType::DbFooter as u8,
                &codec::to_payload(&footer)?,
            )?;
        }
    }

    conn.send_message(ReplicationReplyType::EndOfChanges as u8, &[])
}

// ── Client ───────────────────────────────────────────────────────────────

/// Pull `index_path` from `peer` until in sync. Retries once on transient
/// network failure.
pub async fn replicate_from(
    ctx: NodeContext,
    peer: SocketAddr,
    index_path: String,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pull(ctx.clone(), peer, index_path.clone()).await {
            Ok(()) => return Ok(()),
            Err(e @ Error::ClientDisconnect(_)) if attempt == 1 => {
                tracing::warn!("Replication from {} failed, retrying once: {}", peer, e);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn pull(ctx: NodeContext, peer: SocketAddr, index_path: String) -> Result<()> {
    let from_revision = {
        let endpoints = local_endpoints(&ctx, &index_path);
        let handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
        let shard = handle.read().await;
        shard.revision()
    };

    let stream = TcpStream::connect(peer)
        .await
        .map_err(|e| Error::ClientDisconnect(format!("connect {}: {}", peer, e)))?;

    let (done_tx, done_rx) = oneshot::channel();
    let conn = BinaryConnection::spawn_replication(
        stream,
        ctx,
        ReplClient {
            index_path: index_path.clone(),
            pending_filename: None,
            done: Some(done_tx),
        },
    );

    // The switch frame carries the first replication request.
    let request = GetChangesets {
        index_path,
        from_revision,
    };
    let payload = codec::to_payload(&request)?;
    let mut frame = BytesMut::with_capacity(payload.len() + 11);
    frame.put_u8(SWITCH_TO_REPL);
    send_raw(&conn, frame, &payload)?;

    let result = done_rx
        .await
        .map_err(|_| Error::ClientDisconnect("replication aborted".to_string()))?;
    conn.destroy();
    result
}

fn send_raw(conn: &Arc<BinaryConnection>, mut frame: BytesMut, payload: &[u8]) -> Result<()> {
    codec::encode_length(&mut frame, payload.len() as u64);
    frame.put_slice(payload);
    conn.send_frame_bytes(frame.freeze())
}

fn local_endpoints(ctx: &NodeContext, index_path: &str) -> EndpointSet {
    EndpointSet::single(Endpoint::local(
        &ctx.resolver.local_node_name(),
        index_path,
    ))
}

pub async fn client_dispatch(
    conn: &Arc<BinaryConnection>,
    type_byte: u8,
    payload: &[u8],
) -> Result<()> {
    // The serving side greets every connection with a remote update frame.
    if type_byte == RemoteReplyType::Update as u8 {
        return Ok(());
    }

    let reply = ReplicationReplyType::try_from(type_byte)?;
    match reply {
        ReplicationReplyType::Changeset => {
            let frame: ChangesetFrame = codec::from_payload(payload)?;
            let handle = client_writable_handle(conn).await?;
            handle.write().await?.apply_changeset(frame.changeset)?;
            Ok(())
        }
        ReplicationReplyType::DbFilename => {
            let name = String::from_utf8(payload.to_vec())
                .map_err(|_| Error::ProtocolViolation("filename not UTF-8".to_string()))?;
            let mut repl = conn.repl.lock().unwrap_or_else(|e| e.into_inner());
            match repl.as_mut() {
                Some(repl) => {
                    repl.pending_filename = Some(name);
                    Ok(())
                }
                None => Err(Error::ProtocolViolation(
                    "filename on a non-client connection".to_string(),
                )),
            }
        }
        ReplicationReplyType::DbFiledata => {
            let temp_path = String::from_utf8(payload.to_vec())
                .map_err(|_| Error::ProtocolViolation("file path not UTF-8".to_string()))?;
            let name = {
                let mut repl = conn.repl.lock().unwrap_or_else(|e| e.into_inner());
                repl.as_mut().and_then(|r| r.pending_filename.take())
            }
            .ok_or_else(|| {
                Error::ProtocolViolation("file data without a preceding filename".to_string())
            })?;

            let handle = client_writable_handle(conn).await?;
            let shard = handle.read().await;
            shard.install_file(&name, Path::new(&temp_path))?;
            Ok(())
        }
        ReplicationReplyType::DbFooter => {
            let footer: DbFooter = codec::from_payload(payload)?;
            let handle = client_writable_handle(conn).await?;
            handle.write().await?.reset_changeset_log()?;
            handle.reopen().await?;
            let revision = handle.read().await.revision();
            if revision != footer.revision {
                return Err(Error::StorageError(format!(
                    "installed revision {} does not match footer {}",
                    revision, footer.revision
                )));
            }
            Ok(())
        }
        ReplicationReplyType::EndOfChanges => {
            finish_client(conn, Ok(()));
            Ok(())
        }
        ReplicationReplyType::Fail => {
            let message = String::from_utf8_lossy(payload).into_owned();
            finish_client(conn, Err(Error::StorageError(message)));
            Ok(())
        }
    }
}

async fn client_writable_handle(conn: &Arc<BinaryConnection>) -> Result<DatabaseHandle> {
    let index_path = {
        let repl = conn.repl.lock().unwrap_or_else(|e| e.into_inner());
        repl.as_ref()
            .map(|r| r.index_path.clone())
            .ok_or_else(|| {
                Error::ProtocolViolation("replication reply on a non-client connection".to_string())
            })?
    };
    let endpoints = local_endpoints(&conn.ctx, &index_path);
    conn.ctx.pool.checkout(&endpoints, DB_WRITABLE | DB_SPAWN).await
}

fn finish_client(conn: &Arc<BinaryConnection>, result: Result<()>) {
    conn.set_waiting(false);
    let done = {
        let mut repl = conn.repl.lock().unwrap_or_else(|e| e.into_inner());
        repl.as_mut().and_then(|r| r.done.take())
    };
    if let Some(done) = done {
        let _ = done.send(result);
    }
}
