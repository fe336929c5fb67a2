//! Remote Search Protocol (server side)
//!
//! Peers dispatch queries against shards this node holds. Storage failures
//! are reflected back as an exception frame and the connection stays open;
//! framing violations close it.

use std::sync::Arc;

use super::codec::{
    self, DatabaseInfoReply, DatabaseInfoRequest, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
    RemoteDocument, RemoteException, RemoteFetch, RemoteMessageType, RemoteQuery, RemoteReplyType,
    RemoteResults, RemoteUpdate,
};
use super::connection::BinaryConnection;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{Error, Result};
use crate::search::engine;
use crate::storage::pool::DatabaseHandle;

/// First frame of every serving connection, acknowledging remote readiness.
pub fn send_update(conn: &Arc<BinaryConnection>) -> Result<()> {
    let update = RemoteUpdate {
        node_name: conn.ctx.resolver.local_node_name(),
        version_major: PROTOCOL_VERSION_MAJOR,
        version_minor: PROTOCOL_VERSION_MINOR,
    };
    conn.send_message(RemoteReplyType::Update as u8, &codec::to_payload(&update)?)
}

pub async fn dispatch(conn: &Arc<BinaryConnection>, type_byte: u8, payload: &[u8]) -> Result<()> {
    let msg = RemoteMessageType::try_from(type_byte)?;

    let outcome = match msg {
        RemoteMessageType::Query => handle_query(conn, payload).await,
        RemoteMessageType::FetchDocument => handle_fetch(conn, payload).await,
        RemoteMessageType::DatabaseInfo => handle_database_info(conn, payload).await,
    };

    match outcome {
        Ok(()) => Ok(()),
        // Storage trouble goes back as an error frame; the connection stays open.
        Err(e @ (Error::StorageError(_) | Error::DatabaseCheckout(_) | Error::EndpointResolution(_))) => {
            let exception = RemoteException {
                message: e.to_string(),
            };
            conn.send_message(
                RemoteReplyType::Exception as u8,
                &codec::to_payload(&exception)?,
            )
        }
        Err(e) => Err(e),
    }
}

async fn checkout(conn: &Arc<BinaryConnection>, index_path: &str) -> Result<DatabaseHandle> {
    let endpoints = EndpointSet::single(Endpoint::local(
        &conn.ctx.resolver.local_node_name(),
        index_path,
    ));
    conn.ctx.pool.checkout(&endpoints, 0).await
}

async fn handle_query(conn: &Arc<BinaryConnection>, payload: &[u8]) -> Result<()> {
    let query: RemoteQuery = codec::from_payload(payload)?;
    let handle = checkout(conn, &query.index_path).await?;

    let result = {
        let shard = handle.read().await;
        engine::execute(&shard, &query.descriptor)?
    };
    let documents = handle
        .fetch_documents(result.hits.iter().map(|h| h.id.as_str()))
        .await?;

    let reply = RemoteResults { result, documents };
    conn.send_message(RemoteReplyType::Results as u8, &codec::to_payload(&reply)?)
}

async fn handle_fetch(conn: &Arc<BinaryConnection>, payload: &[u8]) -> Result<()> {
    let fetch: RemoteFetch = codec::from_payload(payload)?;
    let handle = checkout(conn, &fetch.index_path).await?;
    let documents = handle
        .fetch_documents(std::iter::once(fetch.doc_id.as_str()))
        .await?;

    let reply = RemoteDocument {
        document: documents.into_iter().next(),
    };
    conn.send_message(
        RemoteReplyType::Document as u8,
        &codec::to_payload(&reply)?,
    )
}

async fn handle_database_info(conn: &Arc<BinaryConnection>, payload: &[u8]) -> Result<()> {
    let request: DatabaseInfoRequest = codec::from_payload(payload)?;
    let handle = checkout(conn, &request.index_path).await?;
    let (revision, doc_count) = {
        let shard = handle.read().await;
        (shard.revision(), shard.doc_count())
    };

    let reply = DatabaseInfoReply {
        index_path: request.index_path,
        revision,
        doc_count,
    };
    conn.send_message(
        RemoteReplyType::DatabaseInfo as u8,
        &codec::to_payload(&reply)?,
    )
}
