//! Request Views
//!
//! One function per routed operation. Every view returns
//! `Result<Response, Error>`; the emitter renders failures, so no status
//! is ever written twice. Database work runs on the executor pool, which
//! turns overflow into 503 before any of this code runs.

use std::time::Instant;

use axum::http::{Method, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use sysinfo::System;

use super::accept::AcceptSet;
use super::body::{self, RequestBody};
use super::query::ParsedRequest;
use super::response::{self, MATCHED_COUNT_HEADER, Negotiated};
use crate::context::NodeContext;
use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::search::engine;
use crate::search::types::CommandKind;
use crate::stats::OpKind;
use crate::storage::index::{Document, JSON_TYPE, MSGPACK_TYPE};
use crate::storage::pool::{DB_INIT_REF, DB_SPAWN, DB_WRITABLE};

pub async fn route(
    ctx: NodeContext,
    method: Method,
    parsed: ParsedRequest,
    accept: AcceptSet,
    content_type: String,
    raw_body: axum::body::Body,
) -> Result<Response> {
    let writable = method == Method::PUT || method == Method::PATCH;

    let endpoints = match &parsed.host {
        Some(host) => EndpointSet::single(ctx.resolver.resolve_host(host, &parsed.index_path)?),
        None => {
            ctx.resolver
                .resolve_index(&parsed.index_path, writable)
                .await?
        }
    };

    if writable && endpoints.len() > 1 {
        return Err(Error::ParseError(
            "write operations accept exactly one endpoint".to_string(),
        ));
    }

    let request_body = if matches!(method.as_str(), "PUT" | "PATCH" | "POST") {
        body::collect_body(raw_body).await?
    } else {
        RequestBody::Memory(Vec::new())
    };

    let executor = ctx.executor.clone();
    executor
        .run(async move {
            dispatch_view(ctx, method, parsed, accept, content_type, endpoints, request_body)
                .await
        })
        .await?
}

async fn dispatch_view(
    ctx: NodeContext,
    method: Method,
    parsed: ParsedRequest,
    accept: AcceptSet,
    content_type: String,
    endpoints: EndpointSet,
    request_body: RequestBody,
) -> Result<Response> {
    match (method.as_str(), parsed.kind) {
        ("GET" | "POST", CommandKind::Search | CommandKind::Id) => {
            search_view(ctx, parsed, accept, endpoints, request_body, false, false).await
        }
        ("GET" | "POST", CommandKind::Facets) => {
            search_view(ctx, parsed, accept, endpoints, request_body, true, false).await
        }
        ("GET" | "POST", CommandKind::Schema) => {
            search_view(ctx, parsed, accept, endpoints, request_body, false, true).await
        }
        ("GET" | "POST", CommandKind::Stats) => stats_view(ctx, parsed, endpoints).await,
        ("POST", CommandKind::Upload) => upload_view(ctx, parsed, endpoints, request_body).await,
        ("HEAD", CommandKind::Id) => document_info_view(ctx, parsed, endpoints).await,
        ("PUT", CommandKind::Id) => {
            index_document_view(ctx, parsed, endpoints, content_type, request_body).await
        }
        ("PATCH", CommandKind::Id) => {
            update_document_view(ctx, parsed, endpoints, request_body).await
        }
        ("DELETE", CommandKind::Id) => delete_document_view(ctx, parsed, endpoints).await,
        _ => Ok(response::json_response(
            StatusCode::NOT_IMPLEMENTED,
            &json!({"Error message": "Not Implemented"}),
            parsed.descriptor.pretty,
        )),
    }
}

/// Fold a structured request body into the descriptor: `query`, `partial`,
/// `terms`, `sort` and `facets` accept a string or an array of strings.
fn merge_body_query(parsed: &mut ParsedRequest, body: &[u8]) -> Result<()> {
    if body.is_empty() {
        return Ok(());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::ParseError(format!("bad search body: {}", e)))?;
    let Some(map) = value.as_object() else {
        return Err(Error::ParseError("search body must be an object".to_string()));
    };

    let mut take = |key: &str, out: &mut Vec<String>| {
        match map.get(key) {
            Some(Value::String(s)) => out.push(s.clone()),
            Some(Value::Array(items)) => {
                out.extend(items.iter().filter_map(|v| v.as_str().map(String::from)));
            }
            _ => {}
        }
    };

    take("query", &mut parsed.descriptor.query);
    take("partial", &mut parsed.descriptor.partial);
    take("terms", &mut parsed.descriptor.terms);
    take("sort", &mut parsed.descriptor.sort);
    take("facets", &mut parsed.descriptor.facets);
    Ok(())
}

async fn search_view(
    ctx: NodeContext,
    mut parsed: ParsedRequest,
    accept: AcceptSet,
    endpoints: EndpointSet,
    request_body: RequestBody,
    facets: bool,
    schema: bool,
) -> Result<Response> {
    let handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
    let pretty = parsed.descriptor.pretty;

    if schema {
        let schema_value = {
            let shard = handle.read().await;
            serde_json::to_value(shard.schema())?
        };
        return Ok(response::json_response(StatusCode::OK, &schema_value, pretty));
    }

    if parsed.kind != CommandKind::Id {
        let body_bytes = request_body.into_bytes()?;
        merge_body_query(&mut parsed, &body_bytes)?;
    }

    let started = Instant::now();

    if facets {
        let facet_map = {
            let shard = handle.read().await;
            engine::facets(&shard, &parsed.descriptor)?
        };
        ctx.stats.record(OpKind::Search, started.elapsed());
        return Ok(response::json_response(
            StatusCode::OK,
            &serde_json::to_value(&facet_map)?,
            pretty,
        ));
    }

    let result = {
        let shard = handle.read().await;
        engine::execute(&shard, &parsed.descriptor)?
    };
    let documents = handle
        .fetch_documents(result.hits.iter().map(|h| h.id.as_str()))
        .await?;
    drop(handle);
    ctx.stats.record(OpKind::Search, started.elapsed());

    if documents.is_empty() {
        let (status, body) = if parsed.descriptor.unique_doc {
            (
                StatusCode::NOT_FOUND,
                json!({"Response empty": "No document found"}),
            )
        } else {
            (StatusCode::OK, json!({"Response empty": "No match found"}))
        };
        let mut resp = response::json_response(status, &body, pretty);
        resp.headers_mut().insert(
            MATCHED_COUNT_HEADER,
            axum::http::HeaderValue::from_static("0"),
        );
        return Ok(resp);
    }

    let negotiated = response::negotiate(&accept, &documents[0])?;
    let chunked = !(parsed.descriptor.unique_doc && documents.len() == 1);

    match negotiated {
        Negotiated::Blob(content_type) => {
            let doc = &documents[0];
            let blob = doc.blob.clone().unwrap_or_default();
            Ok(response::blob_response(&content_type, blob))
        }
        Negotiated::Json if !chunked => Ok(response::json_response(
            StatusCode::OK,
            &response::document_value(&documents[0]),
            pretty,
        )),
        Negotiated::Msgpack if !chunked => {
            response::msgpack_response(StatusCode::OK, &response::document_value(&documents[0]))
        }
        negotiated => {
            let content_type = match negotiated {
                Negotiated::Msgpack => MSGPACK_TYPE,
                _ => JSON_TYPE,
            };
            let (tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
            let matched_count = result.matched_count;
            tokio::spawn(async move {
                for doc in &documents {
                    let value = response::document_value(doc);
                    let rendered = match negotiated {
                        Negotiated::Msgpack => match response::render_msgpack(&value) {
                            Ok(bytes) => bytes,
                            Err(_) => break,
                        },
                        _ => response::render_json(&value, pretty),
                    };
                    // A refused send means the peer is gone; ending the
                    // stream emits the terminating chunk.
                    if tx.send(rendered).await.is_err() {
                        break;
                    }
                }
            });
            Ok(response::chunked_response(matched_count, content_type, rx))
        }
    }
}

async fn document_info_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
) -> Result<Response> {
    let handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
    let found = {
        let shard = handle.read().await;
        shard.get_document(&parsed.command).is_some()
    };

    if found {
        Ok(response::json_response(
            StatusCode::OK,
            &json!({"_id": parsed.command}),
            parsed.descriptor.pretty,
        ))
    } else {
        Ok(response::json_response(
            StatusCode::NOT_FOUND,
            &json!({"Response empty": "Document not found"}),
            parsed.descriptor.pretty,
        ))
    }
}

fn document_from_body(
    id: &str,
    content_type: &str,
    body: Vec<u8>,
) -> Result<Document> {
    let content_type = if content_type.is_empty() {
        JSON_TYPE
    } else {
        content_type
    };
    match content_type {
        JSON_TYPE => {
            let content: Value = serde_json::from_slice(&body)
                .map_err(|e| Error::ParseError(format!("bad document body: {}", e)))?;
            Ok(Document::structured(id, content))
        }
        MSGPACK_TYPE => {
            let content: Value = rmp_serde::from_slice(&body)
                .map_err(|e| Error::ParseError(format!("bad msgpack body: {}", e)))?;
            let mut doc = Document::structured(id, content);
            doc.content_type = MSGPACK_TYPE.to_string();
            Ok(doc)
        }
        other => Ok(Document::blob(id, body, other)),
    }
}

async fn index_document_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
    content_type: String,
    request_body: RequestBody,
) -> Result<Response> {
    let handle = ctx
        .pool
        .checkout(&endpoints, DB_WRITABLE | DB_SPAWN | DB_INIT_REF)
        .await?;

    let doc = document_from_body(&parsed.command, &content_type, request_body.into_bytes()?)?;
    let commit = parsed.descriptor.commit;

    let started = Instant::now();
    handle.write().await?.index_document(doc, commit)?;
    ctx.stats.record(OpKind::Index, started.elapsed());
    tracing::debug!("Indexed {} into {}", parsed.command, parsed.index_path);

    Ok(response::json_response(
        StatusCode::OK,
        &json!({"index": {"_id": parsed.command, "commit": commit}}),
        parsed.descriptor.pretty,
    ))
}

async fn update_document_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
    request_body: RequestBody,
) -> Result<Response> {
    let handle = ctx
        .pool
        .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
        .await?;

    let patch: Value = serde_json::from_slice(&request_body.into_bytes()?)
        .map_err(|e| Error::ParseError(format!("bad patch body: {}", e)))?;
    let commit = parsed.descriptor.commit;

    let started = Instant::now();
    handle
        .write()
        .await?
        .patch_document(&parsed.command, &patch, commit)?;
    ctx.stats.record(OpKind::Patch, started.elapsed());

    Ok(response::json_response(
        StatusCode::OK,
        &json!({"update": {"_id": parsed.command, "commit": commit}}),
        parsed.descriptor.pretty,
    ))
}

async fn delete_document_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
) -> Result<Response> {
    let handle = ctx
        .pool
        .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
        .await?;
    let commit = parsed.descriptor.commit;

    let started = Instant::now();
    let existed = handle.write().await?.delete_document(&parsed.command, commit)?;
    ctx.stats.record(OpKind::Delete, started.elapsed());
    if !existed {
        tracing::debug!("Delete of absent document {}", parsed.command);
    }

    Ok(response::json_response(
        StatusCode::OK,
        &json!({"delete": {"_id": parsed.command, "commit": commit}}),
        parsed.descriptor.pretty,
    ))
}

async fn upload_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
    request_body: RequestBody,
) -> Result<Response> {
    let _handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
    tracing::debug!(
        "Uploaded {} bytes for {} (spilled: {})",
        request_body.len(),
        parsed.index_path,
        request_body.is_spilled()
    );

    Ok(response::json_response(
        StatusCode::OK,
        &json!({"upload": {"size": request_body.len()}}),
        parsed.descriptor.pretty,
    ))
}

async fn stats_view(
    ctx: NodeContext,
    parsed: ParsedRequest,
    endpoints: EndpointSet,
) -> Result<Response> {
    let mut out = serde_json::Map::new();

    if parsed.descriptor.server {
        let alive = ctx.discovery.get_alive_members();
        let nodes: Vec<Value> = alive
            .iter()
            .map(|n| {
                json!({
                    "name": n.name.0,
                    "addr": n.addr.to_string(),
                    "http_port": n.http_port,
                    "binary_port": n.binary_port,
                    "region": n.region,
                })
            })
            .collect();

        let mut sys = System::new_all();
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_usage = sys.global_cpu_info().cpu_usage();
        // sysinfo reports memory in bytes.
        let mem_total_mb = sys.total_memory() / (1024 * 1024);
        let mem_used_mb = sys.used_memory() / (1024 * 1024);

        out.insert(
            "Server status".to_string(),
            json!({
                "node": ctx.discovery.local_node.name.0,
                "alive_nodes": alive.len(),
                "nodes": nodes,
                "http_clients": ctx.stats.http_clients.load(std::sync::atomic::Ordering::SeqCst),
                "binary_clients": ctx.stats.binary_clients.load(std::sync::atomic::Ordering::SeqCst),
                "databases_cached": ctx.pool.cached_count(),
                "databases_checked_out": ctx.pool.checked_out_count(),
                "cpu_usage": cpu_usage,
                "mem_used_mb": mem_used_mb,
                "mem_total_mb": mem_total_mb,
                "operations": ctx.stats.totals_json(),
            }),
        );
    }

    if parsed.descriptor.database {
        let handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
        let shard = handle.read().await;
        out.insert(
            "Database status".to_string(),
            json!({
                "path": shard.index_path(),
                "doc_count": shard.doc_count(),
                "term_count": shard.term_count(),
                "revision": shard.revision(),
                "disk_size": shard.disk_size(),
            }),
        );
    }

    if !parsed.descriptor.document.is_empty() {
        let handle = ctx.pool.checkout(&endpoints, DB_SPAWN).await?;
        let shard = handle.read().await;
        let terms = shard.document_terms(&parsed.descriptor.document);
        out.insert(
            "Document status".to_string(),
            json!({
                "_id": parsed.descriptor.document,
                "exists": shard.get_document(&parsed.descriptor.document).is_some(),
                "terms": terms.len(),
            }),
        );
    }

    if !parsed.descriptor.stats.is_empty() {
        let window: u64 = parsed
            .descriptor
            .stats
            .parse()
            .map_err(|_| Error::ParseError(format!("bad stats window {:?}", parsed.descriptor.stats)))?;
        out.insert("Stats time".to_string(), ctx.stats.window_json(window));
    }

    Ok(response::json_response(
        StatusCode::OK,
        &Value::Object(out),
        parsed.descriptor.pretty,
    ))
}
