//! HTTP Module
//!
//! The RESTful surface. URLs are fully dynamic
//! (`/{ns}/{index-path}/{command_or_id}?query`, optionally `@host`
//! qualified), so the router is a single fallback handler that tokenises
//! the path itself and dispatches on `(method, command)`:
//!
//! | Method    | `_search/_facets/_schema/_stats` | `_upload`  | document id |
//! |-----------|----------------------------------|------------|-------------|
//! | GET/POST  | search/facets/schema/stats       | upload (POST) | search by id |
//! | HEAD      |                                  |            | document info |
//! | PUT       |                                  |            | index       |
//! | PATCH     |                                  |            | update      |
//! | DELETE    |                                  |            | delete      |
//! | OPTIONS   | `Allow` echo                     |            |             |
//!
//! ## Submodules
//! - **`accept`**: media-range grammar with q-values.
//! - **`query`**: path tokenisation and the query-string descriptor.
//! - **`body`**: spillable request body collection.
//! - **`views`**: the operations behind the routing table.
//! - **`response`**: content negotiation, chunked emission, error mapping.

pub mod accept;
pub mod body;
pub mod query;
pub mod response;
pub mod views;


use axum::Router;
use axum::extract::Extension;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::context::NodeContext;
use crate::error::Error;
use crate::search::types::CommandKind;

pub fn router(ctx: NodeContext) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(Extension(ctx))
}

async fn handle_request(
    Extension(ctx): Extension<NodeContext>,
    request: axum::extract::Request,
) -> Response {
    let pretty_probe = request.uri().query().unwrap_or("").contains("pretty");

    ctx.stats
        .http_clients
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    ctx.stats
        .total_clients_served
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    let stats = ctx.stats.clone();

    let response = match dispatch(ctx, request).await {
        Ok(response) => response,
        Err(e) => response::error_response(&e, pretty_probe),
    };

    stats
        .http_clients
        .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    response
}

async fn dispatch(
    ctx: NodeContext,
    request: axum::extract::Request,
) -> crate::error::Result<Response> {
    if ctx.is_shutting_down() {
        return Err(Error::ShutdownInProgress);
    }

    let method = request.method().clone();
    if method == Method::OPTIONS {
        return Ok((
            StatusCode::OK,
            [("Allow", "GET,HEAD,POST,PUT,PATCH,OPTIONS")],
        )
            .into_response());
    }

    let accept = accept::parse_accept_header(request.headers())?;
    let parsed = query::parse_request(request.uri())?;

    if parsed.kind == CommandKind::Bad {
        return Err(Error::ParseError("BAD QUERY".to_string()));
    }

    // Reject oversized declarations before the body is ever polled, so a
    // pending 100-continue never goes out.
    let declared_length = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared_length.unwrap_or(0) > body::MAX_BODY_SIZE as u64 {
        return Err(Error::PayloadTooLarge);
    }

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase())
        .unwrap_or_default();

    views::route(ctx, method, parsed, accept, content_type, request.into_body()).await
}
