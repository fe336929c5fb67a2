//! Response Emission
//!
//! Content negotiation against the accept-set, plus the two body shapes:
//! single rendered values with `Content-Length`, and chunked document
//! streams with `X-Matched-count`. Errors render through one mapping so a
//! status is written exactly once per request.

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::accept::AcceptSet;
use crate::error::{Error, Result};
use crate::storage::index::{Document, JSON_TYPE, MSGPACK_TYPE};

pub const MATCHED_COUNT_HEADER: &str = "X-Matched-count";

/// What negotiation picked for a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiated {
    Json,
    Msgpack,
    /// Serve the document's raw blob slot with this content type.
    Blob(String),
}

/// Walk the accept-set in order and pick the first workable rendering.
/// Structural types (json, msgpack) can always be produced; anything else
/// must match the document's own content type and blob slot.
pub fn negotiate(accept: &AcceptSet, doc: &Document) -> Result<Negotiated> {
    for entry in accept.iter() {
        if entry.range == JSON_TYPE {
            return Ok(Negotiated::Json);
        }
        if entry.range == MSGPACK_TYPE {
            return Ok(Negotiated::Msgpack);
        }
        if entry.matches(&doc.content_type) {
            if doc.content_type == JSON_TYPE {
                return Ok(Negotiated::Json);
            }
            if doc.content_type == MSGPACK_TYPE {
                return Ok(Negotiated::Msgpack);
            }
            if doc.blob.is_some() {
                return Ok(Negotiated::Blob(doc.content_type.clone()));
            }
            // A wildcard against a structured document renders as json.
            if doc.content.is_object() {
                return Ok(Negotiated::Json);
            }
        }
    }
    // Report the type the client asked for, highest preference first.
    let requested = accept
        .iter()
        .next()
        .map(|entry| entry.range.clone())
        .unwrap_or_else(|| "*/*".to_string());
    Err(Error::UnsupportedMediaType(format!(
        "Response type {} not provided in the accept header",
        requested
    )))
}

/// The `_id`-bearing object a structured document renders as.
pub fn document_value(doc: &Document) -> Value {
    let mut value = if doc.content.is_object() {
        doc.content.clone()
    } else {
        json!({})
    };
    if let Some(map) = value.as_object_mut() {
        map.insert("_id".to_string(), Value::String(doc.id.clone()));
    }
    value
}

pub fn render_json(value: &Value, pretty: bool) -> Vec<u8> {
    let mut body = if pretty {
        serde_json::to_string_pretty(value).unwrap_or_default()
    } else {
        serde_json::to_string(value).unwrap_or_default()
    };
    body.push_str("\n\n");
    body.into_bytes()
}

pub fn render_msgpack(value: &Value) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn json_response(status: StatusCode, value: &Value, pretty: bool) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, JSON_TYPE)],
        render_json(value, pretty),
    )
        .into_response()
}

pub fn msgpack_response(status: StatusCode, value: &Value) -> Result<Response> {
    Ok((
        status,
        [(header::CONTENT_TYPE, MSGPACK_TYPE)],
        render_msgpack(value)?,
    )
        .into_response())
}

pub fn blob_response(content_type: &str, blob: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.to_string())],
        blob,
    )
        .into_response()
}

/// Chunked multi-document response: `200`, `Transfer-Encoding: chunked`
/// (hyper frames the stream), `X-Matched-count`, one stream item per
/// document. Dropping the sender ends the stream with the zero-length
/// chunk, on success and on mid-stream failure alike.
pub fn chunked_response(
    matched_count: usize,
    content_type: &str,
    receiver: tokio::sync::mpsc::Receiver<Vec<u8>>,
) -> Response {
    let stream = ReceiverStream::new(receiver)
        .map(|chunk| Ok::<_, std::convert::Infallible>(bytes::Bytes::from(chunk)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(MATCHED_COUNT_HEADER, matched_count.to_string())
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Render any error kind. The status comes from the taxonomy mapping;
/// client-visible kinds carry a JSON body with the message.
pub fn error_response(error: &Error, pretty: bool) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let message = match error {
        Error::EndpointResolution(message) => message.clone(),
        Error::UnsupportedMediaType(message) => message.clone(),
        Error::ParseError(message) | Error::RoutingError(message) => message.clone(),
        other => other.to_string(),
    };

    let mut response = json_response(status, &json!({ "Error message": message }), pretty);
    if matches!(error, Error::PayloadTooLarge) {
        // An oversized request leaves the connection unusable mid-body.
        response.headers_mut().insert(
            header::CONNECTION,
            header::HeaderValue::from_static("close"),
        );
    }
    response
}
