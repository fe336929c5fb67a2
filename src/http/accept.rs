//! Accept Header Parsing
//!
//! Media ranges with q-values, ordered by q descending then source order.
//! The whole header span must be consumed by the grammar; optional
//! horizontal whitespace around commas is tolerated. Anything else is a
//! parse error the caller turns into a 400.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    pub q: f64,
    pub range: String,
}

impl MediaRange {
    /// Whether this range accepts a concrete content type.
    pub fn matches(&self, content_type: &str) -> bool {
        if self.range == "*/*" || self.range == content_type {
            return true;
        }
        match (self.range.split_once('/'), content_type.split_once('/')) {
            (Some((range_type, "*")), Some((ct_type, _))) => range_type == ct_type,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptSet {
    entries: Vec<MediaRange>,
}

impl AcceptSet {
    pub fn iter(&self) -> impl Iterator<Item = &MediaRange> {
        self.entries.iter()
    }

    pub fn accepts_anything(&self) -> bool {
        self.entries.iter().any(|e| e.range == "*/*")
    }
}

fn media_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9*+.-]+/[a-z0-9*+.-]+)(?:\s*;\s*q=((?:\d*\.)?\d+))?$").unwrap()
    })
}

/// Parse an Accept header value. An empty or missing header accepts
/// everything.
pub fn parse_accept(value: &str) -> Result<AcceptSet> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(AcceptSet {
            entries: vec![MediaRange {
                q: 1.0,
                range: "*/*".to_string(),
            }],
        });
    }

    let mut entries = Vec::new();
    for item in value.split(',') {
        let item = item.trim().to_lowercase();
        let captures = media_range_re().captures(&item).ok_or_else(|| {
            Error::ParseError(format!("malformed accept header near {:?}", item))
        })?;
        let q = match captures.get(2) {
            Some(q) => q
                .as_str()
                .parse::<f64>()
                .map_err(|_| Error::ParseError("bad q value in accept header".to_string()))?,
            None => 1.0,
        };
        entries.push(MediaRange {
            q,
            range: captures[1].to_string(),
        });
    }

    // Stable: equal q-values keep their source order.
    entries.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    Ok(AcceptSet { entries })
}

pub fn parse_accept_header(headers: &HeaderMap) -> Result<AcceptSet> {
    let value = headers
        .get(axum::http::header::ACCEPT)
        .map(|v| {
            v.to_str()
                .map_err(|_| Error::ParseError("accept header is not ASCII".to_string()))
        })
        .transpose()?
        .unwrap_or("");
    parse_accept(value)
}
