//! URL Parsing
//!
//! Tokenises `/{ns}/{index-path}/{command_or_id}` paths (each request may
//! qualify the target node with a leading `@host` segment) and fills a
//! `QueryDescriptor` from the query string. Boolean values accept
//! `true|false|1|0|t|f` in any case; repeatable keys accumulate.

use axum::http::Uri;

use crate::error::{Error, Result};
use crate::search::types::{CommandKind, QueryDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub host: Option<String>,
    pub index_path: String,
    pub command: String,
    pub kind: CommandKind,
    pub descriptor: QueryDescriptor,
}

pub fn parse_request(uri: &Uri) -> Result<ParsedRequest> {
    let (host, index_path, command) = split_path(uri.path())?;
    let kind = identify_command(&command);
    let descriptor = parse_query_string(uri.query().unwrap_or(""), kind, &command)?;

    Ok(ParsedRequest {
        host,
        index_path,
        command,
        kind,
        descriptor,
    })
}

fn split_path(path: &str) -> Result<(Option<String>, String, String)> {
    let mut segments: Vec<String> = Vec::new();
    for raw in path.split('/').filter(|s| !s.is_empty()) {
        segments.push(percent_decode(raw)?);
    }

    let host = if segments.first().map(|s| s.starts_with('@')) == Some(true) {
        let host = segments.remove(0);
        Some(host[1..].to_string())
    } else {
        None
    };

    if segments.len() < 2 {
        return Err(Error::ParseError(format!("unroutable path {:?}", path)));
    }

    let command = segments.pop().unwrap();
    if command.is_empty() {
        return Err(Error::ParseError("empty command segment".to_string()));
    }
    let index_path = format!("/{}", segments.join("/"));

    Ok((host, index_path, command))
}

pub fn identify_command(command: &str) -> CommandKind {
    match command {
        "_search" => CommandKind::Search,
        "_facets" => CommandKind::Facets,
        "_stats" => CommandKind::Stats,
        "_schema" => CommandKind::Schema,
        "_upload" => CommandKind::Upload,
        "" => CommandKind::Bad,
        _ => CommandKind::Id,
    }
}

/// `true|false|1|0|t|f`, any case.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "t" => Ok(true),
        "false" | "0" | "f" => Ok(false),
        other => Err(Error::ParseError(format!("bad boolean {:?}", other))),
    }
}

fn parse_usize(value: &str, key: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| Error::ParseError(format!("bad value for {}: {:?}", key, value)))
}

fn parse_query_string(query: &str, kind: CommandKind, command: &str) -> Result<QueryDescriptor> {
    let mut e = QueryDescriptor::default();
    let pairs = decode_pairs(query)?;

    let get = |key: &str| -> Option<&str> {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let get_all = |key: &str| -> Vec<String> {
        pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    };

    if let Some(value) = get("pretty") {
        e.pretty = parse_bool(value)?;
    }

    match kind {
        CommandKind::Search | CommandKind::Facets => {
            if let Some(value) = get("offset") {
                e.offset = parse_usize(value, "offset")?;
            }
            if let Some(value) = get("check_at_least") {
                e.check_at_least = parse_usize(value, "check_at_least")?;
            }
            if let Some(value) = get("limit") {
                e.limit = parse_usize(value, "limit")?;
            }
            if let Some(value) = get("collapse_max") {
                e.collapse_max = parse_usize(value, "collapse_max")?;
            }
            if let Some(value) = get("collapse") {
                e.collapse = Some(value.to_string());
            }
            if let Some(value) = get("spelling") {
                e.spelling = parse_bool(value)?;
            }
            if let Some(value) = get("synonyms") {
                e.synonyms = parse_bool(value)?;
            }

            e.query.extend(get_all("query"));
            e.query.extend(get_all("q"));
            e.partial.extend(get_all("partial"));
            e.terms.extend(get_all("terms"));
            e.sort.extend(get_all("sort"));
            e.facets.extend(get_all("facets"));
            e.language.extend(get_all("language"));

            if let Some(value) = get("fuzzy") {
                e.is_fuzzy = parse_bool(value)?;
            }
            if e.is_fuzzy {
                if let Some(value) = get("fuzzy.n_rset") {
                    e.fuzzy.n_rset = parse_usize(value, "fuzzy.n_rset")?;
                }
                if let Some(value) = get("fuzzy.n_eset") {
                    e.fuzzy.n_eset = parse_usize(value, "fuzzy.n_eset")?;
                }
                if let Some(value) = get("fuzzy.n_term") {
                    e.fuzzy.n_term = parse_usize(value, "fuzzy.n_term")?;
                }
                e.fuzzy.field.extend(get_all("fuzzy.field"));
                e.fuzzy.type_.extend(get_all("fuzzy.type"));
            }

            if let Some(value) = get("nearest") {
                e.is_nearest = parse_bool(value)?;
            }
            if e.is_nearest {
                if let Some(value) = get("nearest.n_rset") {
                    e.nearest.n_rset = parse_usize(value, "nearest.n_rset")?;
                }
                if let Some(value) = get("nearest.n_eset") {
                    e.nearest.n_eset = parse_usize(value, "nearest.n_eset")?;
                }
                if let Some(value) = get("nearest.n_term") {
                    e.nearest.n_term = parse_usize(value, "nearest.n_term")?;
                }
                e.nearest.field.extend(get_all("nearest.field"));
                e.nearest.type_.extend(get_all("nearest.type"));
            }
        }

        CommandKind::Id => {
            if let Some(value) = get("commit") {
                e.commit = parse_bool(value)?;
            }
            e.limit = 1;
            e.unique_doc = true;
            e.offset = 0;
            e.check_at_least = 0;
            e.query.push(format!("_id:{}", command));
        }

        CommandKind::Stats => {
            if let Some(value) = get("server") {
                e.server = parse_bool(value)?;
            }
            if let Some(value) = get("database") {
                e.database = parse_bool(value)?;
            }
            if let Some(value) = get("document") {
                e.document = value.to_string();
            }
            if let Some(value) = get("stats") {
                e.stats = value.to_string();
            }
        }

        CommandKind::Schema | CommandKind::Upload | CommandKind::Bad => {}
    }

    Ok(e)
}

fn decode_pairs(query: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };
        pairs.push((percent_decode(key)?, percent_decode(value)?));
    }
    Ok(pairs)
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = input
                    .get(i + 1..i + 3)
                    .ok_or_else(|| Error::ParseError("truncated percent escape".to_string()))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::ParseError(format!("bad percent escape %{}", hex)))?;
                out.push(byte);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::ParseError("URL is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(path_and_query: &str) -> ParsedRequest {
        let uri: Uri = path_and_query.parse().unwrap();
        parse_request(&uri).unwrap()
    }

    #[test]
    fn test_plain_document_path() {
        let parsed = parse("/demo/42");
        assert_eq!(parsed.host, None);
        assert_eq!(parsed.index_path, "/demo");
        assert_eq!(parsed.command, "42");
        assert_eq!(parsed.kind, CommandKind::Id);
        assert!(parsed.descriptor.unique_doc);
        assert_eq!(parsed.descriptor.limit, 1);
        assert_eq!(parsed.descriptor.query, vec!["_id:42"]);
    }

    #[test]
    fn test_namespaced_search_path() {
        let parsed = parse("/ns/books/_search?q=rust");
        assert_eq!(parsed.index_path, "/ns/books");
        assert_eq!(parsed.kind, CommandKind::Search);
        assert_eq!(parsed.descriptor.query, vec!["rust"]);
    }

    #[test]
    fn test_host_qualified_path() {
        let parsed = parse("/@node1/demo/_search");
        assert_eq!(parsed.host.as_deref(), Some("node1"));
        assert_eq!(parsed.index_path, "/demo");
    }

    #[test]
    fn test_single_segment_is_unroutable() {
        let uri: Uri = "/demo".parse().unwrap();
        assert!(parse_request(&uri).is_err());
    }

    #[test]
    fn test_repeatable_keys_accumulate() {
        let parsed = parse("/demo/_search?query=a&q=b&terms=x&terms=y&sort=-year&facets=lang");
        assert_eq!(parsed.descriptor.query, vec!["a", "b"]);
        assert_eq!(parsed.descriptor.terms, vec!["x", "y"]);
        assert_eq!(parsed.descriptor.sort, vec!["-year"]);
        assert_eq!(parsed.descriptor.facets, vec!["lang"]);
    }

    #[test]
    fn test_boolean_spellings() {
        for truthy in ["true", "1", "t", "TRUE", "T"] {
            assert!(parse_bool(truthy).unwrap());
        }
        for falsy in ["false", "0", "f", "FALSE", "F"] {
            assert!(!parse_bool(falsy).unwrap());
        }
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn test_pagination_and_flags() {
        let parsed = parse("/demo/_search?offset=5&limit=20&check_at_least=100&pretty=1");
        assert_eq!(parsed.descriptor.offset, 5);
        assert_eq!(parsed.descriptor.limit, 20);
        assert_eq!(parsed.descriptor.check_at_least, 100);
        assert!(parsed.descriptor.pretty);
    }

    #[test]
    fn test_fuzzy_sub_keys_only_when_enabled() {
        let parsed = parse("/demo/_search?fuzzy.n_term=3");
        assert_eq!(parsed.descriptor.fuzzy.n_term, 10); // ignored, fuzzy off

        let parsed = parse("/demo/_search?fuzzy=true&fuzzy.n_term=3&fuzzy.field=title");
        assert!(parsed.descriptor.is_fuzzy);
        assert_eq!(parsed.descriptor.fuzzy.n_term, 3);
        assert_eq!(parsed.descriptor.fuzzy.field, vec!["title"]);
    }

    #[test]
    fn test_nearest_defaults() {
        let parsed = parse("/demo/_search?nearest=t");
        assert!(parsed.descriptor.is_nearest);
        assert_eq!(parsed.descriptor.nearest.n_rset, 5);
    }

    #[test]
    fn test_stats_keys() {
        let parsed = parse("/demo/_stats?server=t&database=1&document=42&stats=30");
        assert!(parsed.descriptor.server);
        assert!(parsed.descriptor.database);
        assert_eq!(parsed.descriptor.document, "42");
        assert_eq!(parsed.descriptor.stats, "30");
    }

    #[test]
    fn test_commit_flag_on_id() {
        let parsed = parse("/demo/42?commit=true");
        assert!(parsed.descriptor.commit);
    }

    #[test]
    fn test_percent_decoding() {
        let parsed = parse("/demo/_search?q=hello%20world&q=a%2Bb");
        assert_eq!(parsed.descriptor.query, vec!["hello world", "a+b"]);
    }

    #[test]
    fn test_bad_number_is_parse_error() {
        let uri: Uri = "/demo/_search?limit=ten".parse().unwrap();
        assert!(parse_request(&uri).is_err());
    }
}
