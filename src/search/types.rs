use serde::{Deserialize, Serialize};

/// What the request path's last segment asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Id,
    Search,
    Facets,
    Stats,
    Schema,
    Upload,
    Bad,
}

/// Sub-record for `fuzzy.*` and `nearest.*` query keys: relevance-feedback
/// expansion over the `n_rset` best initial matches, considering the
/// `n_eset` most frequent candidate terms and adding `n_term` of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionParams {
    pub n_rset: usize,
    pub n_eset: usize,
    pub n_term: usize,
    pub field: Vec<String>,
    #[serde(rename = "type")]
    pub type_: Vec<String>,
}

impl Default for ExpansionParams {
    fn default() -> Self {
        Self {
            n_rset: 5,
            n_eset: 20,
            n_term: 10,
            field: Vec::new(),
            type_: Vec::new(),
        }
    }
}

/// Everything a parsed URL + query string says about one operation. The
/// HTTP layer builds it; the engine and the remote binary protocol consume
/// it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub pretty: bool,
    pub commit: bool,
    pub unique_doc: bool,
    pub is_fuzzy: bool,
    pub is_nearest: bool,
    pub server: bool,
    pub database: bool,
    pub spelling: bool,
    pub synonyms: bool,

    pub offset: usize,
    pub limit: usize,
    pub check_at_least: usize,
    pub collapse_max: usize,
    pub collapse: Option<String>,

    pub query: Vec<String>,
    pub partial: Vec<String>,
    pub terms: Vec<String>,
    pub sort: Vec<String>,
    pub facets: Vec<String>,
    pub language: Vec<String>,

    pub fuzzy: ExpansionParams,
    pub nearest: ExpansionParams,

    pub document: String,
    pub stats: String,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self {
            pretty: false,
            commit: false,
            unique_doc: false,
            is_fuzzy: false,
            is_nearest: false,
            server: false,
            database: false,
            spelling: false,
            synonyms: false,
            offset: 0,
            limit: 10,
            check_at_least: 0,
            collapse_max: 1,
            collapse: None,
            query: Vec::new(),
            partial: Vec::new(),
            terms: Vec::new(),
            sort: Vec::new(),
            facets: Vec::new(),
            language: Vec::new(),
            fuzzy: ExpansionParams::default(),
            nearest: ExpansionParams::default(),
            document: String::new(),
            stats: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub score: usize,
}

/// One facet value and how many matched documents carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetValue {
    pub value: String,
    pub termfreq: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Total matches before pagination; the HTTP layer reports it as
    /// `X-Matched-count`.
    pub matched_count: usize,
    pub hits: Vec<Hit>,
}
