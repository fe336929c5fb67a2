//! Index Shard
//!
//! One `IndexShard` is the engine behind one index path: documents, the
//! inverted index, an inferred field schema, a monotonic committed
//! `revision`, and a bounded changeset log that replication replays.
//!
//! Disk layout under `<data-dir>/<index-path>/`:
//! - `docs.bin`    bincode snapshot written on commit
//! - `meta.json`   committed revision, read cheaply for divergence checks
//! - `changes.log` appended changesets, `[u32 LE length][bincode]` frames
//! - `.lock`       flock'd while a writer is open

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::lock::FileLock;
use crate::error::{Error, Result};
use crate::search::tokenizer::tokenize_text;

/// Changesets kept replayable before replication falls back to a full copy.
const CHANGESET_WINDOW: usize = 64;

pub const JSON_TYPE: &str = "application/json";
pub const MSGPACK_TYPE: &str = "application/msgpack";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    /// Structured fields when the content type is structural, `Null` for
    /// blob-only documents.
    pub content: Value,
    /// Raw payload slot served for non-structural accept types.
    pub blob: Option<Vec<u8>>,
    pub content_type: String,
}

impl Document {
    pub fn structured(id: &str, content: Value) -> Self {
        Self {
            id: id.to_string(),
            content,
            blob: None,
            content_type: JSON_TYPE.to_string(),
        }
    }

    pub fn blob(id: &str, bytes: Vec<u8>, content_type: &str) -> Self {
        Self {
            id: id.to_string(),
            content: Value::Null,
            blob: Some(bytes),
            content_type: content_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DocOp {
    Index(Document),
    Delete(String),
}

/// A self-contained, applyable delta between two commit points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Changeset {
    pub revision: u64,
    pub ops: Vec<DocOp>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    revision: u64,
    docs: Vec<Document>,
    schema: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct Meta {
    revision: u64,
}

#[derive(Debug)]
pub struct IndexShard {
    path: String,
    dir: PathBuf,
    lock: Option<FileLock>,
    docs: HashMap<String, Document>,
    /// term -> doc ids; `BTreeSet` keeps result ordering stable.
    terms: HashMap<String, BTreeSet<String>>,
    schema: BTreeMap<String, String>,
    revision: u64,
    pending: Vec<DocOp>,
    changesets: VecDeque<Changeset>,
}

fn shard_dir(data_dir: &Path, index_path: &str) -> PathBuf {
    let mut dir = data_dir.to_path_buf();
    for segment in index_path.split('/').filter(|s| !s.is_empty()) {
        dir.push(segment);
    }
    dir
}

fn io_err(context: &str, e: std::io::Error) -> Error {
    Error::StorageError(format!("{}: {}", context, e))
}

impl IndexShard {
    /// Open the shard at `index_path`. `spawn` creates a missing index;
    /// without it a missing index is an unknown endpoint. `writable`
    /// acquires the cross-process lock file.
    pub fn open(data_dir: &Path, index_path: &str, writable: bool, spawn: bool) -> Result<Self> {
        let dir = shard_dir(data_dir, index_path);

        if !dir.exists() {
            if !spawn {
                return Err(Error::EndpointResolution("Unknown Endpoint".to_string()));
            }
            std::fs::create_dir_all(&dir).map_err(|e| io_err("create index dir", e))?;
        }

        let mut shard = Self {
            path: index_path.to_string(),
            dir,
            lock: None,
            docs: HashMap::new(),
            terms: HashMap::new(),
            schema: BTreeMap::new(),
            revision: 0,
            pending: Vec::new(),
            changesets: VecDeque::new(),
        };

        if writable {
            shard.ensure_writable()?;
        }
        shard.load()?;
        Ok(shard)
    }

    /// Acquire the lock file, making this instance the index's writer.
    pub fn ensure_writable(&mut self) -> Result<()> {
        if self.lock.is_none() {
            let lock = FileLock::lock(self.dir.join(".lock"))
                .map_err(|e| Error::DatabaseCheckout(format!("index {} locked: {}", self.path, e)))?;
            self.lock = Some(lock);
        }
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        self.lock.is_some()
    }

    pub fn index_path(&self) -> &str {
        &self.path
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn schema(&self) -> &BTreeMap<String, String> {
        &self.schema
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get_document(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &String> {
        self.docs.keys()
    }

    pub fn postings(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.terms.get(term)
    }

    /// Doc ids whose terms start with `prefix`, for `partial` queries.
    pub fn prefix_postings(&self, prefix: &str) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for (term, postings) in &self.terms {
            if term.starts_with(prefix) {
                ids.extend(postings.iter().cloned());
            }
        }
        ids
    }

    /// Terms of a stored document, for relevance-feedback expansion.
    pub fn document_terms(&self, id: &str) -> Vec<String> {
        match self.docs.get(id) {
            Some(doc) => extract_terms(doc).into_iter().map(|(t, _)| t).collect(),
            None => Vec::new(),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Index a document. Without `commit` the write is visible to every
    /// reader sharing this slot but becomes durable and replicable only
    /// when a commit seals the batch.
    pub fn index_document(&mut self, doc: Document, commit: bool) -> Result<()> {
        self.apply_op(DocOp::Index(doc.clone()));
        self.pending.push(DocOp::Index(doc));
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    /// Merge `patch` into an existing structured document.
    pub fn patch_document(&mut self, id: &str, patch: &Value, commit: bool) -> Result<()> {
        let doc = self
            .docs
            .get(id)
            .ok_or_else(|| Error::ParseError(format!("document {} not found", id)))?;
        if !doc.content.is_object() {
            return Err(Error::ParseError(format!(
                "document {} has no structured content to update",
                id
            )));
        }
        let mut content = doc.content.clone();
        merge_json(&mut content, patch);
        let updated = Document {
            id: id.to_string(),
            content,
            blob: doc.blob.clone(),
            content_type: doc.content_type.clone(),
        };
        self.index_document(updated, commit)
    }

    /// Remove a document. Removing an id that isn't there is not an error.
    pub fn delete_document(&mut self, id: &str, commit: bool) -> Result<bool> {
        let existed = self.docs.contains_key(id);
        if existed {
            self.apply_op(DocOp::Delete(id.to_string()));
            self.pending.push(DocOp::Delete(id.to_string()));
            if commit {
                self.commit()?;
            }
        }
        Ok(existed)
    }

    /// Seal the pending batch into a changeset, bump the revision and
    /// persist everything.
    pub fn commit(&mut self) -> Result<()> {
        self.revision += 1;
        let changeset = Changeset {
            revision: self.revision,
            ops: std::mem::take(&mut self.pending),
        };
        self.append_changeset_log(&changeset)?;
        self.push_changeset(changeset);
        self.persist_snapshot()?;
        tracing::debug!("Committed {} at revision {}", self.path, self.revision);
        Ok(())
    }

    /// Discard the uncommitted batch and restore on-disk state. Used on
    /// forced shutdown while a writable handle is held.
    pub fn rollback(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            "Rolling back {} uncommitted op(s) on {}",
            self.pending.len(),
            self.path
        );
        self.pending.clear();
        self.load()
    }

    // ── Divergence ───────────────────────────────────────────────────────

    /// Committed revision currently on disk, 0 when nothing is persisted.
    pub fn disk_revision(&self) -> u64 {
        let Ok(bytes) = std::fs::read(self.dir.join("meta.json")) else {
            return 0;
        };
        serde_json::from_slice::<Meta>(&bytes)
            .map(|meta| meta.revision)
            .unwrap_or(0)
    }

    /// The on-disk state moved under us (replication install or another
    /// process committed).
    pub fn is_stale(&self) -> bool {
        self.disk_revision() > self.revision
    }

    /// Reload from disk. Callers retry their read after this, up to the
    /// pool's retry budget.
    pub fn reopen(&mut self) -> Result<()> {
        tracing::debug!("Reopening {} (revision {})", self.path, self.revision);
        self.pending.clear();
        self.load()
    }

    // ── Replication ──────────────────────────────────────────────────────

    /// Changesets strictly after `revision`, oldest first. `None` means the
    /// window no longer reaches back that far and the peer needs a full
    /// copy.
    pub fn changesets_since(&self, revision: u64) -> Option<Vec<Changeset>> {
        if revision >= self.revision {
            return Some(Vec::new());
        }
        let oldest = self.changesets.front().map(|c| c.revision)?;
        if revision + 1 < oldest {
            return None;
        }
        Some(
            self.changesets
                .iter()
                .filter(|c| c.revision > revision)
                .cloned()
                .collect(),
        )
    }

    /// Apply one replicated changeset atomically and persist.
    pub fn apply_changeset(&mut self, changeset: Changeset) -> Result<()> {
        if changeset.revision != self.revision + 1 {
            return Err(Error::StorageError(format!(
                "changeset revision {} does not follow {}",
                changeset.revision, self.revision
            )));
        }
        for op in &changeset.ops {
            self.apply_op(op.clone());
        }
        self.revision = changeset.revision;
        self.append_changeset_log(&changeset)?;
        self.push_changeset(changeset);
        self.persist_snapshot()?;
        Ok(())
    }

    /// Drop the changeset history. A whole-database copy replaces local
    /// state, so changesets recorded against the old history must not be
    /// served to peers afterwards.
    pub fn reset_changeset_log(&mut self) -> Result<()> {
        self.changesets.clear();
        let log = self.dir.join("changes.log");
        if log.exists() {
            std::fs::remove_file(&log).map_err(|e| io_err("remove changes.log", e))?;
        }
        Ok(())
    }

    /// Storage files a full-copy replication transfers, in install order.
    pub fn storage_files(&self) -> Vec<(String, PathBuf)> {
        ["docs.bin", "meta.json"]
            .iter()
            .map(|name| (name.to_string(), self.dir.join(name)))
            .filter(|(_, path)| path.exists())
            .collect()
    }

    /// Install a received storage file, replacing the local one. The caller
    /// reopens once the footer arrives.
    pub fn install_file(&self, name: &str, data_path: &Path) -> Result<()> {
        if name.contains('/') || name.contains("..") {
            return Err(Error::ProtocolViolation(format!(
                "bad storage file name {}",
                name
            )));
        }
        std::fs::copy(data_path, self.dir.join(name))
            .map_err(|e| io_err("install storage file", e))?;
        Ok(())
    }

    pub fn disk_size(&self) -> u64 {
        self.storage_files()
            .iter()
            .filter_map(|(_, path)| std::fs::metadata(path).ok())
            .map(|m| m.len())
            .sum()
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn apply_op(&mut self, op: DocOp) {
        match op {
            DocOp::Index(doc) => {
                if self.docs.contains_key(&doc.id) {
                    self.unindex_terms(&doc.id);
                }
                for (term, _) in extract_terms(&doc) {
                    self.terms.entry(term).or_default().insert(doc.id.clone());
                }
                infer_schema(&mut self.schema, &doc);
                self.docs.insert(doc.id.clone(), doc);
            }
            DocOp::Delete(id) => {
                self.unindex_terms(&id);
                self.docs.remove(&id);
            }
        }
    }

    fn unindex_terms(&mut self, id: &str) {
        let Some(doc) = self.docs.get(id) else {
            return;
        };
        for (term, _) in extract_terms(doc) {
            if let Some(postings) = self.terms.get_mut(&term) {
                postings.remove(id);
                if postings.is_empty() {
                    self.terms.remove(&term);
                }
            }
        }
    }

    fn push_changeset(&mut self, changeset: Changeset) {
        self.changesets.push_back(changeset);
        while self.changesets.len() > CHANGESET_WINDOW {
            self.changesets.pop_front();
        }
    }

    fn persist_snapshot(&self) -> Result<()> {
        let mut docs: Vec<Document> = self.docs.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = Snapshot {
            revision: self.revision,
            docs,
            schema: self.schema.clone(),
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| Error::Serialisation(e.to_string()))?;
        std::fs::write(self.dir.join("docs.bin"), bytes).map_err(|e| io_err("write docs.bin", e))?;
        let meta = serde_json::to_vec(&Meta {
            revision: self.revision,
        })?;
        std::fs::write(self.dir.join("meta.json"), meta).map_err(|e| io_err("write meta.json", e))?;
        Ok(())
    }

    fn append_changeset_log(&self, changeset: &Changeset) -> Result<()> {
        use std::io::Write;
        let bytes = bincode::serialize(changeset)
            .map_err(|e| Error::Serialisation(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("changes.log"))
            .map_err(|e| io_err("open changes.log", e))?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())
            .and_then(|_| file.write_all(&bytes))
            .map_err(|e| io_err("append changes.log", e))?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.docs.clear();
        self.terms.clear();
        self.schema.clear();
        self.revision = 0;
        self.changesets.clear();

        let snapshot_path = self.dir.join("docs.bin");
        if snapshot_path.exists() {
            let bytes =
                std::fs::read(&snapshot_path).map_err(|e| io_err("read docs.bin", e))?;
            let snapshot: Snapshot = bincode::deserialize(&bytes)
                .map_err(|e| Error::StorageError(format!("corrupt docs.bin: {}", e)))?;
            self.revision = snapshot.revision;
            self.schema = snapshot.schema;
            for doc in snapshot.docs {
                for (term, _) in extract_terms(&doc) {
                    self.terms.entry(term).or_default().insert(doc.id.clone());
                }
                self.docs.insert(doc.id.clone(), doc);
            }
        }

        self.load_changeset_window()?;
        Ok(())
    }

    fn load_changeset_window(&mut self) -> Result<()> {
        let log_path = self.dir.join("changes.log");
        if !log_path.exists() {
            return Ok(());
        }
        let mut file = std::fs::File::open(&log_path).map_err(|e| io_err("open changes.log", e))?;
        let mut len_buf = [0u8; 4];
        loop {
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("read changes.log", e)),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut bytes = vec![0u8; len];
            match file.read_exact(&mut bytes) {
                Ok(()) => {}
                // Torn tail write, ignore the partial record.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("read changes.log", e)),
            }
            match bincode::deserialize::<Changeset>(&bytes) {
                Ok(changeset) => self.push_changeset(changeset),
                Err(e) => {
                    tracing::warn!("Skipping corrupt changeset in {}: {}", self.path, e);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Terms of a document with the field each came from. Structured content
/// yields both bare tokens and `field:token` qualified terms; blob-only
/// documents index nothing.
pub fn extract_terms(doc: &Document) -> Vec<(String, String)> {
    let mut terms = Vec::new();
    collect_terms(&doc.content, "", &mut terms);
    terms
}

fn collect_terms(value: &Value, field: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            for token in tokenize_text(s) {
                if !field.is_empty() {
                    out.push((format!("{}:{}", field, token), field.to_string()));
                }
                out.push((token, field.to_string()));
            }
        }
        Value::Number(n) => {
            if !field.is_empty() {
                out.push((format!("{}:{}", field, n), field.to_string()));
            }
        }
        Value::Bool(b) => {
            if !field.is_empty() {
                out.push((format!("{}:{}", field, b), field.to_string()));
            }
        }
        Value::Object(map) => {
            for (key, sub) in map {
                let nested = if field.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", field, key)
                };
                collect_terms(sub, &nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_terms(item, field, out);
            }
        }
        Value::Null => {}
    }
}

fn infer_schema(schema: &mut BTreeMap<String, String>, doc: &Document) {
    fn walk(schema: &mut BTreeMap<String, String>, value: &Value, field: &str) {
        let type_name = match value {
            Value::String(_) => "text",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Array(items) => {
                for item in items {
                    walk(schema, item, field);
                }
                return;
            }
            Value::Object(map) => {
                for (key, sub) in map {
                    let nested = if field.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", field, key)
                    };
                    walk(schema, sub, &nested);
                }
                return;
            }
            Value::Null => return,
        };
        if !field.is_empty() {
            schema.insert(field.to_string(), type_name.to_string());
        }
    }
    if doc.blob.is_some() && doc.content.is_null() {
        schema
            .entry("_blob".to_string())
            .or_insert_with(|| "binary".to_string());
    }
    walk(schema, &doc.content, "");
}

fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_json(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
