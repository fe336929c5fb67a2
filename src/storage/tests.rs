#[cfg(test)]
mod tests {
    use crate::endpoint::{Endpoint, EndpointSet};
    use crate::error::Error;
    use crate::storage::index::{Changeset, DocOp, Document, IndexShard};
    use crate::storage::pool::{
        DB_INIT_REF, DB_SPAWN, DB_WRITABLE, DatabasePool, REOPEN_RETRIES,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn demo_endpoints() -> EndpointSet {
        EndpointSet::single(Endpoint::local("local", "/demo"))
    }

    fn test_pool(dir: &std::path::Path) -> Arc<DatabasePool> {
        let (tx, _rx) = mpsc::unbounded_channel();
        DatabasePool::with_limits(dir.to_path_buf(), tx, 2, Duration::from_millis(200))
    }

    // ============================================================
    // INDEX SHARD TESTS
    // ============================================================

    #[test]
    fn test_open_without_spawn_is_unknown_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let err = IndexShard::open(dir.path(), "/missing", false, false).unwrap_err();
        assert!(matches!(err, Error::EndpointResolution(_)));
        assert!(err.to_string().contains("Unknown Endpoint"));
    }

    #[test]
    fn test_index_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();

        let doc = Document::structured("42", json!({"title": "x"}));
        shard.index_document(doc.clone(), false).unwrap();

        let fetched = shard.get_document("42").unwrap();
        assert_eq!(fetched, &doc);
        assert_eq!(shard.doc_count(), 1);
    }

    #[test]
    fn test_uncommitted_write_visible_in_memory_but_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
            shard
                .index_document(Document::structured("42", json!({"title": "x"})), false)
                .unwrap();
            // Visible to anything sharing this instance.
            assert!(shard.get_document("42").is_some());
            assert_eq!(shard.revision(), 0);
        }
        // Never committed, so a fresh open sees nothing.
        let shard = IndexShard::open(dir.path(), "/demo", false, true).unwrap();
        assert!(shard.get_document("42").is_none());
    }

    #[test]
    fn test_commit_bumps_revision_and_emits_changeset() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();

        shard
            .index_document(Document::structured("a", json!({"title": "one"})), true)
            .unwrap();
        shard
            .index_document(Document::structured("b", json!({"title": "two"})), true)
            .unwrap();

        assert_eq!(shard.revision(), 2);
        let changesets = shard.changesets_since(0).unwrap();
        assert_eq!(changesets.len(), 2);
        assert_eq!(changesets[0].revision, 1);
        assert!(matches!(changesets[0].ops[0], DocOp::Index(_)));
        assert!(shard.changesets_since(2).unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();

        shard
            .index_document(Document::structured("a", json!({"title": "one"})), true)
            .unwrap();
        assert!(shard.delete_document("a", true).unwrap());
        assert!(!shard.delete_document("a", true).unwrap());
        assert_eq!(shard.doc_count(), 0);
        assert!(shard.postings("one").is_none());
    }

    #[test]
    fn test_patch_merges_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();

        shard
            .index_document(
                Document::structured("a", json!({"title": "one", "year": 2000})),
                true,
            )
            .unwrap();
        shard
            .patch_document("a", &json!({"year": 2015}), true)
            .unwrap();

        let doc = shard.get_document("a").unwrap();
        assert_eq!(doc.content, json!({"title": "one", "year": 2015}));
        assert!(shard.postings("year:2015").is_some());
        assert!(shard.postings("year:2000").is_none());
    }

    #[test]
    fn test_patch_missing_document_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
        let err = shard
            .patch_document("ghost", &json!({"x": 1}), true)
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_changesets_too_far_back_need_full_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();

        // Push the changeset window past its bound.
        for i in 0..70 {
            shard
                .index_document(
                    Document::structured(&format!("doc{}", i), json!({"n": i})),
                    true,
                )
                .unwrap();
        }
        assert!(shard.changesets_since(0).is_none());
        assert!(shard.changesets_since(69).is_some());
    }

    #[test]
    fn test_apply_changeset_replays_ops() {
        let source_dir = tempfile::tempdir().unwrap();
        let replica_dir = tempfile::tempdir().unwrap();

        let mut source = IndexShard::open(source_dir.path(), "/demo", true, true).unwrap();
        source
            .index_document(Document::structured("a", json!({"title": "one"})), true)
            .unwrap();

        let mut replica = IndexShard::open(replica_dir.path(), "/demo", true, true).unwrap();
        for changeset in source.changesets_since(0).unwrap() {
            replica.apply_changeset(changeset).unwrap();
        }

        assert_eq!(replica.revision(), source.revision());
        assert_eq!(
            replica.get_document("a").unwrap().content,
            json!({"title": "one"})
        );
    }

    #[test]
    fn test_apply_changeset_rejects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
        let err = shard
            .apply_changeset(Changeset {
                revision: 5,
                ops: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::StorageError(_)));
    }

    #[test]
    fn test_reopen_picks_up_external_commit() {
        let dir = tempfile::tempdir().unwrap();
        let reader = {
            let mut writer = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
            writer
                .index_document(Document::structured("a", json!({"title": "one"})), true)
                .unwrap();
            drop(writer);
            IndexShard::open(dir.path(), "/demo", false, false).unwrap()
        };
        assert_eq!(reader.revision(), 1);

        // A different writer commits behind the reader's back.
        let mut reader = reader;
        {
            let mut writer = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
            writer
                .index_document(Document::structured("b", json!({"title": "two"})), true)
                .unwrap();
        }

        assert!(reader.is_stale());
        reader.reopen().unwrap();
        assert_eq!(reader.revision(), 2);
        assert!(reader.get_document("b").is_some());
        assert!(REOPEN_RETRIES >= 1);
    }

    #[test]
    fn test_rollback_discards_uncommitted_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
        shard
            .index_document(Document::structured("a", json!({"title": "one"})), true)
            .unwrap();
        shard
            .index_document(Document::structured("b", json!({"title": "two"})), false)
            .unwrap();
        assert!(shard.has_pending());

        shard.rollback().unwrap();
        assert!(!shard.has_pending());
        assert_eq!(shard.revision(), 1);
        assert!(shard.get_document("a").is_some());
        assert!(shard.get_document("b").is_none());
    }

    #[test]
    fn test_schema_inference() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = IndexShard::open(dir.path(), "/demo", true, true).unwrap();
        shard
            .index_document(
                Document::structured(
                    "a",
                    json!({"title": "one", "year": 2015, "meta": {"lang": "en"}}),
                ),
                true,
            )
            .unwrap();

        let schema = shard.schema();
        assert_eq!(schema.get("title").map(String::as_str), Some("text"));
        assert_eq!(schema.get("year").map(String::as_str), Some("number"));
        assert_eq!(schema.get("meta.lang").map(String::as_str), Some("text"));
    }

    // ============================================================
    // DATABASE POOL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_checkout_spawn_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let endpoints = demo_endpoints();

        {
            let handle = pool
                .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
                .await
                .unwrap();
            handle
                .write()
                .await
                .unwrap()
                .index_document(Document::structured("42", json!({"title": "x"})), true)
                .unwrap();
        }

        let handle = pool.checkout(&endpoints, 0).await.unwrap();
        assert!(handle.read().await.get_document("42").is_some());
    }

    #[tokio::test]
    async fn test_single_writer_per_endpoint_set() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let endpoints = demo_endpoints();

        let first = pool
            .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
            .await
            .unwrap();

        // Second writable checkout must time out while the first is held.
        let err = pool
            .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatabaseCheckout(_)));
        assert_eq!(err.http_status(), 502);

        drop(first);
        let _second = pool
            .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_readable_checkouts_share_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let endpoints = demo_endpoints();

        let _spawner = pool.checkout(&endpoints, DB_SPAWN).await.unwrap();
        let a = pool.checkout(&endpoints, 0).await.unwrap();
        let b = pool.checkout(&endpoints, 0).await.unwrap();
        assert_eq!(pool.checked_out_count(), 1);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_readable_handle_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let handle = pool.checkout(&demo_endpoints(), DB_SPAWN).await.unwrap();
        assert!(handle.write().await.is_err());
    }

    #[tokio::test]
    async fn test_lru_eviction_over_quota() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path()); // quota = 2

        for i in 0..4 {
            let endpoints =
                EndpointSet::single(Endpoint::local("local", &format!("/idx{}", i)));
            let handle = pool.checkout(&endpoints, DB_SPAWN).await.unwrap();
            drop(handle);
        }

        assert!(pool.cached_count() <= 2);
    }

    #[tokio::test]
    async fn test_init_ref_announces_index() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool =
            DatabasePool::with_limits(dir.path().to_path_buf(), tx, 2, Duration::from_millis(200));

        let _handle = pool
            .checkout(&demo_endpoints(), DB_WRITABLE | DB_SPAWN | DB_INIT_REF)
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), "/demo");
    }

    #[tokio::test]
    async fn test_rollback_all_releases_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path());
        let endpoints = demo_endpoints();

        let handle = pool
            .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
            .await
            .unwrap();
        handle
            .write()
            .await
            .unwrap()
            .index_document(Document::structured("a", json!({"n": 1})), false)
            .unwrap();

        pool.rollback_all().await;
        assert!(!handle.read().await.has_pending());
    }
}
