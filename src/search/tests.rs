#[cfg(test)]
mod tests {
    use crate::search::engine::{execute, facets};
    use crate::search::types::QueryDescriptor;
    use crate::storage::index::{Document, IndexShard};
    use serde_json::json;

    fn library_shard(dir: &std::path::Path) -> IndexShard {
        let mut shard = IndexShard::open(dir, "/library", true, true).unwrap();
        let docs = vec![
            ("1", json!({"title": "Rust systems programming", "lang": "en", "year": 2019})),
            ("2", json!({"title": "Async Rust patterns", "lang": "en", "year": 2022})),
            ("3", json!({"title": "Cooking for programmers", "lang": "en", "year": 2019})),
            ("4", json!({"title": "Programowanie w Rust", "lang": "pl", "year": 2021})),
        ];
        for (id, content) in docs {
            shard
                .index_document(Document::structured(id, content), true)
                .unwrap();
        }
        shard
    }

    #[test]
    fn test_free_text_query_scores_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust programming".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();

        assert_eq!(result.matched_count, 4);
        // Doc 1 matches both tokens, so it ranks first.
        assert_eq!(result.hits[0].id, "1");
        assert_eq!(result.hits[0].score, 2);
    }

    #[test]
    fn test_field_qualified_query() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["title:async".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.hits[0].id, "2");
    }

    #[test]
    fn test_id_term_matches_raw_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["_id:3".into()],
            unique_doc: true,
            limit: 1,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.hits[0].id, "3");
    }

    #[test]
    fn test_partial_prefix_matching() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            partial: vec!["program".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        // "programming", "programmers", "programowanie"
        assert_eq!(result.matched_count, 3);
    }

    #[test]
    fn test_terms_filter_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust".into()],
            terms: vec!["lang:pl".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.hits[0].id, "4");
    }

    #[test]
    fn test_terms_alone_seed_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            terms: vec!["year:2019".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 2);
    }

    #[test]
    fn test_sort_by_field_descending() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust".into()],
            sort: vec!["-year".into()],
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        let ids: Vec<&str> = result.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "4", "1"]);
    }

    #[test]
    fn test_collapse_keeps_max_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust programming cooking".into()],
            collapse: Some("lang".into()),
            collapse_max: 1,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        // One English doc and one Polish doc survive.
        assert_eq!(result.matched_count, 2);
    }

    #[test]
    fn test_limit_zero_keeps_matched_count() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust".into()],
            limit: 0,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 3);
        assert!(result.hits.is_empty());
    }

    #[test]
    fn test_pagination_offset() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust".into()],
            offset: 1,
            limit: 1,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        assert_eq!(result.matched_count, 3);
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn test_stable_ordering_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust".into()],
            ..Default::default()
        };
        let first = execute(&shard, &q).unwrap();
        let second = execute(&shard, &q).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_facet_counts() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["rust programming cooking".into()],
            facets: vec!["lang".into()],
            ..Default::default()
        };
        let facet_map = facets(&shard, &q).unwrap();
        let lang = facet_map.get("lang").unwrap();
        assert_eq!(lang[0].value, "en");
        assert_eq!(lang[0].termfreq, 3);
        assert_eq!(lang[1].value, "pl");
        assert_eq!(lang[1].termfreq, 1);
    }

    #[test]
    fn test_fuzzy_expands_result_set() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["title:async".into()],
            is_fuzzy: true,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        // Expansion terms mined from doc 2 ("rust", "patterns", ...) pull in
        // the other Rust documents.
        assert!(result.matched_count > 1);
        assert!(result.hits.iter().any(|h| h.id == "2"));
    }

    #[test]
    fn test_nearest_returns_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let q = QueryDescriptor {
            query: vec!["title:async".into()],
            is_nearest: true,
            ..Default::default()
        };
        let result = execute(&shard, &q).unwrap();
        // Neighbours share mined terms; the seed document itself scores too.
        assert!(result.hits.iter().any(|h| h.id == "1" || h.id == "4"));
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let shard = library_shard(dir.path());

        let result = execute(&shard, &QueryDescriptor::default()).unwrap();
        assert_eq!(result.matched_count, 0);
    }
}
