#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{Mutex, watch};

    use crate::binary::codec::{
        self, FILE_FOLLOWS, GetChangesets, RemoteQuery, RemoteReplyType, RemoteResults,
        RemoteUpdate, ReplicationReplyType, SWITCH_TO_REPL,
    };
    use crate::binary::compress::{COMPRESSOR_IDENTITY, COMPRESSOR_LZ4, CompressorKind};
    use crate::binary::connection::BinaryConnection;
    use crate::binary::replication::replicate_from;
    use crate::context::{NodeContext, ShutdownPhase};
    use crate::discovery::service::DiscoveryService;
    use crate::discovery::types::NodeName;
    use crate::endpoint::{Endpoint, EndpointSet};
    use crate::executor::TaskPool;
    use crate::resolver::EndpointResolver;
    use crate::search::types::QueryDescriptor;
    use crate::stats::Stats;
    use crate::storage::index::Document;
    use crate::storage::pool::{DB_SPAWN, DB_WRITABLE, DatabasePool};
    use serde_json::json;

    async fn test_ctx(data_dir: &Path) -> (NodeContext, watch::Sender<ShutdownPhase>) {
        let discovery = DiscoveryService::new(
            NodeName("local".into()),
            "127.0.0.1:0".parse().unwrap(),
            0,
            0,
            0,
            vec![],
        )
        .await
        .unwrap();
        let resolver = EndpointResolver::new(discovery.clone());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = DatabasePool::new(data_dir.to_path_buf(), tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownPhase::Running);
        let ctx = NodeContext {
            discovery,
            resolver,
            pool,
            executor: TaskPool::new(4, 64),
            stats: Arc::new(Stats::new()),
            shutdown: shutdown_rx,
        };
        (ctx, shutdown_tx)
    }

    /// Bind a listener that wraps each accepted socket in a
    /// `BinaryConnection`, remembering the last one for inspection.
    async fn spawn_server(ctx: NodeContext) -> (SocketAddr, Arc<Mutex<Option<Arc<BinaryConnection>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let last = Arc::new(Mutex::new(None));
        let slot = last.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = BinaryConnection::spawn(stream, ctx.clone());
                *slot.lock().await = Some(conn);
            }
        });
        (addr, last)
    }

    async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let type_byte = stream.read_u8().await.unwrap();
        let mut len: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        (type_byte, payload)
    }

    async fn write_frame(stream: &mut TcpStream, type_byte: u8, payload: &[u8]) {
        let frame = codec::encode_frame(type_byte, payload);
        stream.write_all(&frame).await.unwrap();
    }

    async fn seed_document(ctx: &NodeContext, index_path: &str, id: &str, content: serde_json::Value) {
        let endpoints = EndpointSet::single(Endpoint::local("local", index_path));
        let handle = ctx
            .pool
            .checkout(&endpoints, DB_WRITABLE | DB_SPAWN)
            .await
            .unwrap();
        handle
            .write()
            .await
            .unwrap()
            .index_document(Document::structured(id, content), true)
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_emits_initial_update() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (type_byte, payload) = read_frame(&mut client).await;

        assert_eq!(type_byte, RemoteReplyType::Update as u8);
        let update: RemoteUpdate = codec::from_payload(&payload).unwrap();
        assert_eq!(update.node_name, "local");
    }

    #[tokio::test]
    async fn test_remote_query_returns_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        seed_document(&ctx, "/demo", "42", json!({"title": "x"})).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await; // initial update

        let query = RemoteQuery {
            index_path: "/demo".into(),
            descriptor: QueryDescriptor {
                query: vec!["title:x".into()],
                ..Default::default()
            },
        };
        write_frame(
            &mut client,
            codec::RemoteMessageType::Query as u8,
            &codec::to_payload(&query).unwrap(),
        )
        .await;

        let (type_byte, payload) = read_frame(&mut client).await;
        assert_eq!(type_byte, RemoteReplyType::Results as u8);
        let results: RemoteResults = codec::from_payload(&payload).unwrap();
        assert_eq!(results.result.matched_count, 1);
        assert_eq!(results.documents[0].id, "42");
    }

    #[tokio::test]
    async fn test_remote_query_unknown_index_is_exception_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;

        let query = RemoteQuery {
            index_path: "/missing".into(),
            descriptor: QueryDescriptor::default(),
        };
        write_frame(
            &mut client,
            codec::RemoteMessageType::Query as u8,
            &codec::to_payload(&query).unwrap(),
        )
        .await;

        let (type_byte, _) = read_frame(&mut client).await;
        assert_eq!(type_byte, RemoteReplyType::Exception as u8);

        // The connection survives an exception frame.
        write_frame(
            &mut client,
            codec::RemoteMessageType::DatabaseInfo as u8,
            &codec::to_payload(&codec::DatabaseInfoRequest {
                index_path: "/missing".into(),
            })
            .unwrap(),
        )
        .await;
        let (type_byte, _) = read_frame(&mut client).await;
        assert_eq!(type_byte, RemoteReplyType::Exception as u8);
    }

    #[tokio::test]
    async fn test_switch_to_repl_in_sync_ends_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        seed_document(&ctx, "/demo", "42", json!({"title": "x"})).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;

        let request = GetChangesets {
            index_path: "/demo".into(),
            from_revision: 1,
        };
        write_frame(
            &mut client,
            SWITCH_TO_REPL,
            &codec::to_payload(&request).unwrap(),
        )
        .await;

        let (type_byte, _) = read_frame(&mut client).await;
        assert_eq!(type_byte, ReplicationReplyType::EndOfChanges as u8);
    }

    #[tokio::test]
    async fn test_switch_to_repl_streams_missing_changesets() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        seed_document(&ctx, "/demo", "42", json!({"title": "x"})).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;

        let request = GetChangesets {
            index_path: "/demo".into(),
            from_revision: 0,
        };
        write_frame(
            &mut client,
            SWITCH_TO_REPL,
            &codec::to_payload(&request).unwrap(),
        )
        .await;

        let (type_byte, payload) = read_frame(&mut client).await;
        assert_eq!(type_byte, ReplicationReplyType::Changeset as u8);
        let frame: codec::ChangesetFrame = codec::from_payload(&payload).unwrap();
        assert_eq!(frame.changeset.revision, 1);

        let (type_byte, _) = read_frame(&mut client).await;
        assert_eq!(type_byte, ReplicationReplyType::EndOfChanges as u8);
    }

    #[tokio::test]
    async fn test_invalid_type_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;

        // 0x90 falls in no declared range for any state.
        write_frame(&mut client, 0x90, b"junk").await;

        let mut buf = [0u8; 16];
        let eof = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "connection should close on invalid frame type");
    }

    #[tokio::test]
    async fn test_unknown_compressor_tag_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, _) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;

        client
            .write_all(&[FILE_FOLLOWS, ReplicationReplyType::DbFiledata as u8, 0x09])
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let eof = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "connection should close on unknown compressor");
    }

    async fn read_file_stream(stream: &mut TcpStream) -> (u8, u8, Vec<u8>) {
        let sentinel = stream.read_u8().await.unwrap();
        assert_eq!(sentinel, FILE_FOLLOWS);
        let inner_type = stream.read_u8().await.unwrap();
        let tag = stream.read_u8().await.unwrap();
        let kind = CompressorKind::from_tag(tag).unwrap();

        let mut content = Vec::new();
        loop {
            let mut len: u64 = 0;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await.unwrap();
                len |= u64::from(byte & 0x7F) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            if len == 0 {
                break;
            }
            let mut block = vec![0u8; len as usize];
            stream.read_exact(&mut block).await.unwrap();
            content.extend(kind.decompress_block(&block).unwrap());
        }
        (inner_type, tag, content)
    }

    #[tokio::test]
    async fn test_send_file_roundtrip_both_compressors() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, last_conn) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;
        let conn = last_conn.lock().await.clone().unwrap();

        let payload: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let file_path = dir.path().join("transfer.bin");
        std::fs::write(&file_path, &payload).unwrap();

        for kind in [CompressorKind::Identity, CompressorKind::Lz4] {
            conn.send_file_with(0x42, &file_path, kind).await.unwrap();
            let (inner_type, tag, content) = read_file_stream(&mut client).await;
            assert_eq!(inner_type, 0x42);
            match kind {
                CompressorKind::Identity => assert_eq!(tag, COMPRESSOR_IDENTITY),
                CompressorKind::Lz4 => assert_eq!(tag, COMPRESSOR_LZ4),
            }
            assert_eq!(content, payload);
        }
    }

    #[tokio::test]
    async fn test_write_queue_byte_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;
        let (addr, last_conn) = spawn_server(ctx).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut client).await;
        let conn = last_conn.lock().await.clone().unwrap();

        for _ in 0..5 {
            conn.send_message(RemoteReplyType::Update as u8, b"tick").unwrap();
        }
        // Drain everything the server wrote.
        for _ in 0..5 {
            let _ = read_frame(&mut client).await;
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.write_queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            conn.write_queue().enqueued_bytes(),
            conn.write_queue().written_bytes()
        );
    }

    #[tokio::test]
    async fn test_replicate_from_changesets() {
        let source_dir = tempfile::tempdir().unwrap();
        let replica_dir = tempfile::tempdir().unwrap();

        let (source_ctx, _source_shutdown) = test_ctx(source_dir.path()).await;
        seed_document(&source_ctx, "/demo", "42", json!({"title": "x"})).await;
        seed_document(&source_ctx, "/demo", "43", json!({"title": "y"})).await;
        let (addr, _) = spawn_server(source_ctx).await;

        let (replica_ctx, _replica_shutdown) = test_ctx(replica_dir.path()).await;
        replicate_from(replica_ctx.clone(), addr, "/demo".into())
            .await
            .unwrap();

        let endpoints = EndpointSet::single(Endpoint::local("local", "/demo"));
        let handle = replica_ctx.pool.checkout(&endpoints, 0).await.unwrap();
        let shard = handle.read().await;
        assert_eq!(shard.revision(), 2);
        assert!(shard.get_document("42").is_some());
        assert!(shard.get_document("43").is_some());
    }

    #[tokio::test]
    async fn test_replicate_from_full_copy() {
        let source_dir = tempfile::tempdir().unwrap();
        let replica_dir = tempfile::tempdir().unwrap();

        let (source_ctx, _source_shutdown) = test_ctx(source_dir.path()).await;
        // Enough commits to outrun the changeset window and force the
        // whole-database path.
        for i in 0..70 {
            seed_document(
                &source_ctx,
                "/bulk",
                &format!("doc{}", i),
                json!({"n": i}),
            )
            .await;
        }
        let (addr, _) = spawn_server(source_ctx.clone()).await;

        let (replica_ctx, _replica_shutdown) = test_ctx(replica_dir.path()).await;
        replicate_from(replica_ctx.clone(), addr, "/bulk".into())
            .await
            .unwrap();

        let endpoints = EndpointSet::single(Endpoint::local("local", "/bulk"));
        let handle = replica_ctx.pool.checkout(&endpoints, 0).await.unwrap();
        let shard = handle.read().await;
        assert_eq!(shard.revision(), 70);
        assert_eq!(shard.doc_count(), 70);
        assert!(shard.get_document("doc69").is_some());
    }

    #[tokio::test]
    async fn test_replicate_from_unreachable_peer_fails_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _shutdown) = test_ctx(dir.path()).await;

        // Grab a port nobody is listening on.
        let dead_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = replicate_from(ctx, dead_addr, "/demo".into())
            .await
            .unwrap_err();
        assert!(err.closes_connection());
    }
}
