#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use blobsync::replicate::protocol::{
        read_frame, write_frame, Chunk, Hello, MessageType, Offer,
    };
    use blobsync::replicate::CapabilityFlags;
    use blobsync::store::{BlobMeta, BlobReader, BlobSink};
    use blobsync::transport::tcp::{self, Listener};
    use blobsync::{
        BlobStore, Capability, FsBlobStore, KeyFilter, MemoryBlobStore, Mode, Progress, Session,
        SessionConfig, SyncError, SyncReport,
    };
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    type Outcome = (blobsync::Result<SyncReport>, blobsync::Result<SyncReport>);

    async fn replicate(s1: Session, s2: Session) -> Outcome {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let run = async { tokio::join!(s1.run_stream(a), s2.run_stream(b)) };
        tokio::time::timeout(Duration::from_secs(30), run)
            .await
            .expect("replication did not finish")
    }

    fn fs_store(root: &Path) -> FsBlobStore {
        FsBlobStore::new(root).with_shard_len(7)
    }

    fn write_blob(store: &FsBlobStore, key: &str, content: impl AsRef<[u8]>) {
        let path = store.path_for(key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read_blob(store: &FsBlobStore, key: &str) -> Option<String> {
        fs::read_to_string(store.path_for(key).unwrap()).ok()
    }

    /// store1: foo, bar, quux. store2: first, bar.
    fn three_and_two(temp: &TempDir) -> (FsBlobStore, FsBlobStore) {
        let store1 = fs_store(&temp.path().join("1"));
        let store2 = fs_store(&temp.path().join("2"));
        write_blob(&store1, "2010-01-01_foo.png", "hello");
        write_blob(&store1, "2010-01-05_bar.png", "goodbye");
        write_blob(&store1, "1976-12-17_quux.png", "unix");
        write_blob(&store2, "1900-01-01_first.png", "elder");
        write_blob(&store2, "2010-01-05_bar.png", "goodbye");
        (store1, store2)
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    // =========================================================================
    // Basic scenarios
    // =========================================================================

    #[tokio::test]
    async fn test_empty_to_empty() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let s1 = Session::new(fs_store(&temp.path().join("1")), Capability::default());
        let s2 = Session::new(fs_store(&temp.path().join("2")), Capability::default());

        let (r1, r2) = replicate(s1, s2).await;
        let (r1, r2) = (r1?, r2?);
        assert_eq!(r1.total, 0);
        assert_eq!(r2.total, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_one_file_to_empty() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store1 = fs_store(&temp.path().join("1"));
        let store2 = fs_store(&temp.path().join("2"));
        write_blob(&store1, "2010-01-01_foo.png", "hello");

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        assert_eq!(r1?.sent.blobs, 1);
        assert_eq!(r2?.received.bytes, 5);

        assert_eq!(read_blob(&store1, "2010-01-01_foo.png").as_deref(), Some("hello"));
        assert_eq!(read_blob(&store2, "2010-01-01_foo.png").as_deref(), Some("hello"));
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_three_and_two_files() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        let (r1, r2) = (r1?, r2?);

        assert_eq!(r1.total, 3);
        assert_eq!(r2.total, 3);
        assert_eq!(r1.sent.blobs, 2);
        assert_eq!(r1.received.blobs, 1);
        assert_eq!(r2.sent.blobs, 1);
        assert_eq!(r2.received.blobs, 2);

        for root in [temp.path().join("1"), temp.path().join("2")] {
            assert_eq!(entries(&root), 3);
            assert_eq!(entries(&root.join("2010-01")), 2);
        }
        for store in [&store1, &store2] {
            assert_eq!(read_blob(store, "2010-01-01_foo.png").as_deref(), Some("hello"));
            assert_eq!(read_blob(store, "2010-01-05_bar.png").as_deref(), Some("goodbye"));
            assert_eq!(read_blob(store, "1976-12-17_quux.png").as_deref(), Some("unix"));
            assert_eq!(read_blob(store, "1900-01-01_first.png").as_deref(), Some("elder"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_mode_side_sends_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::from_mode(Mode::Pull)),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        let (r1, r2) = (r1?, r2?);
        assert_eq!(r1.total, 1);
        assert_eq!(r2.total, 1);

        // store1 gained `first`; store2 is unchanged
        assert_eq!(read_blob(&store1, "1900-01-01_first.png").as_deref(), Some("elder"));
        assert_eq!(entries(&temp.path().join("1")), 3);
        assert_eq!(entries(&temp.path().join("2")), 2);
        assert!(read_blob(&store2, "2010-01-01_foo.png").is_none());
        assert!(read_blob(&store2, "1976-12-17_quux.png").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_push_mode_side_receives_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::from_mode(Mode::Push)),
        )
        .await;
        let (r1, r2) = (r1?, r2?);
        assert_eq!(r1.total, 1);
        assert_eq!(r2.total, 1);

        assert_eq!(read_blob(&store1, "1900-01-01_first.png").as_deref(), Some("elder"));
        assert!(read_blob(&store2, "2010-01-01_foo.png").is_none());
        assert!(read_blob(&store2, "1976-12-17_quux.png").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_both_push_only_transfers_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::from_mode(Mode::Push)),
            Session::new(store2.clone(), Capability::from_mode(Mode::Push)),
        )
        .await;
        assert_eq!(r1?.total, 0);
        assert_eq!(r2?.total, 0);

        assert_eq!(entries(&temp.path().join("1")), 2);
        assert_eq!(entries(&temp.path().join("2")), 2);
        assert!(read_blob(&store1, "1900-01-01_first.png").is_none());
        assert!(read_blob(&store2, "2010-01-01_foo.png").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_subdirectory_key() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store1 = FsBlobStore::new(temp.path().join("1"));
        let store2 = FsBlobStore::new(temp.path().join("2"));
        let key = "original/fa1ee1d1b61d9afcc99b1a8bd9b690ac.jpg";
        write_blob(&store1, key, "hello");

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        r1?;
        r2?;

        assert_eq!(read_blob(&store2, key).as_deref(), Some("hello"));
        assert!(temp.path().join("2/original/fa1e").is_dir());
        assert_eq!(store2.list().await?, vec![BlobMeta::new(key, 5)]);
        Ok(())
    }

    #[tokio::test]
    async fn test_filter_limits_advertised_keys() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);
        let foo_only = Capability::default().with_filter(KeyFilter::regex("foo")?);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), foo_only),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        let (r1, r2) = (r1?, r2?);

        // store1 advertises only foo, so it also pulls bar, which it already had
        assert_eq!(r1.local_keys, 1);
        assert_eq!(r1.total, 3);
        assert_eq!(r2.total, 3);

        assert_eq!(entries(&temp.path().join("1")), 3);
        assert_eq!(entries(&temp.path().join("2")), 2);
        assert_eq!(entries(&temp.path().join("1/2010-01")), 2);
        assert_eq!(entries(&temp.path().join("2/2010-01")), 2);

        assert_eq!(read_blob(&store1, "2010-01-05_bar.png").as_deref(), Some("goodbye"));
        assert_eq!(read_blob(&store1, "1900-01-01_first.png").as_deref(), Some("elder"));
        assert_eq!(read_blob(&store2, "2010-01-01_foo.png").as_deref(), Some("hello"));
        assert!(!temp.path().join("2/1976-12").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_size_blob() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store1 = FsBlobStore::new(temp.path().join("1"));
        let store2 = FsBlobStore::new(temp.path().join("2"));
        write_blob(&store1, "empty.txt", "");

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        r1?;
        assert_eq!(r2?.received.blobs, 1);
        assert_eq!(read_blob(&store2, "empty.txt").as_deref(), Some(""));
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_size_and_non_zero_blobs() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store1 = FsBlobStore::new(temp.path().join("1"));
        let store2 = FsBlobStore::new(temp.path().join("2"));
        write_blob(&store1, "empty.txt", "");
        write_blob(&store1, "hello.txt", "hello");

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        r1?;
        let r2 = r2?;
        assert_eq!(r2.received.blobs, 2);
        assert_eq!(r2.received.bytes, 5);
        assert_eq!(read_blob(&store2, "empty.txt").as_deref(), Some(""));
        assert_eq!(read_blob(&store2, "hello.txt").as_deref(), Some("hello"));
        Ok(())
    }

    // =========================================================================
    // Progress and repeat runs
    // =========================================================================

    fn recording(session: Session) -> (Session, Arc<Mutex<Vec<Progress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let session = session.on_progress(move |p| sink.lock().unwrap().push(p));
        (session, events)
    }

    #[tokio::test]
    async fn test_progress_events() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);
        let (s1, events1) = recording(Session::new(store1, Capability::default()));
        let (s2, events2) = recording(Session::new(store2, Capability::default()));

        let (r1, r2) = replicate(s1, s2).await;
        r1?;
        r2?;

        for events in [events1, events2] {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 3);
            assert!(events.iter().all(|p| p.total == 3));
            let sofar: Vec<u64> = events.iter().map(|p| p.sofar).collect();
            assert_eq!(sofar, vec![1, 2, 3]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let (r1, r2) = replicate(
            Session::new(store1.clone(), Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        r1?;
        r2?;

        let (s1, events) = recording(Session::new(store1, Capability::default()));
        let (r1, r2) = replicate(s1, Session::new(store2, Capability::default())).await;
        let (r1, r2) = (r1?, r2?);
        assert_eq!(r1.total, 0);
        assert_eq!(r2.total, 0);
        assert_eq!(r1.local_keys, 4);
        assert_eq!(r1.peer_keys, 4);
        assert!(events.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_lots_of_blobs() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store1 = fs_store(&temp.path().join("1"));
        let store2 = fs_store(&temp.path().join("2"));
        let content = vec![0u8; 100 * 1024];
        for i in 0..200u64 {
            write_blob(&store1, &format!("{:010}.png", i * 7919), &content);
        }

        let (r1, r2) = replicate(
            Session::new(store1, Capability::default()),
            Session::new(store2.clone(), Capability::default()),
        )
        .await;
        assert_eq!(r1?.sent.blobs, 200);
        assert_eq!(r2?.received.bytes, 200 * 100 * 1024);

        let listed = store2.list().await?;
        assert_eq!(listed.len(), 200);
        assert!(listed.iter().all(|m| m.size == 100 * 1024));
        Ok(())
    }

    #[tokio::test]
    async fn test_both_directions_through_a_tiny_pipe() -> anyhow::Result<()> {
        let store1 = MemoryBlobStore::new();
        let store2 = MemoryBlobStore::new();
        for i in 0..50 {
            store1.insert(format!("a/{:02}", i), vec![1u8; 10_000]);
            store2.insert(format!("b/{:02}", i), vec![2u8; 10_000]);
        }
        let config = SessionConfig {
            chunk_size: 1000,
            queue_depth: 2,
            ..Default::default()
        };

        let (a, b) = tokio::io::duplex(256);
        let s1 = Session::new(store1.clone(), Capability::default()).with_config(config.clone());
        let s2 = Session::new(store2.clone(), Capability::default()).with_config(config);
        let (r1, r2) = tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(s1.run_stream(a), s2.run_stream(b))
        })
        .await?;

        assert_eq!(r1?.transferred(), 100);
        assert_eq!(r2?.transferred(), 100);
        assert_eq!(store1.len(), 100);
        assert_eq!(store2.len(), 100);
        assert_eq!(store1.get("b/49").unwrap().as_ref(), &[2u8; 10_000][..]);
        assert_eq!(store2.get("a/00").unwrap().as_ref(), &[1u8; 10_000][..]);
        Ok(())
    }

    // =========================================================================
    // Transports
    // =========================================================================

    #[tokio::test]
    async fn test_replicate_over_tcp() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let (store1, store2) = three_and_two(&temp);

        let listener = Listener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (server, client) = tokio::join!(listener.accept(), tcp::connect(addr));
        let (sr, sw) = server?.split();
        let (cr, cw) = client?.split();

        let (r1, r2) = tokio::join!(
            Session::new(store1.clone(), Capability::default()).run(sr, sw),
            Session::new(store2.clone(), Capability::default()).run(cr, cw),
        );
        assert_eq!(r1?.total, 3);
        assert_eq!(r2?.total, 3);
        assert_eq!(read_blob(&store2, "1976-12-17_quux.png").as_deref(), Some("unix"));
        assert_eq!(read_blob(&store1, "1900-01-01_first.png").as_deref(), Some("elder"));
        Ok(())
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn test_peer_gone_before_handshake() {
        let (a, b) = tokio::io::duplex(1024);
        drop(b);
        let err = Session::new(MemoryBlobStore::new(), Capability::default())
            .run_stream(a)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::HandshakeIncomplete(_)));
    }

    /// Accepts reads but refuses every write.
    struct ReadOnlyStore(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for ReadOnlyStore {
        async fn list(&self) -> io::Result<Vec<BlobMeta>> {
            self.0.list().await
        }

        async fn exists(&self, key: &str) -> io::Result<bool> {
            self.0.exists(key).await
        }

        async fn open_read(&self, key: &str) -> io::Result<BlobReader> {
            self.0.open_read(key).await
        }

        async fn open_write(&self, _key: &str) -> io::Result<Box<dyn BlobSink>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }
    }

    #[tokio::test]
    async fn test_store_write_failure_names_the_key() {
        let peer = MemoryBlobStore::new();
        peer.insert("x", "content");

        let (r1, _r2) = replicate(
            Session::new(ReadOnlyStore(MemoryBlobStore::new()), Capability::default()),
            Session::new(peer, Capability::default()),
        )
        .await;

        let err = r1.unwrap_err();
        assert!(matches!(err, SyncError::StoreWrite { .. }));
        assert_eq!(err.key(), Some("x"));
    }

    #[tokio::test]
    async fn test_peer_closes_mid_blob() {
        let store = MemoryBlobStore::new();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut br, mut bw) = tokio::io::split(b);

        let peer = async {
            let hello = Hello::new(CapabilityFlags::all(), vec!["big".to_string()]);
            write_frame(&mut bw, &hello.encode()).await.unwrap();
            let (msg_type, _) = read_frame(&mut br).await.unwrap().unwrap();
            assert_eq!(msg_type, MessageType::Hello);

            let offer = Offer {
                key: "big".into(),
                size: 100,
            };
            write_frame(&mut bw, &offer.encode()).await.unwrap();
            let chunk = Chunk {
                data: bytes::Bytes::from_static(&[7u8; 10]),
            };
            write_frame(&mut bw, &chunk.encode()).await.unwrap();
            bw.shutdown().await.unwrap();
            br
        };

        let session = Session::new(store.clone(), Capability::default()).run_stream(a);
        let (result, _br) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(session, peer)
        })
        .await
        .expect("session hung after the peer went away");

        assert!(matches!(result, Err(SyncError::ChannelClosed)));
        assert!(store.get("big").is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut br, mut bw) = tokio::io::split(b);

        let peer = async {
            let (msg_type, _) = read_frame(&mut br).await.unwrap().unwrap();
            assert_eq!(msg_type, MessageType::Hello);
            let fatal = blobsync::replicate::protocol::Fatal {
                code: 2,
                message: "cannot list store".into(),
            };
            write_frame(&mut bw, &fatal.encode()).await.unwrap();
            bw.shutdown().await.unwrap();
        };

        let session =
            Session::new(MemoryBlobStore::new(), Capability::default()).run_stream(a);
        let (result, ()) = tokio::join!(session, peer);
        match result {
            Err(SyncError::Remote { code, message }) => {
                assert_eq!(code, 2);
                assert_eq!(message, "cannot list store");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }
}
