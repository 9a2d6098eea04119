//! Parallel layer copies through a destination session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use blobxfer::cache::MemoryBlobInfoCache;
use blobxfer::commit::LayerStatus;
use blobxfer::dest::{
    DestinationSession, DirectoryStore, ImageDestination, PutBlobOptions, TryReusingBlobOptions,
};
use blobxfer::{BlobInfo, BlobStream, Error};

fn session(dir: &tempfile::TempDir) -> Arc<DestinationSession> {
    Arc::new(DestinationSession::new(Arc::new(DirectoryStore::new(
        dir.path(),
    ))))
}

fn stream(data: Vec<u8>) -> BlobStream {
    Box::pin(std::io::Cursor::new(data))
}

async fn wait_for_status(s: &DestinationSession, index: usize, status: LayerStatus) {
    for _ in 0..500 {
        if s.coordinator().status(index) == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("layer {index} never reached {status:?}");
}

/// Copy one layer the way a copy pipeline does: try reuse, then put.
async fn copy_layer(
    s: Arc<DestinationSession>,
    cache: Arc<MemoryBlobInfoCache>,
    index: usize,
    data: Vec<u8>,
    empty: bool,
) -> blobxfer::Result<BlobInfo> {
    let cancel = CancellationToken::new();
    let info = BlobInfo::of_bytes(&data);
    let reuse = TryReusingBlobOptions::new(cache.clone())
        .layer(index)
        .empty(empty);
    if let Some(found) = s.try_reusing_blob_with_options(&cancel, &info, reuse).await? {
        return Ok(found);
    }
    let put = PutBlobOptions::new(cache).layer(index).empty(empty);
    s.put_blob_with_options(&cancel, stream(data), &info, put)
        .await
}

#[tokio::test]
async fn concurrent_workers_commit_once() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cache = Arc::new(MemoryBlobInfoCache::new());
    let data = vec![42u8; 256 * 1024];

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(copy_layer(
            s.clone(),
            cache.clone(),
            0,
            data.clone(),
            false,
        )));
    }

    let mut results = Vec::new();
    for t in tasks {
        results.push(t.await.unwrap().unwrap());
    }
    let expected = BlobInfo::of_bytes(&data);
    for r in &results {
        assert_eq!(r.digest, expected.digest);
        assert_eq!(r.size, expected.size);
    }
    assert_eq!(s.store().stats().blobs_committed, 1);
    assert_eq!(s.coordinator().status(0), LayerStatus::Committed);
}

#[tokio::test]
async fn conflicting_content_fails_both_callers() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cancel = CancellationToken::new();

    let first = b"first layer content".to_vec();
    let first_info = BlobInfo::of_bytes(&first);
    let (mut writer, reader) = tokio::io::duplex(64);

    let owner = {
        let s = s.clone();
        let cancel = cancel.clone();
        let info = first_info.clone();
        tokio::spawn(async move {
            s.put_blob_with_options(
                &cancel,
                Box::pin(reader),
                &info,
                PutBlobOptions::default().layer(0),
            )
            .await
        })
    };
    wait_for_status(&s, 0, LayerStatus::Pending).await;

    let second = b"second layer content".to_vec();
    let second_info = BlobInfo::of_bytes(&second);
    let err = s
        .put_blob_with_options(
            &cancel,
            stream(second),
            &second_info,
            PutBlobOptions::default().layer(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Consistency { index: 0, .. }));

    writer.write_all(&first).await.unwrap();
    drop(writer);
    let err = owner.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Consistency { index: 0, .. }));
    assert_eq!(s.coordinator().status(0), LayerStatus::Failed);
    assert!(s.coordinator().layer_chain().is_empty());
}

#[tokio::test]
async fn late_conflict_keeps_the_committed_layer() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cache = Arc::new(MemoryBlobInfoCache::new());

    let winner = copy_layer(s.clone(), cache.clone(), 0, b"winner".to_vec(), false)
        .await
        .unwrap();
    let err = copy_layer(s.clone(), cache, 0, b"loser".to_vec(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Consistency { .. }));
    assert_eq!(s.coordinator().committed(0), Some(winner));
}

#[tokio::test]
async fn empty_layers_commit_without_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cache = Arc::new(MemoryBlobInfoCache::new());

    let got = copy_layer(s.clone(), cache, 0, b"tar of nothing".to_vec(), true)
        .await
        .unwrap();
    assert_eq!(got, BlobInfo::of_bytes(b"tar of nothing"));
    assert_eq!(s.coordinator().status(0), LayerStatus::Committed);
    assert_eq!(s.store().stats().bytes_written, 0);
    assert!(!s.store().has_blob(&got.digest).await.unwrap());
}

#[tokio::test]
async fn chain_does_not_depend_on_completion_order() {
    let layers: Vec<(Vec<u8>, bool)> = vec![
        (b"base".to_vec(), false),
        (b"empty".to_vec(), true),
        (b"app".to_vec(), false),
        (b"config tweaks".to_vec(), false),
    ];

    let mut chains = Vec::new();
    for order in [[0usize, 1, 2, 3], [3, 2, 1, 0]] {
        let dir = tempfile::tempdir().unwrap();
        let s = session(&dir);
        let cache = Arc::new(MemoryBlobInfoCache::new());
        for i in order {
            let (data, empty) = layers[i].clone();
            copy_layer(s.clone(), cache.clone(), i, data, empty)
                .await
                .unwrap();
        }
        let chain = s.finish(layers.len()).await.unwrap();
        assert!(s.dir().join("layers.json").is_file());
        chains.push(chain);
    }

    assert_eq!(chains[0], chains[1]);
    let chain = &chains[0];
    assert_eq!(chain.len(), 4);
    assert_eq!(
        chain[0].chain_id.as_ref(),
        Some(&BlobInfo::of_bytes(b"base").digest)
    );
    assert_eq!(chain[1].chain_id, chain[0].chain_id);
    assert_ne!(chain[2].chain_id, chain[1].chain_id);
}

#[tokio::test]
async fn unfinished_image_cannot_be_closed() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cache = Arc::new(MemoryBlobInfoCache::new());
    copy_layer(s.clone(), cache, 1, b"second".to_vec(), false)
        .await
        .unwrap();

    assert!(s.coordinator().layer_chain().is_empty());
    let err = s.finish(2).await.unwrap_err();
    assert!(matches!(err, Error::Incomplete(_)));
    assert!(!s.dir().exists());
}

#[tokio::test]
async fn plain_calls_after_options_calls_are_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let cache = Arc::new(MemoryBlobInfoCache::new());
    copy_layer(s.clone(), cache.clone(), 0, b"layer".to_vec(), false)
        .await
        .unwrap();

    let info = BlobInfo::of_bytes(b"layer");
    let err = s
        .try_reusing_blob(&CancellationToken::new(), &info, cache.as_ref(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Misuse(_)));
}

#[tokio::test]
async fn cancelled_worker_releases_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir);
    let owner_cancel = CancellationToken::new();

    let data = b"never fully sent".to_vec();
    let info = BlobInfo::of_bytes(&data);
    let (_writer, reader) = tokio::io::duplex(16);

    let owner = {
        let s = s.clone();
        let cancel = owner_cancel.clone();
        let info = info.clone();
        tokio::spawn(async move {
            s.put_blob_with_options(
                &cancel,
                Box::pin(reader),
                &info,
                PutBlobOptions::default().layer(0),
            )
            .await
        })
    };
    wait_for_status(&s, 0, LayerStatus::Pending).await;

    let waiter = {
        let s = s.clone();
        let info = info.clone();
        tokio::spawn(async move {
            s.put_blob_with_options(
                &CancellationToken::new(),
                stream(data),
                &info,
                PutBlobOptions::default().layer(0),
            )
            .await
        })
    };

    // Let the waiter attach before the owner goes away.
    tokio::time::sleep(Duration::from_millis(20)).await;
    owner_cancel.cancel();
    assert!(matches!(owner.await.unwrap(), Err(Error::Cancelled)));
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::LayerFailed { index: 0, .. }));
    assert_eq!(s.coordinator().status(0), LayerStatus::Unregistered);

    // The layer can be copied again once its owner is gone.
    let cache = Arc::new(MemoryBlobInfoCache::new());
    let got = copy_layer(s.clone(), cache, 0, b"never fully sent".to_vec(), false)
        .await
        .unwrap();
    assert_eq!(got, info);
    assert_eq!(s.coordinator().status(0), LayerStatus::Committed);
}
