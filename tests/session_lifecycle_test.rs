use bytes::Bytes;
use lecture_upload::config::{SessionStoreKind, UploadConfig};
use lecture_upload::infrastructure::storage::setup_upload_service;
use lecture_upload::models::{CompleteUploadRequest, Destination, InitUploadRequest};
use lecture_upload::services::error::UploadError;
use lecture_upload::services::worker::BackgroundWorker;
use std::time::Duration;
use tempfile::TempDir;

fn init_request(file_name: &str, total_chunks: u32) -> InitUploadRequest {
    InitUploadRequest {
        file_name: file_name.to_string(),
        total_chunks,
        destination: Destination::new("rust-101", "week-4", "traits"),
    }
}

#[tokio::test]
async fn test_abandoned_session_is_reaped_after_ttl() {
    let dir = TempDir::new().unwrap();
    let mut config = UploadConfig::development(dir.path());
    config.session_ttl_secs = 3600;
    let uploads = setup_upload_service(&config).await.unwrap();

    let session = uploads
        .init_session("alice", init_request("traits.mp4", 2))
        .await
        .unwrap();
    uploads
        .receive_chunk("alice", &session.session_id, 0, Bytes::from_static(b"half"), None)
        .await
        .unwrap();
    let chunk_dir = config.temp_dir.join(&session.session_id);
    assert!(chunk_dir.exists());

    let two_hours_later = chrono::Utc::now() + chrono::Duration::hours(2);
    let report = uploads.reap_expired(two_hours_later).await.unwrap();
    assert_eq!(report.expired_sessions, 1);
    assert!(!chunk_dir.exists());

    let err = uploads
        .receive_chunk("alice", &session.session_id, 1, Bytes::from_static(b"rest"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::SessionNotFound(_)), "{:?}", err);
}

#[tokio::test]
async fn test_background_worker_reaps_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let mut config = UploadConfig::development(dir.path());
    config.session_ttl_secs = 0;
    let uploads = setup_upload_service(&config).await.unwrap();

    let session = uploads
        .init_session("alice", init_request("gone.mp4", 1))
        .await
        .unwrap();
    let chunk_dir = config.temp_dir.join(&session.session_id);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = BackgroundWorker::new(uploads.clone(), Duration::from_millis(20), shutdown_rx);
    let handle = tokio::spawn(worker.run());

    let mut reaped = false;
    for _ in 0..100 {
        if !chunk_dir.exists() {
            reaped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reaped, "worker never reaped the expired session");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_file_backed_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = UploadConfig::development(dir.path());
    config.session_store = SessionStoreKind::File;

    let session_id = {
        let uploads = setup_upload_service(&config).await.unwrap();
        let session = uploads
            .init_session("alice", init_request("restart.mp4", 2))
            .await
            .unwrap();
        uploads
            .receive_chunk("alice", &session.session_id, 0, Bytes::from_static(b"before-"), None)
            .await
            .unwrap();
        session.session_id
    };

    // A fresh service over the same directories picks up where the old one stopped
    let uploads = setup_upload_service(&config).await.unwrap();
    let status = uploads.session_status("alice", &session_id).await.unwrap();
    assert_eq!(status.received_chunks, vec![0]);
    assert_eq!(status.missing_chunks, vec![1]);

    uploads
        .receive_chunk("alice", &session_id, 1, Bytes::from_static(b"after"), None)
        .await
        .unwrap();
    let asset = uploads
        .complete_session(
            "alice",
            &session_id,
            CompleteUploadRequest {
                total_chunks: 2,
                file_name: "restart.mp4".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(asset.size, 12);
    let relative = asset.asset_locator.strip_prefix("/media/").unwrap();
    let stored = tokio::fs::read(config.storage_dir.join(relative))
        .await
        .unwrap();
    assert_eq!(stored, b"before-after");
}

#[tokio::test]
async fn test_huge_ttl_from_environment_still_opens_sessions() {
    let dir = TempDir::new().unwrap();
    let mut config = UploadConfig::development(dir.path());
    config.session_ttl_secs = u64::MAX;
    let uploads = setup_upload_service(&config).await.unwrap();

    let session = uploads
        .init_session("alice", init_request("forever.mp4", 1))
        .await
        .unwrap();
    assert!(session.expires_at > chrono::Utc::now() + chrono::Duration::days(365));

    let report = uploads
        .reap_expired(chrono::Utc::now() + chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(report.expired_sessions, 0);
}
