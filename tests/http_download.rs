//! End-to-end downloads through HttpTransport against a local mock CDN
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test http_download
//! ```

mod common;

use attachment_dl::{
    AttachmentId, BackupRemoteInfo, DownloadMetadata, Error, RemoteConfigProvider,
};
use common::{
    ATTACHMENT_CDN, BACKUP_CDN, count_files, create_http_coordinator, drain_events, encrypt,
    event_names, plaintext, sha256, test_key, test_key_bytes,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn metadata(cdn_key: &str, digest: Option<[u8; 32]>, len: Option<u32>) -> DownloadMetadata {
    DownloadMetadata {
        mime_type: "image/png".to_string(),
        cdn_number: ATTACHMENT_CDN,
        cdn_key: cdn_key.to_string(),
        encryption_key: test_key(),
        digest,
        plaintext_length: len,
    }
}

async fn serve(server: &MockServer, at: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_transient_attachment_downloads_and_decrypts() {
    let server = MockServer::start().await;
    let data = plaintext(70_000);
    let ciphertext = encrypt(&data, &test_key_bytes(), [9u8; 16]);
    let digest = sha256(&ciphertext);
    serve(&server, "/attachments/photo1", ciphertext).await;

    let (coordinator, _, temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let mut events = coordinator.subscribe();

    let out = coordinator
        .download_transient_attachment(
            metadata("photo1", Some(digest), Some(data.len() as u32)),
            &CancellationToken::new(),
        )
        .await
        .expect("download should succeed");

    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(
        event_names(&drain_events(&mut events)),
        vec![
            "queued",
            "admitted",
            "transfer_complete",
            "decryption_started",
            "decryption_complete"
        ]
    );

    // Only the plaintext remains; the ciphertext was consumed
    tokio::fs::remove_file(&out).await.unwrap();
    assert_eq!(count_files(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_attachment_is_validated_and_reports_progress() {
    let server = MockServer::start().await;
    let data = plaintext(5_000);
    let ciphertext = encrypt(&data, &test_key_bytes(), [1u8; 16]);
    serve(&server, "/attachments/doc", ciphertext).await;

    let (coordinator, _, _temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let id = AttachmentId::new(77);

    let pending = coordinator
        .download_attachment(metadata("doc", None, None), id, &CancellationToken::new())
        .await
        .expect("attachment should validate");

    assert_eq!(pending.mime_type, "image/png");
    assert_eq!(pending.byte_count, data.len() as u64);
    assert_eq!(tokio::fs::read(&pending.path).await.unwrap(), data);
    assert_eq!(coordinator.download_progress(id), Some(1.0));
}

#[tokio::test]
async fn test_oversize_body_is_aborted_and_never_decrypted() {
    let server = MockServer::start().await;
    serve(&server, "/attachments/huge", vec![0u8; 64 * 1024]).await;

    let (coordinator, _, temp_dir) = create_http_coordinator(&server.uri(), 10_000);
    let mut events = coordinator.subscribe();

    let result = coordinator
        .download_transient_attachment(metadata("huge", None, None), &CancellationToken::new())
        .await;

    match result {
        Err(Error::Oversize { limit, observed }) => {
            assert_eq!(limit, 10_000);
            assert!(observed > limit);
        }
        other => panic!("expected Oversize, got {other:?}"),
    }
    let names = event_names(&drain_events(&mut events));
    assert!(!names.iter().any(|n| n.starts_with("decryption")));
    assert!(names.contains(&"transfer_failed".to_string()));
    assert_eq!(count_files(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_estimate_over_ceiling_rejected_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (coordinator, remote, _temp_dir) = create_http_coordinator(&server.uri(), 1_000);
    assert_eq!(remote.max_attachment_download_size_bytes(), 1_000);

    let result = coordinator
        .download_transient_attachment(
            metadata("big", None, Some(5_000)),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(Error::Oversize { limit: 1_000, .. })));
}

#[tokio::test]
async fn test_tampered_ciphertext_fails_and_is_removed() {
    let server = MockServer::start().await;
    let mut ciphertext = encrypt(&plaintext(300), &test_key_bytes(), [4u8; 16]);
    ciphertext[20] ^= 0xff;
    serve(&server, "/attachments/tampered", ciphertext).await;

    let (coordinator, _, temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let mut events = coordinator.subscribe();

    let result = coordinator
        .download_transient_attachment(metadata("tampered", None, None), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Decryption(_))));
    assert!(
        event_names(&drain_events(&mut events)).contains(&"decryption_failed".to_string())
    );
    assert_eq!(count_files(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_backup_sends_auth_headers_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/backups/dir1/archive"))
        .and(header("Authorization", "Basic dGVzdDp0ZXN0"))
        .and(header("Content-Type", "application/octet-stream"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"backup bytes".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let (coordinator, _, _temp_dir) = create_http_coordinator(&server.uri(), 1);
    let info = BackupRemoteInfo {
        cdn: i64::from(BACKUP_CDN),
        backup_dir: "dir1".to_string(),
        backup_name: "archive".to_string(),
    };
    let headers = BTreeMap::from([(
        "Authorization".to_string(),
        "Basic dGVzdDp0ZXN0".to_string(),
    )]);

    // The attachment ceiling of 1 byte does not apply to backups
    let file = coordinator
        .download_backup(info, headers, &CancellationToken::new())
        .await
        .expect("backup should download");

    assert_eq!(tokio::fs::read(&file.path).await.unwrap(), b"backup bytes");
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (coordinator, _, _temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let result = coordinator
        .download_transient_attachment(metadata("missing", None, None), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::HttpStatus { status: 404, .. })));
}

#[tokio::test]
async fn test_unresponsive_server_times_out_after_all_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .expect(3)
        .mount(&server)
        .await;

    let (coordinator, _, _temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let mut events = coordinator.subscribe();

    let result = coordinator
        .download_transient_attachment(metadata("slow", None, None), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Timeout { .. })));
    let retries = event_names(&drain_events(&mut events))
        .into_iter()
        .filter(|n| n == "retrying")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_cancel_during_slow_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(250)))
        .mount(&server)
        .await;

    let (coordinator, _, _temp_dir) = create_http_coordinator(&server.uri(), 1_000_000);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = coordinator
        .download_transient_attachment(metadata("slow", None, None), &cancel)
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(coordinator.in_flight(), 0);
}
