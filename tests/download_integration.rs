//! End-to-end tests: real HTTP download service behind the bridge,
//! transfers served by a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use background_downloader::{
    BridgeConfig, ChannelSink, DownloadBridge, DownloadEvent, DownloadRequest,
    HttpDownloadService, NoopMediaScanner, open_store,
};

const WAIT: Duration = Duration::from_secs(10);

async fn bridge_over_http(
    dir: &std::path::Path,
) -> (
    Arc<DownloadBridge>,
    tokio::sync::mpsc::UnboundedReceiver<DownloadEvent>,
) {
    let store = open_store(dir).await;
    let (service, completions) = HttpDownloadService::new(dir.join("staging")).unwrap();
    let (sink, events) = ChannelSink::new();

    let bridge = Arc::new(DownloadBridge::new(
        BridgeConfig {
            download_dir: dir.join("downloads"),
        },
        Arc::new(service),
        completions,
        Arc::new(sink),
        Arc::new(NoopMediaScanner),
        store,
    ));
    bridge.start().await;
    (bridge, events)
}

// ---- End to end: download lands at the destination ----

#[tokio::test]
async fn test_download_ends_at_destination() {
    let server = MockServer::start().await;
    let body = vec![42u8; 4096];
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (bridge, mut events) = bridge_over_http(dir.path()).await;
    let destination = dir.path().join("downloads/file.bin");

    bridge
        .download_file(DownloadRequest {
            url: format!("{}/file.bin", server.uri()),
            destination_path: destination.clone(),
            task_id: "e2e".to_string(),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    let mut saw_begin = false;
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        match event {
            DownloadEvent::Begin { id, .. } => {
                assert_eq!(id, "e2e");
                saw_begin = true;
            }
            DownloadEvent::Progress(_) => {}
            DownloadEvent::Complete {
                id,
                location,
                bytes_downloaded,
                ..
            } => {
                assert_eq!(id, "e2e");
                assert_eq!(location, destination);
                assert_eq!(bytes_downloaded, 4096);
                break;
            }
            DownloadEvent::Failed { error, .. } => panic!("unexpected failure: {error}"),
        }
    }
    assert!(saw_begin, "begin must precede completion");

    assert_eq!(std::fs::read(&destination).unwrap(), body);
    let staging_left: Vec<_> = std::fs::read_dir(dir.path().join("staging"))
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(staging_left.is_empty(), "staging must be empty after the move");
}

// ---- End to end: server error surfaces as a failed event ----

#[tokio::test]
async fn test_http_error_surfaces_failed_event() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (bridge, mut events) = bridge_over_http(dir.path()).await;

    bridge
        .download_file(DownloadRequest {
            url: format!("{}/missing.bin", server.uri()),
            destination_path: dir.path().join("downloads/missing.bin"),
            task_id: "e2e-404".to_string(),
            ..DownloadRequest::default()
        })
        .await
        .unwrap();

    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        match event {
            DownloadEvent::Failed {
                id,
                error_code,
                error,
            } => {
                assert_eq!(id, "e2e-404");
                assert_eq!(
                    error_code,
                    background_downloader::FailureCode::UnhandledHttpCode.as_i64()
                );
                assert!(error.contains("404"), "reason should carry the status: {error}");
                break;
            }
            DownloadEvent::Complete { .. } => panic!("must not complete"),
            _ => {}
        }
    }

    assert!(!dir.path().join("downloads/missing.bin").exists());
}
