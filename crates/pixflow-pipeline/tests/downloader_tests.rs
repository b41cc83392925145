//! Downloader against a mock HTTP server

mod common;

use common::{fast_retry, image_bytes, png_bytes};
use image::ImageFormat;
use pixflow_common::{ErrorKind, Stage, WorkItem};
use pixflow_pipeline::downloader::{DownloadError, Downloader};
use pixflow_pipeline::fetch::ReqwestFetcher;
use pixflow_pipeline::retry::RetryError;
use pixflow_pipeline::stage::{Outcome, Processor};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn downloader(dir: &TempDir, max_retries: u32) -> Downloader {
    let fetcher = Arc::new(ReqwestFetcher::new(Duration::from_secs(5)).unwrap());
    Downloader::new(fetcher, fast_retry(max_retries), dir.path())
}

fn files_in(dir: &TempDir) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.path())
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_supported_image_is_stored_and_hashed() {
    let server = MockServer::start().await;
    let body = png_bytes();
    Mock::given(method("GET"))
        .and(path("/photos/cat.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/photos/cat.png?size=large", server.uri());
    let (downloaded, attempts) = downloader(&dir, 3)
        .download(&url, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(attempts, 1);
    assert_eq!(downloaded.format, ImageFormat::Png);
    assert_eq!(downloaded.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&downloaded.path).unwrap(), body);

    let name = downloaded.path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("cat-"), "unexpected name {name}");
    assert!(name.ends_with(".png"));

    let expected = pixflow_common::checksum::compute_hash(&mut body.as_slice()).unwrap();
    assert_eq!(downloaded.hash, expected);
}

#[tokio::test]
async fn test_extension_follows_detected_format() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(image_bytes(ImageFormat::Jpeg)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (downloaded, _) = downloader(&dir, 0)
        .download(&format!("{}/misnamed.png", server.uri()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(downloaded.format, ImageFormat::Jpeg);
    assert_eq!(downloaded.path.extension().unwrap(), "jpg");
}

#[tokio::test]
async fn test_unsupported_content_is_permanent_and_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>not an image</body></html>"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let err = downloader(&dir, 3)
        .download(&format!("{}/page.png", server.uri()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RetryError::Permanent {
            error: DownloadError::UnsupportedFormat(_),
            attempts: 1
        }
    ));
    assert!(files_in(&dir).is_empty());
}

#[tokio::test]
async fn test_truncated_image_is_undecodable() {
    let server = MockServer::start().await;
    let mut body = png_bytes();
    body.truncate(40);
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let err = downloader(&dir, 3)
        .download(&format!("{}/broken.png", server.uri()), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.into_error(), DownloadError::Undecodable(_)));
    assert!(files_in(&dir).is_empty());
}

#[tokio::test]
async fn test_succeeds_on_nth_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (_, attempts) = downloader(&dir, 3)
        .download(&format!("{}/flaky.png", server.uri()), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_always_failing_uses_max_retries_plus_one_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(4)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let item = WorkItem::new(format!("{}/forbidden.png", server.uri()));
    let outcome = downloader(&dir, 3).process(item, &CancellationToken::new()).await;

    let item = match outcome {
        Outcome::Fail(item) => item,
        other => panic!("expected failure, got {other:?}"),
    };
    let error = item.error.unwrap();
    assert_eq!(error.stage, Stage::Downloader);
    assert_eq!(error.kind, ErrorKind::Transient);
    assert_eq!(error.attempts, 4);
    assert!(error.message.contains("403"), "{}", error.message);
    assert!(files_in(&dir).is_empty());
}

#[tokio::test]
async fn test_cancel_during_backoff_abandons_item() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ReqwestFetcher::new(Duration::from_secs(5)).unwrap());
    let slow = pixflow_pipeline::retry::RetryPolicy {
        base_delay: Duration::from_secs(600),
        max_delay: Duration::from_secs(600),
        ..pixflow_pipeline::retry::RetryPolicy::default()
    };
    let downloader = Downloader::new(fetcher, slow, dir.path());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        downloader.process(WorkItem::new(format!("{}/x.png", server.uri())), &cancel),
    )
    .await
    .expect("backoff was not interrupted");

    assert!(matches!(outcome, Outcome::Abandon(_)));
}
