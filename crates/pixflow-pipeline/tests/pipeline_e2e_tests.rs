//! End-to-end runs of the in-process pipeline

mod common;

use common::{png_bytes, read_rows, write_file, Fixture};
use pixflow_pipeline::pipeline::Pipeline;
use pixflow_pipeline::sink::{FAILURE_HEADER, SUCCESS_HEADER};
use pixflow_pipeline::transform::NativeTransformer;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve_png(server: &MockServer, at: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_duplicate_url_yields_one_success_row() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .expect(1)
        .mount(&server)
        .await;

    let fixture = Fixture::new();
    let uri = server.uri();
    let input = write_file(fixture.dir.path(), "urls.csv", &format!("url\n{uri}/a.png\n{uri}/a.png\n"));

    let summary = Pipeline::new(fixture.config.clone(), fixture.parts())
        .run(&input, &fixture.path("output.csv"), &fixture.path("failed.csv"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.reader.duplicates, 1);
    assert_eq!(summary.report.success_rows, 1);
    assert_eq!(summary.report.failure_rows, 0);

    let rows = read_rows(&fixture.path("output.csv"));
    assert_eq!(rows[0], SUCCESS_HEADER);
    assert_eq!(rows.len(), 2);
    let row = &rows[1];
    assert_eq!(row[0], format!("{uri}/a.png"));
    assert!(Path::new(&row[1]).exists(), "input {} missing", row[1]);
    assert!(row[2].ends_with("-converted.png"), "{}", row[2]);
    assert!(row[3].starts_with("file://"), "{}", row[3]);

    let failed = read_rows(&fixture.path("failed.csv"));
    assert_eq!(failed, vec![FAILURE_HEADER.map(String::from).to_vec()]);
}

#[tokio::test]
async fn test_forbidden_url_is_reported_as_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(4)
        .mount(&server)
        .await;

    let fixture = Fixture::new();
    let url = format!("{}/secret.png", server.uri());
    let input = write_file(fixture.dir.path(), "urls.csv", &format!("url\n{url}\n"));

    let summary = Pipeline::new(fixture.config.clone(), fixture.parts())
        .run(&input, &fixture.path("output.csv"), &fixture.path("failed.csv"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.report.success_rows, 0);
    assert_eq!(summary.report.failure_rows, 1);
    assert_eq!(summary.downloader.failed, 1);

    assert_eq!(read_rows(&fixture.path("output.csv")).len(), 1);
    let failed = read_rows(&fixture.path("failed.csv"));
    assert_eq!(failed.len(), 2);
    assert_eq!(failed[1][0], url);
    assert!(failed[1][4].contains("403"), "{}", failed[1][4]);
    assert!(failed[1][4].starts_with("downloader"), "{}", failed[1][4]);
}

#[tokio::test]
async fn test_mixed_batch_accounts_for_every_url() {
    let server = MockServer::start().await;
    for name in ["/one.png", "/two.png", "/three.png"] {
        serve_png(&server, name).await;
    }
    Mock::given(method("GET"))
        .and(path("/page.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let fixture = Fixture::new();
    let uri = server.uri();
    let csv = format!("url\n{uri}/one.png\nnot a url\n{uri}/two.png\n{uri}/page.html\n{uri}/three.png\n");
    let input = write_file(fixture.dir.path(), "urls.csv", &csv);

    let summary = Pipeline::new(fixture.config.clone(), fixture.parts())
        .run(&input, &fixture.path("output.csv"), &fixture.path("failed.csv"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.reader.published, 4);
    assert_eq!(summary.reader.row_errors.len(), 1);
    assert_eq!(summary.report.success_rows, 3);
    assert_eq!(summary.report.failure_rows, 1);

    let mut succeeded: Vec<String> = read_rows(&fixture.path("output.csv"))
        .into_iter()
        .skip(1)
        .map(|row| row[0].clone())
        .collect();
    succeeded.sort();
    let mut expected = vec![
        format!("{uri}/one.png"),
        format!("{uri}/three.png"),
        format!("{uri}/two.png"),
    ];
    expected.sort();
    assert_eq!(succeeded, expected);

    let failed = read_rows(&fixture.path("failed.csv"));
    assert_eq!(failed[1][0], format!("{uri}/page.html"));

    let uploaded = std::fs::read_dir(fixture.path("bucket")).unwrap().count();
    assert_eq!(uploaded, 3);
}

#[tokio::test]
async fn test_native_transform_writes_grayscale() {
    let server = MockServer::start().await;
    serve_png(&server, "/colour.png").await;

    let fixture = Fixture::new();
    let input = write_file(
        fixture.dir.path(),
        "urls.csv",
        &format!("url\n{}/colour.png\n", server.uri()),
    );
    let mut parts = fixture.parts();
    parts.transformer = Arc::new(NativeTransformer);

    Pipeline::new(fixture.config.clone(), parts)
        .run(&input, &fixture.path("output.csv"), &fixture.path("failed.csv"), CancellationToken::new())
        .await
        .unwrap();

    let rows = read_rows(&fixture.path("output.csv"));
    assert_eq!(rows.len(), 2);
    let converted = image::open(&rows[1][2]).unwrap().to_rgb8();
    assert!(converted.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
}

#[tokio::test]
async fn test_missing_input_fails_run() {
    let fixture = Fixture::new();

    let result = Pipeline::new(fixture.config.clone(), fixture.parts())
        .run(
            &fixture.path("nope.csv"),
            &fixture.path("output.csv"),
            &fixture.path("failed.csv"),
            CancellationToken::new(),
        )
        .await;

    let err = result.unwrap_err();
    assert!(err.is_input_error(), "{err}");
}

#[tokio::test]
async fn test_rejected_input_leaves_reports_untouched() {
    let fixture = Fixture::new();
    let input = write_file(fixture.dir.path(), "urls.csv", "href\nhttp://example.com/a.png\n");
    let previous = "url,input,output,s3url\nhttp://example.com/old.png,a,b,c\n";
    let output = write_file(fixture.dir.path(), "output.csv", previous);

    let err = Pipeline::new(fixture.config.clone(), fixture.parts())
        .run(&input, &output, &fixture.path("failed.csv"), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_input_error(), "{err}");
    assert_eq!(std::fs::read_to_string(&output).unwrap(), previous);
    assert!(!fixture.path("failed.csv").exists());
}
