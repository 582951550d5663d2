//! HttpFetcher against a scripted HTTP/1.1 server on localhost.
//!
//! Run with: cargo test --test transfer_test

mod common;

use gufftalk_lib::error::TransferError;
use gufftalk_lib::models::transfer::partial_path;
use gufftalk_lib::models::{HttpFetcher, Transfer, TransferProgress, TransferRequest};
use gufftalk_lib::DownloadConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const BODY_LEN: usize = 4096;
const CUT: usize = 1000;

fn body() -> Vec<u8> {
    (0..BODY_LEN).map(|i| (i % 241) as u8).collect()
}

/// Builds the raw response for the n-th request, given its `Range` start.
type Responder = dyn Fn(usize, Option<u64>) -> Vec<u8> + Send + Sync;

struct TestServer {
    addr: SocketAddr,
    ranges: Arc<Mutex<Vec<Option<u64>>>>,
}

impl TestServer {
    async fn start(respond: Box<Responder>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ranges);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let head = read_head(&mut stream).await;
                let start = range_start(&head);
                let index = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(start);
                    seen.len() - 1
                };
                let _ = stream.write_all(&respond(index, start)).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { addr, ranges }
    }

    fn url(&self) -> String {
        format!("http://{}/model.gguf", self.addr)
    }

    fn ranges(&self) -> Vec<Option<u64>> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn range_start(head: &str) -> Option<u64> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("range") {
            return None;
        }
        value
            .trim()
            .strip_prefix("bytes=")?
            .strip_suffix('-')?
            .parse()
            .ok()
    })
}

fn response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Full length advertised, connection closed after `CUT` bytes.
fn truncated() -> Vec<u8> {
    response(
        "200 OK",
        &[("Content-Length", BODY_LEN.to_string())],
        &body()[..CUT],
    )
}

fn full() -> Vec<u8> {
    response("200 OK", &[("Content-Length", BODY_LEN.to_string())], &body())
}

fn partial_from(start: u64) -> Vec<u8> {
    let rest = &body()[start as usize..];
    response(
        "206 Partial Content",
        &[
            ("Content-Length", rest.len().to_string()),
            (
                "Content-Range",
                format!("bytes {}-{}/{}", start, BODY_LEN - 1, BODY_LEN),
            ),
        ],
        rest,
    )
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(DownloadConfig {
        progress_interval_bytes: 1024,
        max_resume_attempts: 2,
        connect_timeout_secs: 5,
    })
    .unwrap()
}

async fn download(
    server: &TestServer,
    destination: &Path,
) -> (Result<PathBuf, TransferError>, Vec<TransferProgress>) {
    let (transfer, rx) = Transfer::new(TransferRequest {
        model_id: "m1".to_string(),
        url: server.url(),
        destination: destination.to_path_buf(),
    });
    let fetcher = fetcher();
    tokio::join!(transfer.run(&fetcher), collect(rx))
}

async fn collect(mut rx: mpsc::Receiver<TransferProgress>) -> Vec<TransferProgress> {
    let mut reports = Vec::new();
    while let Some(p) = rx.recv().await {
        reports.push(p);
    }
    reports
}

#[tokio::test]
async fn interrupted_body_resumes_with_range() {
    common::init_logging();
    let server = TestServer::start(Box::new(|_, start| match start {
        None => truncated(),
        Some(start) => partial_from(start),
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, reports) = download(&server, &destination).await;

    assert_eq!(result.unwrap(), destination);
    assert_eq!(std::fs::read(&destination).unwrap(), body());
    assert!(!partial_path(&destination).exists());
    assert_eq!(server.ranges(), vec![None, Some(CUT as u64)]);

    assert!(reports
        .windows(2)
        .all(|w| w[0].bytes_written <= w[1].bytes_written));
    assert_eq!(reports.last().unwrap().fraction(), 1.0);
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    common::init_logging();
    let server = TestServer::start(Box::new(|index, _| {
        if index == 0 {
            truncated()
        } else {
            full()
        }
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, reports) = download(&server, &destination).await;

    result.unwrap();
    // Appending to the first 1000 bytes would have produced 5096 bytes.
    assert_eq!(std::fs::read(&destination).unwrap(), body());
    assert_eq!(server.ranges(), vec![None, Some(CUT as u64)]);
    assert_eq!(reports.last().unwrap().fraction(), 1.0);
}

#[tokio::test]
async fn resume_attempts_are_bounded() {
    common::init_logging();
    let server = TestServer::start(Box::new(|_, _| truncated())).await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, _) = download(&server, &destination).await;

    let err = result.unwrap_err();
    assert!(err.is_resumable(), "{err:?}");
    // First request plus two resumes.
    assert_eq!(server.ranges().len(), 3);
    assert!(!destination.exists());
}

#[tokio::test]
async fn short_body_without_length_is_interrupted() {
    common::init_logging();
    // The resumed response has no Content-Length and ends early, so the
    // body closes cleanly but short of the size advertised first.
    let server = TestServer::start(Box::new(|_, start| match start {
        None => truncated(),
        Some(start) => {
            let end = (start as usize + 500).min(BODY_LEN);
            response("206 Partial Content", &[], &body()[start as usize..end])
        }
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, _) = download(&server, &destination).await;

    assert!(matches!(
        result,
        Err(TransferError::Interrupted {
            expected,
            ..
        }) if expected == BODY_LEN as u64
    ));
    assert_eq!(server.ranges().len(), 3);
}

#[tokio::test]
async fn unknown_length_reports_completion() {
    common::init_logging();
    let server =
        TestServer::start(Box::new(|_, _| response("200 OK", &[], &body()))).await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, reports) = download(&server, &destination).await;

    result.unwrap();
    assert_eq!(std::fs::read(&destination).unwrap(), body());
    let last = reports.last().unwrap();
    assert_eq!(last.bytes_written, BODY_LEN as u64);
    assert_eq!(last.fraction(), 1.0);
    assert_eq!(server.ranges(), vec![None]);
}

#[tokio::test]
async fn error_status_is_not_retried() {
    common::init_logging();
    let server = TestServer::start(Box::new(|_, _| {
        response("404 Not Found", &[("Content-Length", "0".to_string())], b"")
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("m1.gguf");

    let (result, reports) = download(&server, &destination).await;

    assert!(matches!(result, Err(TransferError::Status(404))));
    assert!(reports.is_empty());
    assert_eq!(server.ranges().len(), 1);
}
