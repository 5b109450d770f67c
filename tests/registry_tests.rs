//! Tests for Docker Hub digest lookup.
//!
//! Runs the client against a local HTTP stub standing in for the token
//! service and the registry.

use cubexec::registry::ImageReference;
use cubexec::{DigestLookup, DockerHubClient, Error};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const DIGEST: &str = "sha256:6c3c624b58dbbcd3c0dd82b4c53f04194d1247c6eebdaab7c610cf7d66709b3b";

/// Answers every connection with a response chosen by request path and
/// records the request lines it saw.
async fn stub_server(
    respond: impl Fn(&str) -> String + Send + Sync + 'static,
) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 8192];
            let mut len = 0;
            while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf[len..]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => len += n,
                }
            }
            let request = String::from_utf8_lossy(&buf[..len]).into_owned();
            log.lock().unwrap().push(request.clone());
            let path = request.split_whitespace().nth(1).unwrap_or("").to_string();
            let _ = stream.write_all(respond(&path).as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{}", addr), seen)
}

fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out
}

fn client(base: &str) -> DockerHubClient {
    DockerHubClient::with_timeout(Duration::from_secs(5))
        .unwrap()
        .with_endpoints(format!("{}/token", base), format!("{}/v2", base))
}

// =============================================================================
// Image Reference Tests
// =============================================================================

#[test]
fn test_reference_with_namespace_and_tag() {
    let reference = ImageReference::parse("mlcommons/mock-prep:0.0.1").unwrap();
    assert_eq!(reference.repository, "mlcommons/mock-prep");
    assert_eq!(reference.tag, "0.0.1");
}

#[test]
fn test_official_image_without_tag() {
    let reference = ImageReference::parse("python").unwrap();
    assert_eq!(reference.repository, "library/python");
    assert_eq!(reference.tag, "latest");
}

#[test]
fn test_reference_rejects_shell_metacharacters() {
    for bad in ["app;rm -rf /", "app$(id)", "app:tag\n", "@"] {
        let err = ImageReference::parse(bad).unwrap_err();
        assert!(
            matches!(err, Error::InvalidContainerSpec(_)),
            "{:?} should be rejected",
            bad
        );
    }
}

// =============================================================================
// Digest Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_manifest_digest_from_header() {
    let (base, seen) = stub_server(|path| {
        if path.starts_with("/token") {
            response("200 OK", &[("Content-Type", "application/json")], r#"{"token":"abc"}"#)
        } else {
            response("200 OK", &[("Docker-Content-Digest", DIGEST)], "")
        }
    })
    .await;

    let digest = client(&base).manifest_digest("ubuntu:22.04").await.unwrap();

    assert_eq!(digest, DIGEST);
    let seen = seen.lock().unwrap();
    assert!(seen[0].contains("scope=repository%3Alibrary%2Fubuntu%3Apull"));
    assert!(seen[1].starts_with("GET /v2/library/ubuntu/manifests/22.04 "));
    assert!(seen[1].to_lowercase().contains("authorization: bearer abc"));
}

#[tokio::test]
async fn test_token_failure_is_communication_error() {
    let (base, _) = stub_server(|_| response("401 Unauthorized", &[], "")).await;

    let err = client(&base).manifest_digest("ubuntu").await.unwrap_err();

    assert!(matches!(err, Error::Communication(_)));
    assert!(err.to_string().contains("token"));
}

#[tokio::test]
async fn test_missing_digest_header_rejected() {
    let (base, _) = stub_server(|path| {
        if path.starts_with("/token") {
            response("200 OK", &[], r#"{"token":"abc"}"#)
        } else {
            response("200 OK", &[], "{}")
        }
    })
    .await;

    let err = client(&base).manifest_digest("org/app:1").await.unwrap_err();

    assert!(err.to_string().contains("no digest"));
}

#[tokio::test]
async fn test_non_sha256_digest_rejected() {
    let (base, _) = stub_server(|path| {
        if path.starts_with("/token") {
            response("200 OK", &[], r#"{"token":"abc"}"#)
        } else {
            response("200 OK", &[("Docker-Content-Digest", "md5:1234")], "")
        }
    })
    .await;

    let err = client(&base).manifest_digest("org/app:1").await.unwrap_err();

    assert!(matches!(err, Error::Communication(_)));
}

#[tokio::test]
async fn test_invalid_reference_never_reaches_network() {
    let (base, seen) = stub_server(|_| response("200 OK", &[], "")).await;

    let err = client(&base).manifest_digest("bad ref").await.unwrap_err();

    assert!(matches!(err, Error::InvalidContainerSpec(_)));
    assert!(seen.lock().unwrap().is_empty());
}
