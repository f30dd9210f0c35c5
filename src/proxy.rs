//! Reverse proxy to backend processes.
//!
//! Plain requests go through a `reqwest` client. Request bodies are buffered up
//! to a cap; response bodies are streamed back.
//! WebSocket upgrades are tunnelled: the original request head is replayed on a
//! raw socket to the backend, and only when the backend itself answers `101`
//! are the client and backend sockets spliced together.

use crate::error::{GatewayError, Result};
use crate::process::ProcessManager;
use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::Response,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures_util::StreamExt;
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Cookie naming the editor folder for requests that arrive without the `/code/` prefix.
pub const ROUTING_COOKIE: &str = "termgate_code";

const MAX_RESPONSE_HEAD: usize = 64 * 1024;
/// Upper bound on a buffered request body forwarded to a backend (editor uploads).
const MAX_FORWARD_BODY: usize = 256 * 1024 * 1024;
/// Cap and deadline for the body of a refused upgrade.
const MAX_REFUSAL_BODY: usize = 1024 * 1024;
const REFUSAL_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Marks responses produced by a backend; the dispatcher leaves their headers alone.
#[derive(Debug, Clone, Copy)]
pub struct Proxied;

/// Where a proxied request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub port: u16,
    /// Path and query sent to the backend.
    pub path_and_query: String,
    /// Encoded folder to pin in the routing cookie on the response.
    pub routing_cookie: Option<String>,
}

pub fn encode_folder(folder: &Path) -> String {
    URL_SAFE_NO_PAD.encode(folder.to_string_lossy().as_bytes())
}

/// Decode a `/code/<encoded>` segment. Only absolute paths are accepted.
pub fn decode_folder(encoded: &str) -> Option<PathBuf> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
    let path = PathBuf::from(String::from_utf8(bytes).ok()?);
    path.is_absolute().then_some(path)
}

pub fn routing_cookie(encoded: &str) -> String {
    format!("{ROUTING_COOKIE}={encoded}; HttpOnly; SameSite=Strict; Path=/")
}

/// Terminal backends are mounted at `/terminal/<id>` themselves, so the path is kept.
pub fn terminal_target(processes: &ProcessManager, session_id: &str, uri: &Uri) -> Result<Target> {
    let port = processes
        .terminal_port(session_id)
        .ok_or_else(|| GatewayError::NotFound("Session not found".to_string()))?;
    Ok(Target {
        port,
        path_and_query: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        routing_cookie: None,
    })
}

/// Editor backends serve from `/`, so the `/code/<encoded>` prefix is stripped.
/// The remainder of the path is taken from the raw URI and left escaped.
///
/// `current_cookie` is the routing cookie the client already holds; a new one
/// is only set when it differs.
pub fn editor_target(
    processes: &ProcessManager,
    uri: &Uri,
    current_cookie: Option<&str>,
) -> Result<Target> {
    let tail = uri
        .path()
        .strip_prefix("/code/")
        .ok_or_else(|| GatewayError::NotFound("Editor not found".to_string()))?;
    let (encoded, rest) = tail.split_once('/').unwrap_or((tail, ""));
    let port = editor_port(processes, encoded)?;
    let mut path_and_query = format!("/{rest}");
    if let Some(query) = uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }
    Ok(Target {
        port,
        path_and_query,
        routing_cookie: (current_cookie != Some(encoded)).then(|| encoded.to_string()),
    })
}

/// Absolute-path requests (editor assets, service worker) routed by cookie alone.
pub fn cookie_target(processes: &ProcessManager, encoded: &str, uri: &Uri) -> Result<Target> {
    let port = editor_port(processes, encoded)?;
    Ok(Target {
        port,
        path_and_query: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        routing_cookie: None,
    })
}

fn editor_port(processes: &ProcessManager, encoded: &str) -> Result<u16> {
    let folder = decode_folder(encoded)
        .ok_or_else(|| GatewayError::NotFound("Editor not found".to_string()))?;
    processes
        .editor_port(&folder.to_string_lossy())
        .ok_or_else(|| GatewayError::NotFound("Editor not running for this folder".to_string()))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Forward `req` to `target`, tunnelling WebSocket upgrades.
pub async fn proxy(client: &reqwest::Client, target: Target, req: Request) -> Result<Response> {
    let mut response = if is_websocket_upgrade(req.headers()) {
        tunnel(req, &target).await?
    } else {
        forward(client, &target, req).await?
    };
    if let Some(encoded) = &target.routing_cookie {
        if let Ok(value) = HeaderValue::from_str(&routing_cookie(encoded)) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response.extensions_mut().insert(Proxied);
    Ok(response)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

async fn forward(client: &reqwest::Client, target: &Target, req: Request) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let url = format!("http://127.0.0.1:{}{}", target.port, target.path_and_query);
    let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
        || parts.headers.contains_key(header::TRANSFER_ENCODING);

    let mut builder = client.request(parts.method, &url);
    for (name, value) in parts.headers.iter() {
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(header::HOST, format!("127.0.0.1:{}", target.port));
    if has_body {
        let declared = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > MAX_FORWARD_BODY) {
            return Err(GatewayError::BodyTooLarge);
        }
        builder = builder.body(read_body(body, MAX_FORWARD_BODY).await?);
    }

    let upstream = builder.send().await.map_err(|e| {
        GatewayError::UpstreamUnavailable(format!("backend on port {}: {e}", target.port))
    })?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Buffer a request body, failing with `BodyTooLarge` once it passes `limit`.
async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::Internal(format!("failed to read request body: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::BodyTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn strip_crlf(value: &[u8]) -> Vec<u8> {
    value.iter().copied().filter(|b| *b != b'\r' && *b != b'\n').collect()
}

/// Re-serialize the client's request head for the backend, pointing `Host`
/// and `Origin` at the backend's own address.
fn request_head(method: &Method, headers: &HeaderMap, target: &Target) -> Vec<u8> {
    let backend = format!("127.0.0.1:{}", target.port);
    let mut head = format!("{method} {} HTTP/1.1\r\n", target.path_and_query).into_bytes();
    for (name, value) in headers.iter() {
        if name == header::HOST || name == header::ORIGIN {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(&strip_crlf(value.as_bytes()));
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(format!("host: {backend}\r\n").as_bytes());
    if headers.contains_key(header::ORIGIN) {
        head.extend_from_slice(format!("origin: http://{backend}\r\n").as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn parse_response_head(head: &[u8]) -> Option<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut status_line = lines.next()?.splitn(3, ' ');
    if !status_line.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let status = StatusCode::from_u16(status_line.next()?.parse().ok()?).ok()?;
    let mut headers = HeaderMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':')?;
        headers.append(
            HeaderName::from_bytes(name.trim().as_bytes()).ok()?,
            HeaderValue::from_str(value.trim()).ok()?,
        );
    }
    Some((status, headers))
}

/// Read the backend's response head; returns it with any bytes read past it.
async fn read_response_head(backend: &mut TcpStream) -> Result<(StatusCode, HeaderMap, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::UpstreamUnavailable(
                "backend closed the connection during the handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let leftover = buf.split_off(pos + 4);
            let (status, headers) = parse_response_head(&buf).ok_or_else(|| {
                GatewayError::UpstreamUnavailable("malformed handshake response".to_string())
            })?;
            return Ok((status, headers, leftover));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(GatewayError::UpstreamUnavailable(
                "handshake response head too large".to_string(),
            ));
        }
    }
}

/// Complete a refused-upgrade body up to its declared `Content-Length`.
async fn read_refusal_body(backend: &mut TcpStream, headers: &HeaderMap, mut body: Vec<u8>) -> Vec<u8> {
    let Some(declared) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return body;
    };
    let wanted = declared.min(MAX_REFUSAL_BODY);
    let fill = async {
        let mut chunk = [0u8; 4096];
        while body.len() < wanted {
            match backend.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
    };
    if tokio::time::timeout(REFUSAL_READ_TIMEOUT, fill).await.is_err() {
        warn!(declared, "Backend stalled sending a refusal body");
    }
    body.truncate(wanted);
    body
}

async fn tunnel(mut req: Request, target: &Target) -> Result<Response> {
    let mut backend = TcpStream::connect(("127.0.0.1", target.port))
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("backend on port {}: {e}", target.port)))?;
    backend
        .write_all(&request_head(req.method(), req.headers(), target))
        .await?;

    let (status, headers, leftover) = read_response_head(&mut backend).await?;
    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(port = target.port, %status, "Backend refused upgrade");
        let body = read_refusal_body(&mut backend, &headers, leftover).await;
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in headers.iter() {
            if name != header::CONTENT_LENGTH && !is_hop_by_hop(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        return Ok(response);
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let port = target.port;
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(port, error = %e, "Client upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if let Err(e) = client.write_all(&leftover).await {
                debug!(port, error = %e, "Client went away before splice");
                return;
            }
        }
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((up, down)) => debug!(port, up, down, "Tunnel closed"),
            Err(e) => debug!(port, error = %e, "Tunnel closed with error"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn target(port: u16, path: &str) -> Target {
        Target {
            port,
            path_and_query: path.to_string(),
            routing_cookie: None,
        }
    }

    #[test]
    fn test_folder_encoding() {
        let encoded = encode_folder(Path::new("/home/me/proj"));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_folder(&encoded), Some(PathBuf::from("/home/me/proj")));
        assert_eq!(decode_folder(&encode_folder(Path::new("relative"))), None);
        assert_eq!(decode_folder("!!!"), None);
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn test_request_head_rewrites_host_and_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.example.com"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://gateway.example.com"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        let head = request_head(&Method::GET, &headers, &target(7681, "/terminal/abc/ws"));
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("GET /terminal/abc/ws HTTP/1.1\r\n"));
        assert!(head.contains("host: 127.0.0.1:7681\r\n"));
        assert!(head.contains("origin: http://127.0.0.1:7681\r\n"));
        assert!(!head.contains("gateway.example.com"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_head_strips_crlf() {
        assert_eq!(strip_crlf(b"a\r\nInjected: yes"), b"aInjected: yes".to_vec());
        let mut headers = HeaderMap::new();
        headers.insert("x-note", HeaderValue::from_bytes(b"one\ttwo").unwrap());
        let head = String::from_utf8(request_head(&Method::GET, &headers, &target(1, "/"))).unwrap();
        assert_eq!(head.matches("\r\n").count(), 4);
    }

    #[test]
    fn test_parse_response_head() {
        let (status, headers) = parse_response_head(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: abc=\r\n\r\n",
        )
        .unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers["sec-websocket-accept"], "abc=");
        assert!(parse_response_head(b"garbage\r\n\r\n").is_none());
    }

    fn manager(dir: &Path) -> ProcessManager {
        use crate::binaries::{Binaries, Capability};
        let missing = || Capability::Unavailable("test".into());
        ProcessManager::new(
            &crate::config::GatewayConfig::for_tests(dir.to_path_buf()),
            std::sync::Arc::new(Binaries::new(missing(), missing(), missing(), missing())),
        )
    }

    #[test]
    fn test_editor_target_requires_running_backend() {
        let dir = tempfile::tempdir().unwrap();
        let processes = manager(dir.path());
        let encoded = encode_folder(Path::new("/tmp/proj"));
        let uri: Uri = format!("/code/{encoded}/static/app.js?v=1").parse().unwrap();
        assert!(matches!(
            editor_target(&processes, &uri, None),
            Err(GatewayError::NotFound(_))
        ));
        let uri: Uri = "/code/not-base64!/".parse().unwrap();
        assert!(matches!(
            editor_target(&processes, &uri, None),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_editor_target_keeps_escaped_path() {
        let dir = tempfile::tempdir().unwrap();
        let processes = manager(dir.path());
        processes.adopt_editor("/tmp/proj", 8123);
        let encoded = encode_folder(Path::new("/tmp/proj"));
        let uri: Uri = format!("/code/{encoded}/files/a%3Fb%2Fc%20d?x=1").parse().unwrap();

        let target = editor_target(&processes, &uri, None).unwrap();
        assert_eq!(target.port, 8123);
        assert_eq!(target.path_and_query, "/files/a%3Fb%2Fc%20d?x=1");
        assert_eq!(target.routing_cookie.as_deref(), Some(encoded.as_str()));

        let head = request_head(&Method::GET, &HeaderMap::new(), &target);
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("GET /files/a%3Fb%2Fc%20d?x=1 HTTP/1.1\r\n"));

        let bare: Uri = format!("/code/{encoded}").parse().unwrap();
        let target = editor_target(&processes, &bare, Some(&encoded)).unwrap();
        assert_eq!(target.path_and_query, "/");
        assert_eq!(target.routing_cookie, None);
    }

    #[tokio::test]
    async fn test_read_body_enforces_limit() {
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(axum::body::Bytes::from_static(b"0123")),
            Ok(axum::body::Bytes::from_static(b"4567")),
        ]);
        let body = read_body(Body::from_stream(chunks), 8).await.unwrap();
        assert_eq!(body, b"01234567".to_vec());

        let chunks = futures_util::stream::iter(vec![
            Ok::<_, std::io::Error>(axum::body::Bytes::from_static(b"0123")),
            Ok(axum::body::Bytes::from_static(b"45678")),
        ]);
        let result = read_body(Body::from_stream(chunks), 8).await;
        assert!(matches!(result, Err(GatewayError::BodyTooLarge)));
    }

    #[tokio::test]
    async fn test_refused_upgrade_is_relayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 4\r\n\r\nnope")
                .await
                .unwrap();
        });

        let req = Request::builder()
            .uri("/terminal/abc/ws")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let response = tunnel(req, &target(port, "/terminal/abc/ws")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"nope");
    }

    #[tokio::test]
    async fn test_refused_upgrade_body_split_across_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 11\r\n\r\n")
                .await
                .unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(b"login ").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(b"first").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let req = Request::builder()
            .uri("/terminal/abc/ws")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let response = tunnel(req, &target(port, "/terminal/abc/ws")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"login first");
    }

    #[tokio::test]
    async fn test_dial_failure_is_upstream_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let result = tunnel(req, &target(port, "/")).await;
        assert!(matches!(result, Err(GatewayError::UpstreamUnavailable(_))));
    }
}
