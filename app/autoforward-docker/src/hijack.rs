//! Hijacked attach/exec sessions.
//!
//! A hijacked request runs over its own raw connection to the remote engine.
//! The response head is read with a [`LineScanner`] so that no byte of the
//! multiplexed stream that follows is lost; the session then owns the socket
//! until the frame pump ends.

use crate::error::{ProxyError, Result};
use crate::frame::{pump_frames, PumpStats};
use crate::remote::{RemoteConnector, RemoteStream};
use crate::scanner::LineScanner;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Chain, ReadHalf, WriteHalf};

/// Content type of a raw (hijacked) stream.
pub const RAW_STREAM: &str = "application/vnd.docker.raw-stream";

/// Content type newer engines use for multiplexed hijacked streams.
pub const MULTIPLEXED_STREAM: &str = "application/vnd.docker.multiplexed-stream";

/// Serializes a request as raw HTTP/1.1 bytes.
///
/// `Host` is replaced by `host`; `Content-Length` always reflects `body`.
#[must_use]
pub fn serialize_request(
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    host: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{method} {path_and_query} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());

    for (name, value) in headers {
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
        {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

/// Whether a response starts a multiplexed raw stream.
#[must_use]
pub fn is_raw_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            let ct = ct.trim();
            ct.starts_with(RAW_STREAM) || ct.starts_with(MULTIPLEXED_STREAM)
        })
}

/// Opens hijacked sessions against the remote engine.
#[derive(Debug, Clone)]
pub struct ConnectionHijacker {
    connector: RemoteConnector,
    read_timeout: Duration,
}

impl ConnectionHijacker {
    /// Creates a hijacker. `read_timeout` bounds each read of the response head.
    #[must_use]
    pub const fn new(connector: RemoteConnector, read_timeout: Duration) -> Self {
        Self {
            connector,
            read_timeout,
        }
    }

    /// Sends the request on a dedicated connection and reads the response
    /// head (and body, for non-stream responses).
    ///
    /// # Errors
    ///
    /// - [`ProxyError::Connectivity`] if the remote cannot be reached.
    /// - [`ProxyError::Protocol`] for a malformed response head.
    pub async fn open(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<UpgradeSession> {
        let mut stream = self.connector.connect().await?;
        let host = self.connector.endpoint().host_header();
        let request = serialize_request(method, path_and_query, headers, &host, body);
        stream.write_all(&request).await?;
        stream.flush().await?;

        let (read_half, writer) = tokio::io::split(stream);
        let mut scanner = LineScanner::new(read_half, self.read_timeout);

        let status_line = scanner
            .next_line()
            .await?
            .ok_or_else(|| ProxyError::Protocol("remote closed before status line".to_string()))?;
        let status = parse_status_line(&status_line)?;

        let mut response_headers = HeaderMap::new();
        loop {
            let line = scanner.next_line().await?.ok_or_else(|| {
                ProxyError::Protocol("remote closed inside response headers".to_string())
            })?;
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(&line)?;
            response_headers.append(name, value);
        }

        let upgrade = status == StatusCode::SWITCHING_PROTOCOLS || is_raw_stream(&response_headers);

        let body = if upgrade {
            Bytes::new()
        } else if is_chunked(&response_headers) {
            scanner.read_chunked_body().await?
        } else {
            match content_length(&response_headers) {
                Some(0) => Bytes::new(),
                Some(len) => scanner.read_body(len).await?,
                None => Bytes::copy_from_slice(scanner.buffered()),
            }
        };

        let (read_half, leftover) = scanner.into_parts();
        let leftover = if upgrade { leftover } else { Bytes::new() };

        Ok(UpgradeSession {
            status,
            headers: response_headers,
            body,
            upgrade,
            reader: Cursor::new(leftover).chain(read_half),
            writer,
        })
    }
}

/// One hijacked request/response cycle.
///
/// Dropping the session closes the remote connection.
pub struct UpgradeSession {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    upgrade: bool,
    reader: Chain<Cursor<Bytes>, ReadHalf<RemoteStream>>,
    writer: WriteHalf<RemoteStream>,
}

impl UpgradeSession {
    /// Response status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers as received.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the response switched to a raw stream.
    #[must_use]
    pub const fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Buffered body of a non-stream response.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Headers to relay to the client. Framing headers are dropped unless
    /// the response is a protocol switch; the server recomputes them.
    #[must_use]
    pub fn relay_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if self.status != StatusCode::SWITCHING_PROTOCOLS {
            headers.remove(header::CONTENT_LENGTH);
            headers.remove(header::TRANSFER_ENCODING);
        }
        headers
    }

    /// Pumps frames from the remote into `client` until the stream ends.
    ///
    /// # Errors
    ///
    /// See [`pump_frames`].
    pub async fn pump<W: AsyncWrite + Unpin>(mut self, client: &mut W) -> Result<PumpStats> {
        pump_frames(&mut self.reader, client).await
    }

    /// Pumps frames to an upgraded client connection while relaying its
    /// stdin to the remote. The session ends when the remote stream ends.
    ///
    /// # Errors
    ///
    /// See [`pump_frames`].
    pub async fn relay<C>(self, client: C) -> Result<PumpStats>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Self {
            mut reader,
            mut writer,
            ..
        } = self;
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let pump = pump_frames(&mut reader, &mut client_write);
        tokio::pin!(pump);

        let stdin = async {
            let copied = tokio::io::copy(&mut client_read, &mut writer).await;
            let _ = writer.shutdown().await;
            copied
        };

        tokio::select! {
            result = &mut pump => result,
            copied = stdin => {
                if let Err(e) = copied {
                    tracing::debug!("stdin relay ended: {}", e);
                }
                pump.await
            }
        }
    }
}

impl std::fmt::Debug for UpgradeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeSession")
            .field("status", &self.status)
            .field("upgrade", &self.upgrade)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Logs how a hijacked session ended.
pub fn log_session_end(target: &str, result: &Result<PumpStats>) {
    match result {
        Ok(stats) => tracing::debug!(
            target_url = %target,
            frames = stats.frames,
            bytes = stats.bytes,
            "hijacked session ended"
        ),
        Err(e @ ProxyError::Connectivity(_)) => {
            tracing::debug!(target_url = %target, "hijacked session disconnected: {}", e);
        }
        Err(e) => tracing::warn!(target_url = %target, "hijacked session aborted: {}", e),
    }
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Protocol("status line is not UTF-8".to_string()))?;
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::Protocol(format!("invalid status line {text:?}")));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ProxyError::Protocol(format!("invalid status line {text:?}")))
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
    let invalid =
        || ProxyError::Protocol(format!("invalid header {:?}", String::from_utf8_lossy(line)));
    let colon = line.iter().position(|&b| b == b':').ok_or_else(invalid)?;
    let name = HeaderName::from_bytes(line[..colon].trim_ascii()).map_err(|_| invalid())?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).map_err(|_| invalid())?;
    Ok((name, value))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, StreamType, FRAME_HEADER_LEN};
    use crate::remote::RemoteEndpoint;
    use tokio::net::TcpListener;

    async fn fake_remote(response: Vec<u8>) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(&response).await.unwrap();
            request
        });
        (port, handle)
    }

    fn hijacker(port: u16) -> ConnectionHijacker {
        let endpoint = RemoteEndpoint::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        ConnectionHijacker::new(
            RemoteConnector::new(endpoint, None, Duration::from_secs(2)),
            Duration::from_millis(500),
        )
    }

    fn frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
        let mut out = FrameHeader {
            stream,
            len: u32::try_from(payload.len()).unwrap(),
        }
        .encode()
        .to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn serializes_request_with_host_and_length() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let raw = serialize_request(
            &Method::POST,
            "/v1.41/exec/abc/start",
            &headers,
            "10.0.0.5:2375",
            b"{}",
        );
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("POST /v1.41/exec/abc/start HTTP/1.1\r\nHost: 10.0.0.5:2375\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("x-multi: a\r\nx-multi: b\r\n"));
        assert!(!text.contains("localhost:8080"));
        assert!(text.ends_with("Content-Length: 2\r\n\r\n{}"));
    }

    #[test]
    fn status_and_header_parsing() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 101 UPGRADED").unwrap(),
            StatusCode::SWITCHING_PROTOCOLS
        );
        assert!(parse_status_line(b"garbage").is_err());

        let (name, value) = parse_header_line(b"Content-Type:  application/json ").unwrap();
        assert_eq!(name, header::CONTENT_TYPE);
        assert_eq!(value, "application/json");
        assert!(parse_header_line(b"no colon here").is_err());
    }

    #[test]
    fn raw_stream_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_raw_stream(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(RAW_STREAM));
        assert!(is_raw_stream(&headers));
    }

    #[tokio::test]
    async fn upgrade_session_relays_leftover_and_frames() {
        let mut response =
            b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n"
                .to_vec();
        let mut frames = frame(StreamType::Stdout, b"hello\n");
        frames.extend(frame(StreamType::Stderr, &[b'e'; 3000]));
        response.extend_from_slice(&frames);

        let (port, remote) = fake_remote(response).await;
        let session = hijacker(port)
            .open(&Method::POST, "/v1.41/exec/abc/start", &HeaderMap::new(), b"{}")
            .await
            .unwrap();

        assert_eq!(session.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert!(session.is_upgrade());
        assert!(session.relay_headers().contains_key(header::UPGRADE));

        let mut client = Vec::new();
        let stats = session.pump(&mut client).await.unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.bytes as usize, 6 + 3000 + 2 * FRAME_HEADER_LEN);
        assert_eq!(client, frames);

        let request = remote.await.unwrap();
        assert!(request.starts_with(b"POST /v1.41/exec/abc/start HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn non_stream_response_is_buffered() {
        let body = br#"{"message":"No such exec instance: abc"}"#;
        let mut response = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);

        let (port, _remote) = fake_remote(response).await;
        let session = hijacker(port)
            .open(&Method::POST, "/exec/abc/start", &HeaderMap::new(), b"{}")
            .await
            .unwrap();

        assert_eq!(session.status(), StatusCode::NOT_FOUND);
        assert!(!session.is_upgrade());
        assert_eq!(session.body().as_ref(), body);
        assert!(!session.relay_headers().contains_key(header::CONTENT_LENGTH));
    }

    #[tokio::test]
    async fn framing_error_ends_session() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\n".to_vec();
        response.extend(
            FrameHeader {
                stream: StreamType::Stdout,
                len: 50,
            }
            .encode(),
        );
        response.extend_from_slice(b"truncated");

        let (port, _remote) = fake_remote(response).await;
        let session = hijacker(port)
            .open(&Method::POST, "/containers/web/attach", &HeaderMap::new(), b"")
            .await
            .unwrap();
        assert!(session.is_upgrade());

        let mut client = Vec::new();
        let result = session.pump(&mut client).await;
        assert!(matches!(
            result,
            Err(ProxyError::Framing {
                expected: 50,
                received: 9
            })
        ));
    }

    #[tokio::test]
    async fn unreachable_remote_is_connectivity_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = hijacker(port)
            .open(&Method::POST, "/exec/abc/start", &HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connectivity(_)));
    }
}
