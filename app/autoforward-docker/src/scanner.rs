//! Incremental CRLF line scanner over a raw socket.
//!
//! The scanner pulls fixed-size reads from the underlying reader, yields
//! complete CRLF-terminated lines and carries any partial line over to the
//! next read. A read timeout or end-of-stream exhausts the scanner; bytes
//! still buffered at that point stay available through [`LineScanner::into_parts`].

use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of a single read from the socket.
pub const READ_CHUNK: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No complete line is buffered; the next call reads more.
    Buffering,
    /// At least one complete line is buffered.
    LineReady,
    /// The reader timed out or reached end-of-stream.
    Exhausted,
}

/// Pull-based, restartable line scanner.
#[derive(Debug)]
pub struct LineScanner<R> {
    reader: R,
    buf: BytesMut,
    state: ScanState,
    read_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LineScanner<R> {
    /// Creates a scanner; `read_timeout` bounds every individual read.
    pub fn new(reader: R, read_timeout: Duration) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            state: ScanState::Buffering,
            read_timeout,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ScanState {
        self.state
    }

    /// Bytes read from the socket but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the next line without its CRLF, or `None` once the scanner is
    /// exhausted and no complete line remains.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Connectivity`] if a read fails.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let mut line = self.buf.split_to(pos + CRLF.len());
                line.truncate(pos);
                self.refresh_state();
                return Ok(Some(line.freeze()));
            }
            if self.state == ScanState::Exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Performs one read of up to [`READ_CHUNK`] bytes and returns how many
    /// bytes arrived. Zero means the scanner is now exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Connectivity`] if the read fails.
    pub async fn fill(&mut self) -> Result<usize> {
        if self.state == ScanState::Exhausted {
            return Ok(0);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = match tokio::time::timeout(self.read_timeout, self.reader.read(&mut chunk)).await
        {
            Ok(read) => read?,
            Err(_) => 0,
        };

        if n == 0 {
            self.state = ScanState::Exhausted;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
            self.refresh_state();
        }
        Ok(n)
    }

    /// Takes exactly `len` body bytes, reading more while they have not all
    /// arrived. Returns fewer bytes only if the scanner is exhausted first.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Connectivity`] if a read fails.
    pub async fn read_body(&mut self, len: usize) -> Result<Bytes> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                break;
            }
        }
        let take = len.min(self.buf.len());
        let body = self.buf.split_to(take).freeze();
        self.refresh_state();
        Ok(body)
    }

    /// Reads a `Transfer-Encoding: chunked` body and returns it decoded.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for a malformed chunk size line.
    pub async fn read_chunked_body(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let Some(size_line) = self.next_line().await? else {
                break;
            };
            let size_str = String::from_utf8_lossy(&size_line);
            let size_str = size_str.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_str, 16)
                .map_err(|_| ProxyError::Protocol(format!("invalid chunk size {size_str:?}")))?;

            if size == 0 {
                // Trailers end with an empty line.
                while let Some(line) = self.next_line().await? {
                    if line.is_empty() {
                        break;
                    }
                }
                break;
            }

            let chunk = self.read_body(size).await?;
            let complete = chunk.len() == size;
            body.extend_from_slice(&chunk);
            if !complete {
                break;
            }
            self.next_line().await?;
        }
        Ok(body.freeze())
    }

    /// Returns the reader and the unconsumed bytes.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.reader, self.buf.freeze())
    }

    fn refresh_state(&mut self) {
        if self.state == ScanState::Exhausted {
            return;
        }
        self.state = if find_crlf(&self.buf).is_some() {
            ScanState::LineReady
        } else {
            ScanState::Buffering
        };
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn yields_lines_and_keeps_remainder() {
        let data: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut scanner = LineScanner::new(data, TIMEOUT);

        assert_eq!(scanner.next_line().await.unwrap().unwrap(), "HTTP/1.1 200 OK");
        assert_eq!(scanner.state(), ScanState::LineReady);
        assert_eq!(
            scanner.next_line().await.unwrap().unwrap(),
            "Content-Length: 2"
        );
        assert_eq!(scanner.next_line().await.unwrap().unwrap(), "");
        assert_eq!(scanner.state(), ScanState::Buffering);
        assert_eq!(scanner.buffered(), b"ok");

        let (_, rest) = scanner.into_parts();
        assert_eq!(rest, "ok");
    }

    #[tokio::test]
    async fn lines_split_across_reads() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut scanner = LineScanner::new(rx, Duration::from_secs(2));

        let writer = tokio::spawn(async move {
            tx.write_all(b"HTTP/1.1 1").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(b"01 UPGRADED\r").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(b"\nUpgrade: tcp\r\n").await.unwrap();
            tx
        });

        assert_eq!(
            scanner.next_line().await.unwrap().unwrap(),
            "HTTP/1.1 101 UPGRADED"
        );
        assert_eq!(scanner.next_line().await.unwrap().unwrap(), "Upgrade: tcp");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_exhausts_scanner() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut scanner = LineScanner::new(rx, Duration::from_millis(50));

        assert!(scanner.next_line().await.unwrap().is_none());
        assert_eq!(scanner.state(), ScanState::Exhausted);
        assert_eq!(scanner.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_not_yielded() {
        let data: &[u8] = b"complete\r\npartial";
        let mut scanner = LineScanner::new(data, TIMEOUT);

        assert_eq!(scanner.next_line().await.unwrap().unwrap(), "complete");
        assert!(scanner.next_line().await.unwrap().is_none());
        assert_eq!(scanner.buffered(), b"partial");
    }

    #[tokio::test]
    async fn read_body_waits_for_declared_length() {
        let body = vec![b'x'; READ_CHUNK * 3];
        let mut data = b"\r\n".to_vec();
        data.extend_from_slice(&body);
        let mut scanner = LineScanner::new(data.as_slice(), TIMEOUT);

        assert_eq!(scanner.next_line().await.unwrap().unwrap(), "");
        let read = scanner.read_body(body.len()).await.unwrap();
        assert_eq!(read.len(), body.len());
    }

    #[tokio::test]
    async fn read_body_stops_when_exhausted() {
        let data: &[u8] = b"short";
        let mut scanner = LineScanner::new(data, TIMEOUT);
        let read = scanner.read_body(100).await.unwrap();
        assert_eq!(read, "short");
        assert_eq!(scanner.state(), ScanState::Exhausted);
    }

    #[tokio::test]
    async fn decodes_chunked_body() {
        let data: &[u8] = b"5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\n\r\n";
        let mut scanner = LineScanner::new(data, TIMEOUT);
        assert_eq!(scanner.read_chunked_body().await.unwrap(), "hello, world");
    }

    #[tokio::test]
    async fn rejects_bad_chunk_size() {
        let data: &[u8] = b"zz\r\nhello\r\n";
        let mut scanner = LineScanner::new(data, TIMEOUT);
        assert!(matches!(
            scanner.read_chunked_body().await,
            Err(ProxyError::Protocol(_))
        ));
    }
}
