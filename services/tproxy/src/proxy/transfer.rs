//! Byte-sending helpers and file transfer.
//!
//! - [`send_data`] writes a [`Payload`] to any async writer
//! - [`ClientSocket::send_file`] streams a file window to the client socket,
//!   using `sendfile(2)` for TCP sockets on Linux

use std::fmt;
use std::fs::File;
use std::io::{self, SeekFrom};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite,
    AsyncWriteExt,
};
use tokio::net::TcpStream;

/// A seekable, line-readable source (an in-memory cursor, a buffered file).
pub trait StreamSource: AsyncBufRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncBufRead + AsyncSeek + Send + Sync + Unpin> StreamSource for T {}

/// Bytes to send to a socket.
pub enum Payload {
    /// A contiguous value, sent in one write.
    Bytes(Bytes),
    /// Chunks sent one after another, in order.
    Chunks(Vec<Bytes>),
    /// A stream rewound to its start, then sent line by line.
    Stream(Box<dyn StreamSource>),
}

impl Payload {
    pub fn stream(source: impl StreamSource + 'static) -> Self {
        Payload::Stream(Box::new(source))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Payload::Chunks(chunks) => f.debug_tuple("Chunks").field(chunks).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Bytes(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Bytes(Bytes::from(text))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl From<Vec<Bytes>> for Payload {
    fn from(chunks: Vec<Bytes>) -> Self {
        Payload::Chunks(chunks)
    }
}

/// Send a payload to `sink` and flush it.
pub async fn send_data<W>(sink: &mut W, payload: Payload) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match payload {
        Payload::Bytes(bytes) => sink.write_all(&bytes).await?,
        Payload::Chunks(chunks) => {
            for chunk in chunks {
                sink.write_all(&chunk).await?;
            }
        }
        Payload::Stream(mut source) => {
            // Not every source can seek; those are sent from where they are.
            let _ = source.seek(SeekFrom::Start(0)).await;

            let mut line = Vec::new();
            loop {
                line.clear();
                if source.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                sink.write_all(&line).await?;
            }
        }
    }
    sink.flush().await
}

/// Copy `count` bytes of `file` starting at `offset` through a userspace buffer.
pub async fn copy_file_window<W>(sink: &mut W, file: File, offset: u64, count: u64) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = tokio::fs::File::from_std(file);
    file.seek(SeekFrom::Start(offset)).await?;
    let mut window = file.take(count);
    let sent = tokio::io::copy(&mut window, sink).await?;
    sink.flush().await?;
    Ok(sent)
}

/// The client side of a session.
#[async_trait]
pub trait ClientSocket: AsyncRead + AsyncWrite + Unpin + Send {
    /// Stream `count` bytes of `file` starting at `offset` to this socket.
    ///
    /// Returns the number of bytes sent, which is short only if the file ends first.
    async fn send_file(&mut self, file: File, offset: u64, count: u64) -> io::Result<u64> {
        copy_file_window(self, file, offset, count).await
    }
}

#[async_trait]
impl ClientSocket for TcpStream {
    #[cfg(target_os = "linux")]
    async fn send_file(&mut self, file: File, offset: u64, count: u64) -> io::Result<u64> {
        zero_copy::send_file(self, &file, offset, count).await
    }
}

#[async_trait]
impl ClientSocket for tokio::io::DuplexStream {}

#[cfg(target_os = "linux")]
mod zero_copy {
    use std::fs::File;
    use std::io;

    use nix::libc::off_t;
    use nix::sys::sendfile::sendfile;
    use tokio::io::Interest;
    use tokio::net::TcpStream;

    /// Upper bound for a single sendfile(2) call.
    const MAX_CHUNK: u64 = 1 << 20;

    pub(super) async fn send_file(
        stream: &TcpStream,
        file: &File,
        offset: u64,
        count: u64,
    ) -> io::Result<u64> {
        let mut position = off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file offset out of range"))?;
        let mut sent = 0u64;

        while sent < count {
            let chunk = usize::try_from((count - sent).min(MAX_CHUNK)).unwrap_or(usize::MAX);
            stream.writable().await?;

            let result = stream.try_io(Interest::WRITABLE, || {
                sendfile(stream, file, Some(&mut position), chunk).map_err(io::Error::from)
            });

            match result {
                // End of file.
                Ok(0) => break,
                Ok(n) => sent += n as u64,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::BufReader;

    /// Writer that records every write call it receives.
    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<Vec<u8>>,
    }

    impl AsyncWrite for RecordingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_contiguous_payload_is_one_write() {
        let mut sink = RecordingSink::default();
        send_data(&mut sink, Payload::from("HTTP/1.0 200 OK\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(sink.writes, vec![b"HTTP/1.0 200 OK\r\n\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_chunks_sent_in_order() {
        let mut sink = RecordingSink::default();
        let chunks = vec![
            Bytes::from_static(b"AB"),
            Bytes::from_static(b"CD"),
            Bytes::from_static(b"E"),
        ];
        send_data(&mut sink, Payload::Chunks(chunks)).await.unwrap();
        assert_eq!(sink.writes.concat(), b"ABCDE");
        assert_eq!(sink.writes.len(), 3);
    }

    #[tokio::test]
    async fn test_stream_rewound_and_sent_by_line() {
        let mut cursor = Cursor::new(b"line one\nline two\nrest".to_vec());
        cursor.set_position(5);

        let mut sink = RecordingSink::default();
        send_data(&mut sink, Payload::stream(BufReader::new(cursor)))
            .await
            .unwrap();

        assert_eq!(
            sink.writes,
            vec![
                b"line one\n".to_vec(),
                b"line two\n".to_vec(),
                b"rest".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_copy_file_window() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789abcdefghij").unwrap();

        let mut out = Vec::new();
        let sent = copy_file_window(&mut out, file, 10, 5).await.unwrap();
        assert_eq!(sent, 5);
        assert_eq!(out, b"abcde");
    }

    #[tokio::test]
    async fn test_duplex_send_file_stops_at_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"short").unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = client.send_file(file, 2, 100).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(sent, 3);
        assert_eq!(received, b"ort");
    }
}
