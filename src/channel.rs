//! Session channel server
//!
//! A persistent, line-delimited JSON channel over TCP. Each inbound line is
//! a method call; each outbound line is one [`SessionEvent`]. A single
//! writer task owns the socket so events from concurrent requests never
//! interleave mid-line.

use crate::session::{run_request, EventSink, Pipeline, SessionEvent, STATUS_CONNECTED};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
pub enum ClientMessage {
    ProcessNaturalLanguageQuery { question: String },
}

/// Inbound lines longer than this are discarded unless configured otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

pub struct ChannelServer {
    pipeline: Arc<Pipeline>,
    max_inflight: usize,
    max_line_bytes: usize,
}

impl ChannelServer {
    pub fn new(pipeline: Arc<Pipeline>, max_inflight: usize) -> Self {
        Self {
            pipeline,
            max_inflight: max_inflight.max(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Channel server listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(
                async move { server.handle_connection(stream, addr).await }
                    .instrument(info_span!("connection", peer = %addr)),
            );
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        info!("Client connected");
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_events(writer, rx).in_current_span());

        let sink = EventSink::new(tx);
        sink.emit(SessionEvent::Status(STATUS_CONNECTED.to_string()));

        let limiter = Arc::new(Semaphore::new(self.max_inflight));
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            let line = match read_bounded_line(&mut reader, &mut buf, self.max_line_bytes).await {
                Ok(InboundLine::Line(line)) => line,
                Ok(InboundLine::TooLong) => {
                    warn!(limit = self.max_line_bytes, "Discarded oversized message from client");
                    sink.for_request()
                        .emit(SessionEvent::Error("Message is too large.".to_string()));
                    continue;
                }
                Ok(InboundLine::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "Read from client failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<ClientMessage>(&line) {
                Ok(ClientMessage::ProcessNaturalLanguageQuery { question }) => {
                    // Waiting here stops reading from this client until a slot frees up.
                    let permit = match limiter.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let pipeline = self.pipeline.clone();
                    let request_sink = sink.for_request();
                    tokio::spawn(
                        async move {
                            run_request(pipeline, request_sink, question).await;
                            drop(permit);
                        }
                        .in_current_span(),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Unrecognized message from client");
                    sink.for_request()
                        .emit(SessionEvent::Error("Unrecognized message.".to_string()));
                }
            }
        }

        info!(%addr, "Client disconnected");
    }
}

#[derive(Debug, PartialEq)]
enum InboundLine {
    Line(String),
    TooLong,
    Closed,
}

/// Read one newline-terminated line, buffering at most `max` bytes of it.
/// The remainder of an oversized line is read and dropped in `max`-sized
/// chunks so the next line starts clean.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<InboundLine>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    buf.clear();
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(InboundLine::Closed);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(InboundLine::Line(String::from_utf8_lossy(buf).into_owned()));
    }
    if buf.len() <= max {
        // Final line without a trailing newline.
        return Ok(InboundLine::Line(String::from_utf8_lossy(buf).into_owned()));
    }

    loop {
        buf.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(InboundLine::TooLong)
}

async fn write_events(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize event");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "Client socket closed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &[u8], max: usize) -> Vec<InboundLine> {
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        let mut out = Vec::new();
        loop {
            match read_bounded_line(&mut reader, &mut buf, max).await.unwrap() {
                InboundLine::Closed => break,
                line => out.push(line),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_lines_within_limit_are_returned() {
        let lines = read_all(b"abc\r\nhello\nlast", 5).await;
        assert_eq!(
            lines,
            vec![
                InboundLine::Line("abc".to_string()),
                InboundLine::Line("hello".to_string()),
                InboundLine::Line("last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped_and_reading_resumes() {
        let mut input = vec![b'x'; 50];
        input.extend_from_slice(b"\nok\n");
        let lines = read_all(&input, 8).await;
        assert_eq!(lines, vec![InboundLine::TooLong, InboundLine::Line("ok".to_string())]);
    }

    #[tokio::test]
    async fn test_oversized_line_without_newline() {
        let lines = read_all(&[b'y'; 20], 8).await;
        assert_eq!(lines, vec![InboundLine::TooLong]);
    }

    #[test]
    fn test_parse_request() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"method":"ProcessNaturalLanguageQuery","question":"How many orders?"}"#)
                .unwrap();
        let ClientMessage::ProcessNaturalLanguageQuery { question } = msg;
        assert_eq!(question, "How many orders?");
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"method":"DropEverything"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }
}
