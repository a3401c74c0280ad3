// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding results streamed over a loopback socket.
//!
//! The run script connects once and writes one JSON object per line:
//!
//! ```text
//! {"event": "started", "id": "tests/test_a.py::TestX::test_one"}
//! {"event": "failed", "id": "...", "duration": 0.01, "message": "...", "traceback": "..."}
//! {"event": "end"}
//! ```
//!
//! Lines may arrive split across reads, may end in `\r\n`, and may be blank. A line that can't be
//! decoded is logged and dropped, and decoding carries on with the next one.

use super::{TestOutcome, duration_from_secs};
use crate::{
    errors::ParseError,
    tree::{StableId, TestStatus},
};
use bytes::{Buf, BytesMut};
use serde::Deserialize;
use std::{io, net::Ipv4Addr};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::UnboundedSender,
};
use tracing::{debug, warn};

/// A decoded message from the result stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamMessage {
    /// A test started or finished.
    Outcome(TestOutcome),

    /// The end-of-stream marker: no more results follow.
    End,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    event: WireEvent,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireEvent {
    Started,
    Passed,
    Failed,
    Skipped,
    Error,
    End,
}

impl WireEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::End => "end",
        }
    }

    fn status(self) -> Option<TestStatus> {
        match self {
            Self::Started => Some(TestStatus::Running),
            Self::Passed => Some(TestStatus::Pass),
            Self::Failed => Some(TestStatus::Fail),
            Self::Skipped => Some(TestStatus::Skip),
            Self::Error => Some(TestStatus::Error),
            Self::End => None,
        }
    }
}

/// Splits a byte stream into lines and decodes each one.
///
/// Lines longer than the decoder's limit are dropped with [`ParseError::LineTooLong`], and the
/// rest of such a line is skipped up to the next newline.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    // Bytes at the start of `buf` already known not to contain a newline.
    scanned: usize,
    max_line_len: usize,
    // Set while skipping the tail of an overlong line.
    discarding: bool,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::with_max_line_len(Self::DEFAULT_MAX_LINE_LEN)
    }
}

impl MessageDecoder {
    /// The default limit on the length of a single message line.
    pub const DEFAULT_MAX_LINE_LEN: usize = 4 * 1024 * 1024;

    /// Creates a new, empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, empty decoder that drops lines longer than `max_line_len` bytes.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line_len,
            discarding: false,
        }
    }

    /// Feeds a chunk of bytes and returns every complete message it finished.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<StreamMessage, ParseError>> {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(self.scanned + pos + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_line_len {
                messages.push(Err(self.line_too_long(line.len())));
            } else if let Some(message) = decode_line(&line) {
                messages.push(message);
            }
        }

        if self.discarding {
            self.buf.clear();
        } else if self.buf.len() > self.max_line_len {
            messages.push(Err(self.line_too_long(self.buf.len())));
            self.buf.clear();
            self.discarding = true;
        }
        self.scanned = self.buf.len();
        messages
    }

    /// Decodes whatever is left once the stream has closed, if it isn't blank.
    pub fn finish(&mut self) -> Option<Result<StreamMessage, ParseError>> {
        let rest = self.buf.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&rest)
    }

    /// Returns the number of buffered bytes not yet forming a complete line.
    pub fn pending_len(&self) -> usize {
        self.buf.remaining()
    }

    fn line_too_long(&self, len: usize) -> ParseError {
        ParseError::LineTooLong {
            len,
            max: self.max_line_len,
        }
    }
}

fn decode_line(line: &[u8]) -> Option<Result<StreamMessage, ParseError>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    let message: WireMessage = match serde_json::from_slice(line) {
        Ok(message) => message,
        Err(err) => {
            return Some(Err(ParseError::InvalidMessage {
                line: String::from_utf8_lossy(line).into_owned(),
                err,
            }));
        }
    };

    let Some(status) = message.event.status() else {
        return Some(Ok(StreamMessage::End));
    };
    let Some(id) = message.id.filter(|id| !id.is_empty()) else {
        return Some(Err(ParseError::MissingId {
            event: message.event.as_str(),
        }));
    };
    Some(Ok(StreamMessage::Outcome(TestOutcome {
        id: StableId::new(id),
        status,
        duration: message.duration.and_then(duration_from_secs),
        message: message.message,
        traceback: message.traceback,
        line: None,
    })))
}

/// How a result stream ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamEnd {
    /// The end-of-stream marker was received.
    Ended,

    /// The connection closed (or failed) before the end-of-stream marker.
    Disconnected,

    /// The test process never connected.
    NeverConnected,
}

/// A loopback listener that accepts a single result connection.
#[derive(Debug)]
pub struct ResultListener {
    listener: TcpListener,
    port: u16,
}

impl ResultListener {
    /// Binds a listener to an ephemeral port on `127.0.0.1`.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Returns the port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accepts exactly one connection, then stops listening.
    pub async fn accept_one(self) -> io::Result<TcpStream> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("result stream connected from {addr}");
        Ok(stream)
    }
}

/// The state of a [`StreamIngest`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IngestState {
    Waiting,
    Connected,
    Ended,
    Disconnected,
}

/// Reads a result stream and forwards outcomes as they arrive.
///
/// Outcomes are sent as soon as each line is decoded, so if ingestion is cancelled partway
/// through, everything received so far has already been delivered.
#[derive(Debug)]
pub struct StreamIngest {
    decoder: MessageDecoder,
    state: IngestState,
    outcomes: usize,
    terminal: usize,
    parse_errors: usize,
}

impl Default for StreamIngest {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIngest {
    const READ_SIZE: usize = 8 * 1024;

    /// Creates a new ingest that hasn't seen a connection yet.
    pub fn new() -> Self {
        Self {
            decoder: MessageDecoder::new(),
            state: IngestState::Waiting,
            outcomes: 0,
            terminal: 0,
            parse_errors: 0,
        }
    }

    /// Accepts one connection on `listener` and ingests it.
    pub async fn accept_and_ingest(
        &mut self,
        listener: ResultListener,
        sink: &UnboundedSender<TestOutcome>,
    ) -> StreamEnd {
        match listener.accept_one().await {
            Ok(stream) => self.ingest(stream, sink).await,
            Err(err) => {
                warn!("failed to accept result connection: {err}");
                self.end()
            }
        }
    }

    /// Reads `reader` to completion (or to the end-of-stream marker), forwarding outcomes to
    /// `sink`. Messages after the marker are ignored.
    pub async fn ingest<R>(
        &mut self,
        mut reader: R,
        sink: &UnboundedSender<TestOutcome>,
    ) -> StreamEnd
    where
        R: AsyncRead + Unpin,
    {
        self.state = IngestState::Connected;
        let mut chunk = vec![0u8; Self::READ_SIZE];
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(n) => n,
                Err(err) => {
                    warn!("error reading result stream: {err}");
                    self.state = IngestState::Disconnected;
                    return self.end();
                }
            };
            if n == 0 {
                if let Some(message) = self.decoder.finish() {
                    self.handle(message, sink);
                }
                if self.state != IngestState::Ended {
                    self.state = IngestState::Disconnected;
                }
                return self.end();
            }
            for message in self.decoder.decode(&chunk[..n]) {
                self.handle(message, sink);
                if self.state == IngestState::Ended {
                    return self.end();
                }
            }
        }
    }

    fn handle(
        &mut self,
        message: Result<StreamMessage, ParseError>,
        sink: &UnboundedSender<TestOutcome>,
    ) {
        if self.state == IngestState::Ended {
            return;
        }
        match message {
            Ok(StreamMessage::Outcome(outcome)) => {
                self.outcomes += 1;
                if outcome.is_terminal() {
                    self.terminal += 1;
                }
                // The receiver only goes away if the run is being torn down.
                let _ = sink.send(outcome);
            }
            Ok(StreamMessage::End) => {
                debug!("result stream ended after {} messages", self.outcomes);
                self.state = IngestState::Ended;
            }
            Err(err) => {
                self.parse_errors += 1;
                warn!("dropping result message: {err}");
            }
        }
    }

    /// Returns how the stream ended, or would have ended if it were cut off now.
    pub fn end(&self) -> StreamEnd {
        match self.state {
            IngestState::Waiting => StreamEnd::NeverConnected,
            IngestState::Connected | IngestState::Disconnected => StreamEnd::Disconnected,
            IngestState::Ended => StreamEnd::Ended,
        }
    }

    /// Returns the number of terminal outcomes forwarded so far.
    pub fn terminal_outcomes(&self) -> usize {
        self.terminal
    }

    /// Returns the number of messages that couldn't be decoded.
    pub fn parse_errors(&self) -> usize {
        self.parse_errors
    }
}
