// src/transport/line_reader.rs

//! Incremental, cancelable line extraction shared by every transport.

use std::fmt;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::{CommunicatorEvent, DEFAULT_MAX_LINE_BYTES};

/// Where a line stream comes from; decides which event a line becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
    Socket,
}

impl StreamSource {
    fn event(self, line: String) -> CommunicatorEvent {
        match self {
            StreamSource::Stdout | StreamSource::Socket => CommunicatorEvent::Output(line),
            StreamSource::Stderr => CommunicatorEvent::Error(line),
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
            StreamSource::Socket => "socket",
        };
        f.write_str(s)
    }
}

/// A lazy, non-restartable sequence of lines read from `R`.
///
/// Once it has returned `Ok(None)` or a read error it stays finished. Bytes
/// are decoded as UTF-8, replacing invalid sequences.
///
/// Lines longer than the limit are discarded up to their terminator and
/// reported as [`io::ErrorKind::InvalidData`]; the stream stays usable after
/// such an error.
#[derive(Debug)]
pub struct LineStream<R> {
    reader: BufReader<R>,
    cancel: CancellationToken,
    buf: Vec<u8>,
    max_line: usize,
    finished: bool,
}

enum Frame {
    Line,
    Eof,
    TooLong(usize),
}

impl<R: AsyncRead + Unpin> LineStream<R> {
    pub fn new(reader: R, cancel: CancellationToken) -> Self {
        Self {
            reader: BufReader::new(reader),
            cancel,
            buf: Vec::new(),
            max_line: DEFAULT_MAX_LINE_BYTES,
            finished: false,
        }
    }

    /// Cap a single line at `max_line` bytes, not counting the trailing `\n`.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Read the next line without its terminator.
    ///
    /// Returns `Ok(None)` at end of stream or once cancellation is requested.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let Self {
            reader,
            cancel,
            buf,
            max_line,
            finished,
        } = self;

        if *finished {
            return Ok(None);
        }
        buf.clear();

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            read = read_frame(reader, buf, *max_line) => Some(read),
        };

        match read {
            None | Some(Ok(Frame::Eof)) => {
                *finished = true;
                Ok(None)
            }
            Some(Ok(Frame::Line)) => Ok(Some(decode_line(buf))),
            Some(Ok(Frame::TooLong(len))) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line of {len} bytes exceeds the {max_line} byte limit; discarded"),
            )),
            Some(Err(e)) => {
                *finished = true;
                Err(e)
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// Fill `buf` with one line, or skip it entirely once it outgrows `max_line`.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
    max_line: usize,
) -> io::Result<Frame> {
    let mut dropped: Option<usize> = None;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match dropped {
                Some(len) => Frame::TooLong(len),
                None if buf.is_empty() => Frame::Eof,
                None => Frame::Line,
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let used = newline.map_or(available.len(), |i| i + 1);
        let content = used - usize::from(newline.is_some());

        if let Some(len) = &mut dropped {
            *len += content;
        } else if buf.len() + content > max_line {
            dropped = Some(buf.len() + content);
            buf.clear();
        } else {
            buf.extend_from_slice(&available[..used]);
        }
        reader.consume(used);

        if newline.is_some() {
            return Ok(match dropped {
                Some(len) => Frame::TooLong(len),
                None => Frame::Line,
            });
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Errors that just mean the other side went away.
fn is_peer_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Forward every line of `lines` to `events` until end of stream,
/// cancellation, or the receiver going away.
///
/// Unexpected read errors are reported as [`CommunicatorEvent::Error`] unless
/// cancellation was already requested.
pub async fn pump_lines<R: AsyncRead + Unpin>(
    mut lines: LineStream<R>,
    source: StreamSource,
    skip_blank: bool,
    events: mpsc::Sender<CommunicatorEvent>,
) {
    let cancel = lines.cancel.clone();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if skip_blank && line.trim().is_empty() {
                    continue;
                }
                trace!(%source, "{}", line);

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = events.send(source.event(line)) => sent,
                };
                if sent.is_err() {
                    debug!(%source, "event receiver dropped; stopping reader");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(%source, error = %e, "oversized line");
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = events.send(CommunicatorEvent::Error(format!("{source}: {e}"))) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(e) if is_peer_closed(&e) => {
                debug!(%source, error = %e, "stream closed by peer");
                break;
            }
            Err(e) => {
                if !lines.is_cancelled() {
                    warn!(%source, error = %e, "error reading stream");
                    let _ = events
                        .send(CommunicatorEvent::Error(format!(
                            "error reading {source}: {e}"
                        )))
                        .await;
                }
                break;
            }
        }
    }

    debug!(%source, "reader finished");
}

/// Cancellation scope and task set for the background readers of one
/// communicator.
///
/// This scope is owned by the transport and is independent of the caller's
/// cancellation token; `stop` always cancels it.
#[derive(Debug, Clone)]
pub struct ReaderScope {
    cancel: CancellationToken,
    tracker: TaskTracker,
    max_line: usize,
}

impl Default for ReaderScope {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

impl ReaderScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            max_line,
        }
    }

    /// Spawn a reader that pumps lines from `reader` into `events`.
    pub fn spawn_reader<R>(
        &self,
        reader: R,
        source: StreamSource,
        skip_blank: bool,
        events: mpsc::Sender<CommunicatorEvent>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = LineStream::new(reader, self.cancel.clone()).with_max_line(self.max_line);
        self.tracker.spawn(pump_lines(lines, source, skip_blank, events));
    }

    /// No more readers will be added; [`ReaderScope::drained`] can complete.
    pub fn seal(&self) {
        self.tracker.close();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Resolves once the scope is sealed and every reader has finished.
    pub async fn drained(&self) {
        self.tracker.wait().await;
    }
}
