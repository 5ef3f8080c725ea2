//! Record transport between the services and their streams.
//!
//! Streams are newline-delimited JSON: one record per line. A source yields one record per
//! poll, or reports that nothing arrived within the read timeout. A sink acknowledges each
//! record before the next one is sent, so at most one record is in flight.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use enum_dispatch::enum_dispatch;
use thiserror::Error;
use tracing::{debug, warn};

/// Path argument selecting stdin or stdout.
pub const STDIO: &str = "-";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("record rejected by sink: {0}")]
    Rejected(String),
    #[error("send failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransportError>,
    },
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    Record(Vec<u8>),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The stream ended.
    Closed,
}

pub trait RecordSource {
    /// Wait up to `timeout` for the next record.
    fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError>;
}

/// Line-delimited source fed by a background reader thread.
#[derive(Debug)]
pub struct LineSource {
    lines: Receiver<io::Result<Vec<u8>>>,
}

impl LineSource {
    pub fn spawn<R>(reader: R) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1024);
        thread::Builder::new()
            .name("line-reader".to_string())
            .spawn(move || {
                let mut reader = reader;
                loop {
                    let mut line = Vec::new();
                    let read = reader.read_until(b'\n', &mut line);
                    let done = matches!(read, Ok(0) | Err(_));
                    let item = read.map(|_| {
                        while matches!(line.last(), Some(b'\n' | b'\r')) {
                            line.pop();
                        }
                        line
                    });
                    if matches!(item, Ok(ref line) if line.is_empty()) && done {
                        break;
                    }
                    if tx.send(item).is_err() || done {
                        break;
                    }
                }
                debug!("line reader finished");
            })?;
        Ok(Self { lines: rx })
    }

    /// Read from stdin for [`STDIO`], otherwise from the file at `target`.
    pub fn open(target: &str) -> io::Result<Self> {
        if target == STDIO {
            Self::spawn(BufReader::new(io::stdin()))
        } else {
            Self::spawn(BufReader::new(File::open(Path::new(target))?))
        }
    }
}

impl RecordSource for LineSource {
    fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError> {
        match self.lines.recv_timeout(timeout) {
            Ok(Ok(line)) if line.iter().all(u8::is_ascii_whitespace) => Ok(Polled::Idle),
            Ok(Ok(line)) => Ok(Polled::Record(line)),
            Ok(Err(err)) => Err(TransportError::Io(err)),
            Err(RecvTimeoutError::Timeout) => Ok(Polled::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Polled::Closed),
        }
    }
}

/// In-memory source replaying a fixed script of polls, then closing.
#[derive(Debug, Default)]
pub struct MemorySource {
    script: VecDeque<Polled>,
}

impl MemorySource {
    pub fn new<I, R>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Vec<u8>>,
    {
        Self {
            script: records.into_iter().map(|r| Polled::Record(r.into())).collect(),
        }
    }

    pub fn push(&mut self, polled: Polled) {
        self.script.push_back(polled);
    }
}

impl RecordSource for MemorySource {
    fn poll(&mut self, _timeout: Duration) -> Result<Polled, TransportError> {
        Ok(self.script.pop_front().unwrap_or(Polled::Closed))
    }
}

#[enum_dispatch]
#[derive(Debug)]
pub enum OutputSink {
    Stdout(LineSink<io::Stdout>),
    File(LineSink<BufWriter<File>>),
    Memory(MemorySink),
}

/// Destination of emitted summaries.
#[enum_dispatch(OutputSink)]
pub trait RecordSink {
    /// Deliver one record; returns once the record is acknowledged.
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

impl OutputSink {
    /// Write to stdout for [`STDIO`], otherwise create the file at `target`.
    pub fn open(target: &str) -> io::Result<Self> {
        if target == STDIO {
            Ok(LineSink::new(io::stdout()).into())
        } else {
            let file = File::create(Path::new(target))?;
            Ok(LineSink::new(BufWriter::new(file)).into())
        }
    }
}

/// Writes one record per line and flushes after each record.
#[derive(Debug)]
pub struct LineSink<W> {
    writer: W,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordSink for LineSink<W> {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(payload)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects records in memory. Can be told to reject upcoming sends.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<Vec<u8>>,
    failures: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` sends.
    pub fn fail_next(&mut self, count: usize) {
        self.failures = count;
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Vec<u8>> {
        self.records
    }
}

impl RecordSink for MemorySink {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(TransportError::Rejected("injected failure".to_string()));
        }
        self.records.push(payload.to_vec());
        Ok(())
    }
}

pub const DEFAULT_SEND_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Bounded retry with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, at least one.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SEND_RETRIES,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Send `payload`, retrying failed attempts according to `policy`.
pub fn send_with_retry<K>(
    sink: &mut K,
    payload: &[u8],
    policy: RetryPolicy,
) -> Result<(), TransportError>
where
    K: RecordSink + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match sink.send(payload) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= attempts => {
                return Err(TransportError::RetriesExhausted {
                    attempts,
                    last: Box::new(err),
                })
            }
            Err(err) => {
                warn!(error = %err, attempt, attempts, "send failed, retrying");
                thread::sleep(policy.backoff);
                attempt += 1;
            }
        }
    }
}
