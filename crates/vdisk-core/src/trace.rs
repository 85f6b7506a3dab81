//! Pass-through stream wrapper that records every read and write for replay
//! and debugging.

use std::backtrace::Backtrace;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::stream::{SparseStream, StreamExtent};
use crate::{CancelToken, Result, VdError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceActivity {
    Read,
    Write,
}

impl fmt::Display for TraceActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("READ"),
            Self::Write => f.write_str("WRITE"),
        }
    }
}

/// One observed operation on the wrapped stream. Records are append-only
/// and ordered by operation completion.
#[derive(Clone, Debug)]
pub struct TraceRecord {
    pub sequence: u64,
    pub activity: TraceActivity,
    pub position: u64,
    pub count: usize,
    /// Bytes transferred, or -1 when the operation failed.
    pub result: i64,
    /// `"Kind: message"` of the failure, when there was one.
    pub error: Option<String>,
    pub stack: Option<String>,
}

/// Records reads and writes passing through to the wrapped stream.
///
/// Tracing is off until [`TracingStream::start`] is called; writes are
/// traced by default, reads are opt-in. A failing operation is recorded
/// with `result = -1` before the error is handed back, so tracing never
/// swallows an error. When a file sink is attached every record is flushed
/// as it is written, so a crash leaves a consistent trace prefix.
pub struct TracingStream<S> {
    inner: S,
    active: bool,
    trace_reads: bool,
    trace_writes: bool,
    capture_stacks: bool,
    next_sequence: u64,
    records: Vec<TraceRecord>,
    sink: Option<Box<dyn Write>>,
}

impl<S: SparseStream> TracingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            active: false,
            trace_reads: false,
            trace_writes: true,
            capture_stacks: false,
            next_sequence: 0,
            records: Vec::new(),
            sink: None,
        }
    }

    pub fn start(&mut self) {
        tracing::debug!("stream trace started");
        self.active = true;
    }

    pub fn stop(&mut self) {
        tracing::debug!("stream trace stopped");
        self.active = false;
    }

    /// Discard all records and restart the sequence; optionally begin
    /// tracing immediately.
    pub fn reset(&mut self, start: bool) {
        tracing::debug!(start, "stream trace reset");
        self.records.clear();
        self.next_sequence = 0;
        self.active = start;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_trace_reads(&mut self, enabled: bool) {
        self.trace_reads = enabled;
    }

    pub fn set_trace_writes(&mut self, enabled: bool) {
        self.trace_writes = enabled;
    }

    pub fn set_capture_stacks(&mut self, enabled: bool) {
        self.capture_stacks = enabled;
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    /// Mirror records to a text file, replacing (and thereby closing) any
    /// previous sink. May be called at any time.
    pub fn write_to_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        self.sink = Some(Box::new(file));
        Ok(())
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn append_record(
        &mut self,
        activity: TraceActivity,
        position: u64,
        count: usize,
        outcome: std::result::Result<usize, &VdError>,
    ) {
        let (result, error) = match outcome {
            Ok(transferred) => (transferred as i64, None),
            Err(err) => (-1, Some(format!("{}: {err}", err.kind()))),
        };
        let stack = self
            .capture_stacks
            .then(|| Backtrace::force_capture().to_string());
        let record = TraceRecord {
            sequence: self.next_sequence,
            activity,
            position,
            count,
            result,
            error,
            stack,
        };
        self.next_sequence += 1;
        self.emit(&record);
        self.records.push(record);
    }

    fn emit(&mut self, record: &TraceRecord) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let mut line = format!(
            "{} {} @pos={:x} count={} result={}",
            record.sequence, record.activity, record.position, record.count, record.result
        );
        if let Some(error) = &record.error {
            line.push_str(" exc=");
            line.push_str(error);
        }
        line.push('\n');
        if let Some(stack) = &record.stack {
            for frame in stack.lines() {
                line.push_str("    ");
                line.push_str(frame);
                line.push('\n');
            }
        }
        let ok = sink.write_all(line.as_bytes()).is_ok() && sink.flush().is_ok();
        if !ok {
            tracing::warn!("trace sink write failed, detaching sink");
            self.sink = None;
        }
    }
}

impl<S: SparseStream> SparseStream for TracingStream<S> {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.inner.set_position(position)
    }

    fn seek(&mut self, pos: std::io::SeekFrom) -> Result<u64> {
        self.inner.seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let position = self.inner.position();
        let count = buf.len();
        let result = self.inner.read(buf);
        if self.active && self.trace_reads {
            let outcome = match &result {
                Ok(n) => Ok(*n),
                Err(err) => Err(err),
            };
            self.append_record(TraceActivity::Read, position, count, outcome);
        }
        result
    }

    fn read_with_cancel(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize> {
        let position = self.inner.position();
        let count = buf.len();
        let result = self.inner.read_with_cancel(buf, cancel);
        if self.active && self.trace_reads {
            let outcome = match &result {
                Ok(n) => Ok(*n),
                Err(err) => Err(err),
            };
            self.append_record(TraceActivity::Read, position, count, outcome);
        }
        result
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let position = self.inner.position();
        let count = buf.len();
        let result = self.inner.write(buf);
        if self.active && self.trace_writes {
            let outcome = match &result {
                Ok(()) => Ok(count),
                Err(err) => Err(err),
            };
            self.append_record(TraceActivity::Write, position, count, outcome);
        }
        result
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn stored_extents(&mut self) -> Result<Vec<StreamExtent>> {
        self.inner.stored_extents()
    }

    fn extents_in_range(&mut self, start: u64, count: u64) -> Result<Vec<StreamExtent>> {
        self.inner.extents_in_range(start, count)
    }
}
