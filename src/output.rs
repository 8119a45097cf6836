//! Output plumbing for supervised processes.
//!
//! `OutputSink` is the single-line callback that process pumps and lifecycle messages are
//! delivered through. `ConsoleBuffer` is the bounded ring the front end renders from.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    /// Tag prepended to every line read from this stream.
    pub fn tag(self) -> &'static str {
        match self {
            StreamKind::Stdout => "[out] ",
            StreamKind::Stderr => "[err] ",
        }
    }
}

/// Receives one text line at a time.
///
/// A misbehaving sink must not take a pump task down with it, so `emit` swallows panics.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<dyn Fn(String) + Send + Sync>,
}

impl OutputSink {
    pub fn new(f: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    /// Delivers a line, ignoring any panic raised by the receiver.
    pub fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        let inner = self.inner.as_ref();
        if catch_unwind(AssertUnwindSafe(|| inner(line))).is_err() {
            tracing::debug!("output sink panicked; line dropped");
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputSink")
    }
}

/// How a console line should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Process standard output.
    Out,
    /// Process standard error.
    Err,
    /// Warnings and errors produced by pyrack itself.
    Warn,
    /// Lifecycle and informational messages.
    Info,
}

impl LineKind {
    /// Classifies a line by its tag.
    pub fn classify(text: &str) -> Self {
        if text.starts_with(StreamKind::Stdout.tag()) {
            LineKind::Out
        } else if text.starts_with(StreamKind::Stderr.tag()) {
            LineKind::Err
        } else if text.starts_with("[warn]") || text.starts_with("[error]") {
            LineKind::Warn
        } else {
            LineKind::Info
        }
    }
}

/// A single line in the console.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub text: String,
    pub kind: LineKind,
}

/// A fixed-capacity ring buffer of console lines.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    max_lines: usize,
    lines: VecDeque<ConsoleLine>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, classifying it by tag.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, text: String) -> bool {
        let kind = LineKind::classify(&text);
        let mut dropped = false;
        self.lines.push_back(ConsoleLine { text, kind });
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter()
    }
}

/// Removes ANSI escapes and carriage-return overwrite noise for display.
///
/// The stripper drops `\r` itself, so the overwritten segments are discarded first.
pub fn sanitize_text(text: &str) -> String {
    // keep only what the last carriage return would have left on screen
    let visible = text.rsplit('\r').find(|part| !part.is_empty()).unwrap_or("");
    let stripped = strip(visible.as_bytes());
    String::from_utf8_lossy(&stripped).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn console_buffer_drops_oldest() {
        let mut buffer = ConsoleBuffer::new(2);
        buffer.push("[out] a".into());
        buffer.push("[out] b".into());
        let dropped = buffer.push("[err] c".into());
        assert!(dropped);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["[out] b", "[err] c"]);
        assert_eq!(buffer.iter().last().unwrap().kind, LineKind::Err);
    }

    #[test]
    fn classify_uses_tags() {
        assert_eq!(LineKind::classify("[out] hi"), LineKind::Out);
        assert_eq!(LineKind::classify("[err] boom"), LineKind::Err);
        assert_eq!(LineKind::classify("[warn] careful"), LineKind::Warn);
        assert_eq!(LineKind::classify("[run] a.py started"), LineKind::Info);
    }

    #[test]
    fn sink_swallows_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = OutputSink::new(move |line| {
            if line == "explode" {
                panic!("listener bug");
            }
            captured.lock().unwrap().push(line);
        });
        sink.emit("before");
        sink.emit("explode");
        sink.emit("after");
        assert_eq!(*seen.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn sanitize_strips_ansi_and_carriage_returns() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m"), "red");
        assert_eq!(sanitize_text("10%\r50%\r100%"), "100%");
        assert_eq!(sanitize_text("done\r"), "done");
        assert_eq!(sanitize_text("\u{1b}[32m10%\r\u{1b}[32m100%\u{1b}[0m"), "100%");
        assert_eq!(sanitize_text("\r"), "");
    }
}
