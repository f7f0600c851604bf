//! Status output sink.
//!
//! Human-readable status lines go here rather than through tracing. The sink
//! is cloneable and shared between the main flow and the progress task;
//! every line is flushed as it is written.

use std::fmt::Display;
use std::io::{self, LineWriter, Write};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    captured: Option<Arc<Mutex<Vec<u8>>>>,
}

impl OutputSink {
    /// Line-buffered standard output.
    pub fn stdout() -> Self {
        Self::from_writer(LineWriter::new(io::stdout()))
    }

    /// Discard everything.
    pub fn discard() -> Self {
        Self::from_writer(io::sink())
    }

    /// Keep everything in memory; read it back with [`OutputSink::contents`].
    pub fn memory() -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        Self {
            writer: Arc::new(Mutex::new(Box::new(SharedBuf(buf.clone())))),
            captured: Some(buf),
        }
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            captured: None,
        }
    }

    /// Write one status line.
    pub fn line(&self, msg: impl Display) {
        let mut writer = self.writer.lock().expect("output sink lock poisoned");
        if let Err(e) = writeln!(writer, "{msg}").and_then(|_| writer.flush()) {
            warn!("status output failed: {}", e);
        }
    }

    /// Text captured by a [`OutputSink::memory`] sink; empty otherwise.
    pub fn contents(&self) -> String {
        self.captured
            .as_ref()
            .map(|buf| {
                String::from_utf8_lossy(&buf.lock().expect("output sink lock poisoned")).into_owned()
            })
            .unwrap_or_default()
    }
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("output sink lock poisoned")
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects_lines() {
        let sink = OutputSink::memory();
        sink.line("first");
        sink.line(format_args!("second {}", 2));
        assert_eq!(sink.contents(), "first\nsecond 2\n");
    }

    #[test]
    fn test_clones_share_output() {
        let sink = OutputSink::memory();
        let other = sink.clone();
        std::thread::spawn(move || other.line("from thread"))
            .join()
            .unwrap();
        sink.line("from main");
        assert_eq!(sink.contents(), "from thread\nfrom main\n");
    }

    #[test]
    fn test_discard_has_no_contents() {
        let sink = OutputSink::discard();
        sink.line("gone");
        assert!(sink.contents().is_empty());
    }
}
