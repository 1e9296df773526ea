//! Console logging for the Aegis kernel
//!
//! Routes the `log` facade to a byte sink. On hardware the sink is a UART or
//! framebuffer driver supplied by the embedding kernel; hosted builds use
//! [`StdoutSink`] and tests use [`CaptureSink`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Byte-oriented console output
pub trait ConsoleSink: Send {
    /// Write a string to the device
    fn write_str(&mut self, s: &str);
}

/// Adapter giving a sink `fmt::Write`, translating newlines for serial output
struct SinkWriter<'a>(&'a mut dyn ConsoleSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some(pos) = rest.find('\n') {
            self.0.write_str(&rest[..pos]);
            self.0.write_str("\r\n");
            rest = &rest[pos + 1..];
        }
        if !rest.is_empty() {
            self.0.write_str(rest);
        }
        Ok(())
    }
}

/// `log::Log` implementation writing `[LEVEL target] message` lines
pub struct KernelLogger {
    sink: Mutex<Option<Box<dyn ConsoleSink>>>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Replace the output sink
    pub fn set_sink(&self, sink: Box<dyn ConsoleSink>) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut guard = self.sink.lock();
        if let Some(sink) = guard.as_mut() {
            let mut writer = SinkWriter(sink.as_mut());
            // Console output is best effort
            let _ = writeln!(
                writer,
                "[{:<5} {}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new();
static LOGGER_INSTALLED: Once<()> = Once::new();

/// Install the kernel logger
///
/// The logger registers with the `log` facade once; later calls swap the
/// sink and adjust the level.
pub fn init_logger(sink: Box<dyn ConsoleSink>, level: LevelFilter) {
    LOGGER.set_sink(sink);
    LOGGER_INSTALLED.call_once(|| {
        // Fails only if another logger was installed first, in which case
        // records keep flowing there.
        let _ = log::set_logger(&LOGGER);
    });
    log::set_max_level(level);
}

/// Sink capturing output in a bounded buffer
///
/// Clones share the buffer, so a test can keep one handle and install the
/// other. Output past the capacity is dropped.
#[derive(Clone, Default)]
pub struct CaptureSink {
    buffer: Arc<Mutex<heapless::String<4096>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything captured so far
    pub fn contents(&self) -> alloc::string::String {
        alloc::string::String::from(self.buffer.lock().as_str())
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl ConsoleSink for CaptureSink {
    fn write_str(&mut self, s: &str) {
        let mut buffer = self.buffer.lock();
        for c in s.chars() {
            if buffer.push(c).is_err() {
                break;
            }
        }
    }
}

/// Sink writing to the host's standard output
#[cfg(feature = "std")]
pub struct StdoutSink;

#[cfg(feature = "std")]
impl ConsoleSink for StdoutSink {
    fn write_str(&mut self, s: &str) {
        use std::io::Write as _;
        let _ = std::io::stdout().write_all(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_shares_buffer() {
        let capture = CaptureSink::new();
        let mut handle = capture.clone();
        handle.write_str("hello");
        assert_eq!(capture.contents(), "hello");
        capture.clear();
        assert!(capture.contents().is_empty());
    }

    #[test]
    fn test_capture_sink_is_bounded() {
        let capture = CaptureSink::new();
        let mut handle = capture.clone();
        for _ in 0..5000 {
            handle.write_str("x");
        }
        assert_eq!(capture.contents().len(), 4096);
    }

    #[test]
    fn test_logger_formats_record() {
        let logger = KernelLogger::new();
        let capture = CaptureSink::new();
        logger.set_sink(Box::new(capture.clone()));
        log::set_max_level(LevelFilter::Trace);

        logger.log(
            &Record::builder()
                .level(log::Level::Warn)
                .target("aegis::irq")
                .args(format_args!("line {} unhandled", 7))
                .build(),
        );

        assert_eq!(capture.contents(), "[WARN  aegis::irq] line 7 unhandled\r\n");
    }
}
