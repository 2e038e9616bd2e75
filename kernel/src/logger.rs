//! `log` backend for the kernel core.
//!
//! Records are buffered in a fixed ring until a console sink is installed,
//! then the buffer is replayed once and every later record goes straight to
//! the sink.

use alloc::string::String;
use conquer_once::spin::OnceCell;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

const EARLY_LOG_SIZE: usize = 8192;

/// Console output function, e.g. a serial port writer.
pub type ConsoleSink = fn(fmt::Arguments<'_>);

static CONSOLE: OnceCell<ConsoleSink> = OnceCell::uninit();

static LOGGER: KernelLogger = KernelLogger::new();

/// Records logged before the console exists
struct EarlyLog {
    bytes: [u8; EARLY_LOG_SIZE],
    len: usize,
    dropped: usize,
}

impl EarlyLog {
    const fn new() -> Self {
        Self {
            bytes: [0; EARLY_LOG_SIZE],
            len: 0,
            dropped: 0,
        }
    }

    fn contents(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("<early log is not UTF-8>")
    }

    /// Append one whole record, or count it as dropped when it does not fit.
    fn push(&mut self, record: fmt::Arguments<'_>) {
        let mut length = LengthCounter(0);
        let _ = length.write_fmt(record);
        if length.0 > EARLY_LOG_SIZE - self.len {
            // Keep the oldest messages, they describe initialisation
            self.dropped += 1;
            return;
        }
        let _ = self.write_fmt(record);
    }
}

impl Write for EarlyLog {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.len + bytes.len();
        if end > EARLY_LOG_SIZE {
            return Err(fmt::Error);
        }
        self.bytes[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

/// Measures formatted output without storing it.
struct LengthCounter(usize);

impl Write for LengthCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoggerState {
    Buffering,
    ConsoleReady,
}

pub struct KernelLogger {
    buffer: Mutex<EarlyLog>,
    state: Mutex<LoggerState>,
}

impl KernelLogger {
    const fn new() -> Self {
        KernelLogger {
            buffer: Mutex::new(EarlyLog::new()),
            state: Mutex::new(LoggerState::Buffering),
        }
    }

    fn console_ready(&self, sink: ConsoleSink) {
        let mut state = self.state.lock();
        let buffer = self.buffer.lock();
        if buffer.len > 0 {
            sink(format_args!("--- early log ({} bytes) ---\n", buffer.len));
            sink(format_args!("{}", buffer.contents()));
            if buffer.dropped > 0 {
                sink(format_args!("--- {} records did not fit ---\n", buffer.dropped));
            }
            sink(format_args!("--- end of early log ---\n"));
        }
        *state = LoggerState::ConsoleReady;
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
        // try_lock: a record emitted while the state is being switched is lost
        // rather than deadlocking the caller.
        let state = match self.state.try_lock() {
            Some(state) => *state,
            None => return,
        };
        match state {
            LoggerState::Buffering => {
                if let Some(mut buffer) = self.buffer.try_lock() {
                    buffer.push(format_args!("[{:>5}] {}: {}\n", record.level(), record.target(), record.args()));
                }
            }
            LoggerState::ConsoleReady => {
                if let Some(sink) = CONSOLE.get() {
                    sink(format_args!("[{:>5}] {}: {}\n", record.level(), record.target(), record.args()));
                }
            }
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger as the global `log` backend.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Attach the console and replay everything buffered so far.
///
/// Only the first sink is kept; later calls return `false`.
pub fn set_console(sink: ConsoleSink) -> bool {
    if CONSOLE.try_init_once(|| sink).is_err() {
        return false;
    }
    LOGGER.console_ready(sink);
    true
}

/// Copy of the messages buffered before the console was attached.
pub fn buffered() -> String {
    String::from(LOGGER.buffer.lock().contents())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_keeps_oldest_messages_when_full() {
        let mut buffer = EarlyLog::new();
        buffer.push(format_args!("first line\n"));
        let big = "x".repeat(EARLY_LOG_SIZE);
        buffer.push(format_args!("{}\n", big));
        assert_eq!(buffer.contents(), "first line\n");
        assert_eq!(buffer.dropped, 1, "oversized message should be counted as dropped");
    }

    #[test]
    fn record_that_does_not_fit_leaves_no_fragment() {
        let mut buffer = EarlyLog::new();
        let filler = "f".repeat(EARLY_LOG_SIZE - 20);
        buffer.push(format_args!("{}\n", filler));
        let before = buffer.len;

        let args = "a".repeat(40);
        buffer.push(format_args!("[{:>5}] {}: {}\n", "INFO", "vmcore", args));
        assert_eq!(buffer.len, before, "no prefix or newline from the dropped record");
        assert_eq!(buffer.dropped, 1);

        buffer.push(format_args!("[{:>5}] ok\n", "INFO"));
        assert!(buffer.contents().ends_with(&format!("{}\n[ INFO] ok\n", filler)));
    }
}
