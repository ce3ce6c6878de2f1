// Kernel logging (printk) with a fixed-capacity ring buffer backing log replay.

use super::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Log output format: human-readable lines, or one JSON object per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogFormat {
    Human = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Human as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn get_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        0 => LogFormat::Human,
        1 => LogFormat::Json,
        _ => LogFormat::Human,
    }
}

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp_us: u64,
    pub level: LogLevel,
    pub message: [u8; 256],
    pub len: usize,
}

pub struct LogBuffer {
    buffer: Mutex<RingBuffer<LogEntry, 1024>>,
}

impl LogBuffer {
    pub const fn new() -> Self {
        Self { buffer: Mutex::new(RingBuffer::new()) }
    }

    pub fn push(&self, entry: LogEntry) {
        self.buffer.lock().push(entry);
    }

    pub fn drain_all(&self) -> alloc::vec::Vec<LogEntry> {
        self.buffer.lock().drain_all()
    }
}

static KERNEL_LOG: LogBuffer = LogBuffer::new();

struct SerialWriter;

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::arch::x86_64::serial::write_str(s);
        Ok(())
    }
}

fn timestamp_us() -> u64 {
    crate::time::uptime_us()
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut message = [0u8; 256];
    let msg_str = alloc::format!("{}", args);
    let len = core::cmp::min(msg_str.len(), 256);
    message[..len].copy_from_slice(&msg_str.as_bytes()[..len]);

    let entry = LogEntry { timestamp_us: timestamp_us(), level, message, len };
    KERNEL_LOG.push(entry);

    let mut writer = SerialWriter;
    match get_log_format() {
        LogFormat::Human => {
            let _ = writeln!(writer, "[{}] {}", level.as_str(), msg_str);
        }
        LogFormat::Json => {
            let _ = writeln!(
                writer,
                "{{\"ts\":{},\"level\":\"{}\",\"msg\":\"{}\"}}",
                entry.timestamp_us,
                level.as_str(),
                msg_str.replace('"', "\\\"")
            );
        }
    }
}

/// Structured key/value logging for a named subsystem.
pub fn log_kv(subsystem: &str, level: LogLevel, kvs: &[(&str, &str)]) {
    let mut writer = SerialWriter;
    match get_log_format() {
        LogFormat::Json => {
            let _ = write!(
                writer,
                "{{\"ts\":{},\"subsystem\":\"{}\",\"level\":\"{}\"",
                timestamp_us(),
                subsystem,
                level.as_str()
            );
            for (key, value) in kvs {
                let _ = write!(writer, ",\"{}\":\"{}\"", key, value);
            }
            let _ = writeln!(writer, "}}");
        }
        LogFormat::Human => {
            let _ = write!(writer, "{}: ", subsystem);
            for (i, (key, value)) in kvs.iter().enumerate() {
                if i > 0 {
                    let _ = write!(writer, ", ");
                }
                let _ = write!(writer, "{}={}", key, value);
            }
            let _ = writeln!(writer);
        }
    }

    let msg_str = alloc::format!("{}: {} fields", subsystem, kvs.len());
    let mut message = [0u8; 256];
    let len = core::cmp::min(msg_str.len(), 256);
    message[..len].copy_from_slice(&msg_str.as_bytes()[..len]);
    KERNEL_LOG.push(LogEntry { timestamp_us: timestamp_us(), level, message, len });
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::printk!($crate::lib::printk::LogLevel::Trace, $($arg)*) };
}

#[macro_export]
macro_rules! log_kv {
    ($subsystem:expr, $level:expr, $($key:expr => $value:expr),+ $(,)?) => {
        {
            let kvs: &[(&str, &str)] = &[$(($key, $value)),+];
            $crate::lib::printk::log_kv($subsystem, $level, kvs)
        }
    };
}

/// Read back recent kernel log entries into `buf`, draining the ring buffer.
pub fn drain_dmesg(buf: &mut [u8]) -> usize {
    let entries = KERNEL_LOG.drain_all();
    let mut written = 0usize;
    for entry in entries {
        if written + entry.len > buf.len() {
            break;
        }
        buf[written..written + entry.len].copy_from_slice(&entry.message[..entry.len]);
        written += entry.len;
    }
    written
}
