use chrono::Local;
use log::{Level, Log, SetLoggerError, set_boxed_logger, set_max_level};
use std::collections::VecDeque;
use std::io::{BufWriter, Write, stdout};
use std::sync::{Arc, OnceLock, RwLock, mpsc};
use std::thread;

/// How many formatted lines the postmortem ring keeps. Oldest lines are
/// dropped first.
pub const RING_CAPACITY: usize = 2000;

static RING: OnceLock<Arc<RwLock<VecDeque<String>>>> = OnceLock::new();

pub enum LogCommand {
    Record(String),
    Flush,
    Terminate,
}

pub struct BraidLogger {
    max_level: Level,
    sender: mpsc::SyncSender<LogCommand>,
    ring: Arc<RwLock<VecDeque<String>>>,
}

impl BraidLogger {
    pub fn new(max_level: Level, buffer_size: usize) -> (Self, mpsc::Receiver<LogCommand>) {
        let (sender, receiver) = mpsc::sync_channel(buffer_size);
        let ring = Arc::new(RwLock::new(VecDeque::with_capacity(RING_CAPACITY)));

        let logger = BraidLogger {
            max_level,
            sender,
            ring,
        };
        (logger, receiver)
    }

    pub fn init(max_level: Level, buffer_size: usize) -> Result<(), SetLoggerError> {
        let (logger, receiver) = BraidLogger::new(max_level, buffer_size);
        let _ = RING.set(logger.ring.clone());

        let _handle = thread::Builder::new()
            .name("braid-log-writer".into())
            .spawn(move || {
                let mut writer = BufWriter::new(stdout());
                while let Ok(command) = receiver.recv() {
                    match command {
                        LogCommand::Record(message) => {
                            if let Err(e) = writer.write_all(message.as_bytes()) {
                                eprintln!("[BraidLogger] Failed to write log record: {}", e);
                            }
                        }
                        LogCommand::Flush => {
                            if let Err(e) = writer.flush() {
                                eprintln!("[BraidLogger] Failed to flush log: {}", e);
                            }
                        }
                        LogCommand::Terminate => {
                            let _ = writer.flush();
                            break;
                        }
                    }
                }
                // Channel closed or termination requested. Ensure final flush.
                let _ = writer.flush();
            })
            .expect("Failed to spawn logger thread");

        set_boxed_logger(Box::new(logger))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }

    fn remember(&self, line: &str) {
        if let Ok(mut ring) = self.ring.write() {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line.trim_end().to_string());
        }
    }
}

impl Log for BraidLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            let message = format!(
                "{} {} [{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            );

            self.remember(&message);
            if let Err(e) = self.sender.try_send(LogCommand::Record(message)) {
                eprintln!("[BraidLogger] Failed to send log message: {}", e);
            }
        }
    }

    fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }
}

/// Returns up to the last `n` formatted log lines, oldest first. Empty
/// before `init` has run.
pub fn tail(n: usize) -> Vec<String> {
    let Some(ring) = RING.get() else {
        return Vec::new();
    };
    let Ok(ring) = ring.read() else {
        return Vec::new();
    };
    let skip = ring.len().saturating_sub(n);
    ring.iter().skip(skip).cloned().collect()
}
