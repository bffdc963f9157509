use chrono::Local;
use log::{set_boxed_logger, set_max_level, Level, Log, SetLoggerError};
use std::io::{stdout, BufWriter, Write};
use std::sync::mpsc;
use std::thread;

/// Message sent from a log call site to the writer thread.
pub enum LogCommand {
    Record(String),
    Flush,
    Terminate,
}

/// A `log::Log` implementation that hands formatted lines off to a
/// dedicated writer thread so call sites never block on stdout.
pub struct HudpLogger {
    max_level: Level,
    sender: mpsc::SyncSender<LogCommand>,
}

impl HudpLogger {
    pub fn new(max_level: Level, buffer_size: usize) -> (Self, mpsc::Receiver<LogCommand>) {
        let (sender, receiver) = mpsc::sync_channel(buffer_size);
        (HudpLogger { max_level, sender }, receiver)
    }

    /// Spawns the writer thread and installs the logger as the global `log` sink.
    pub fn init(max_level: Level, buffer_size: usize) -> Result<(), SetLoggerError> {
        let (logger, receiver) = HudpLogger::new(max_level, buffer_size);

        thread::Builder::new()
            .name("hudp-log-writer".into())
            .spawn(move || {
                let mut writer = BufWriter::new(stdout());
                while let Ok(command) = receiver.recv() {
                    match command {
                        LogCommand::Record(message) => {
                            if let Err(e) = writer.write_all(message.as_bytes()) {
                                eprintln!("[hudp-log] failed to write log record: {}", e);
                            }
                        }
                        LogCommand::Flush => {
                            if let Err(e) = writer.flush() {
                                eprintln!("[hudp-log] failed to flush log: {}", e);
                            }
                        }
                        LogCommand::Terminate => {
                            let _ = writer.flush();
                            break;
                        }
                    }
                }
                let _ = writer.flush();
            })
            .expect("failed to spawn log writer thread");

        set_boxed_logger(Box::new(logger))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

impl Log for HudpLogger {
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

            if let Err(e) = self.sender.try_send(LogCommand::Record(message)) {
                eprintln!("[hudp-log] failed to send log message: {}", e);
            }
        }
    }

    fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }
}
