//! Logging backend which writes to a file from a background thread.

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc::Sender,
};

use chrono::Local;
use eyre::{Context, Result};
use log::{Level, Metadata, Record};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// The name of the log file, which is created next to the host executable.
pub const LOG_FILE_NAME: &str = "dwpack_redirect.log";

struct Message {
    module: String,
    level: Level,
    string: String,
    time: String,
}

impl Message {
    fn write_to_file(&self, file: &mut File) {
        let level_name = match self.level {
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };

        //      [date time] [module] [level] Text
        let _ = writeln!(
            file,
            "[{}] [{}] [{}] {}",
            self.time, self.module, level_name, self.string
        );
    }
}

pub struct Logger;

impl Logger {
    fn commit(&self, record: &Record) {
        let module_path = match record.module_path() {
            Some(path) => path,
            None => return,
        };

        let message = Message {
            module: module_path
                .split("::")
                .last()
                .unwrap_or("unknown")
                .to_string(),
            level: record.level(),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(sender) = MSG_SENDER.get() {
            // The receiver only goes away if the writer thread has died, in which case there's
            // nowhere left to report the problem.
            let _ = sender.lock().send(message);
        }
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<Sender<Message>>> = OnceCell::new();
static PANIC_PATH: OnceCell<PathBuf> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicHookInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());

    let location = info
        .location()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown location".to_string());

    let time = Local::now();
    let backtrace = std::backtrace::Backtrace::force_capture();

    let info_dump = format!(
        "The archive redirector panicked. The host process will now exit.

Message: {message}
Location: {location}
Time: {time}
Backtrace: see below

{backtrace}"
    );

    log::error!("{info_dump}");

    if let Some(path) = PANIC_PATH.get() {
        let _ = std::fs::write(path, info_dump);
    }

    // Unwinding into host code isn't an option.
    std::process::abort();
}

fn install_panic_hook(log_dir: &Path) {
    let _ = PANIC_PATH.set(log_dir.join("PANIC.txt"));
    std::panic::set_hook(Box::new(panic_hook));
}

/// Starts logging to `path`.
pub fn init(path: &Path) -> Result<()> {
    let mut file =
        File::create(path).wrap_err_with(|| format!("Unable to create log file {:?}", path))?;

    log::set_logger(&LOGGER).map_err(|err| eyre::format_err!("{}", err))?;

    log::set_max_level(if cfg!(feature = "debug") {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    });

    if let Some(dir) = path.parent() {
        install_panic_hook(dir);
    }

    let (sender, receiver) = std::sync::mpsc::channel::<Message>();

    if MSG_SENDER.set(Mutex::new(sender)).is_err() {
        return Err(eyre::format_err!("Logging has already been initialised"));
    }

    // Writing happens on a separate thread so that the host's I/O threads never wait for the
    // log file.
    std::thread::Builder::new()
        .name("dwpack-log".to_string())
        .spawn(move || {
            for msg in receiver {
                msg.write_to_file(&mut file);
            }
        })
        .wrap_err("Unable to start logging thread")?;

    Ok(())
}
