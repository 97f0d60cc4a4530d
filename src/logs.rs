use std::{
    ffi::OsStr,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{mpsc, LazyLock, Mutex},
};

use anyhow::Result;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    {ContentLimit, FileRotate},
};
use log::{info, Log};
use simplelog::{ConfigBuilder, LevelFilter, WriteLogger};

/// Where formatted log lines are mirrored to, typically a debug panel of the
/// host app. Nothing is mirrored until one is registered.
static LOG_SINK: LazyLock<Mutex<Option<mpsc::Sender<String>>>> =
    LazyLock::new(|| Mutex::new(None));

pub struct TrackingLogger {
    write_logger: Box<WriteLogger<FileRotate<AppendTimestamp>>>,
}

impl Log for TrackingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.write_logger.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.write_logger.log(record);

        let mut sink = LOG_SINK.lock().unwrap();
        if let Some(tx) = sink.as_ref() {
            let message = format!("{}:{} -- {}", record.level(), record.target(), record.args());
            if tx.send(message).is_err() {
                // receiver is gone, stop mirroring
                *sink = None;
            }
        }
    }

    fn flush(&self) {
        self.write_logger.flush();
    }
}

const LIVE_LOG: &str = "tracking.log";

/// Log to `<cache_dir>/logs/tracking.log`, keeping the last 3 files of 1000
/// lines each.
pub fn init(cache_dir: &str) -> Result<()> {
    let path = Path::new(cache_dir).join("logs").join(LIVE_LOG);
    let log = FileRotate::new(
        path,
        AppendTimestamp::default(FileLimit::MaxFiles(3)),
        ContentLimit::Lines(1000),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let write_logger = WriteLogger::new(LevelFilter::Info, config, log);
    log::set_boxed_logger(Box::new(TrackingLogger { write_logger }))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

pub fn set_log_sink(sink: mpsc::Sender<String>) {
    *LOG_SINK.lock().unwrap() = Some(sink);
}

pub fn clear_log_sink() {
    *LOG_SINK.lock().unwrap() = None;
}

/// Rotated log files under `<cache_dir>/logs`, oldest first. The live
/// `tracking.log` has no timestamp suffix and sorts ahead of its rotations,
/// so it is moved to the end.
fn log_files(cache_dir: &str) -> Result<Vec<PathBuf>> {
    let log_folder = Path::new(cache_dir).join("logs");
    if !log_folder.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(&log_folder)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort_by_key(|path| (path.file_name() == Some(OsStr::new(LIVE_LOG)), path.clone()));
    Ok(files)
}

/// Bundle every tracking log into a zip for a support ticket, returning how
/// many files went in. Entries land under `tracking-logs/` regardless of
/// where the cache lives.
pub fn export(cache_dir: &str, target_file_path: &str) -> Result<usize> {
    let files = log_files(cache_dir)?;
    let mut zip = zip::ZipWriter::new(File::create(target_file_path)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for path in &files {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        zip.start_file(format!("tracking-logs/{}", name), options)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }
    zip.finish()?;
    info!("[logs] exported {} log files to {}", files.len(), target_file_path);
    Ok(files.len())
}
