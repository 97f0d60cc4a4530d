use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SensorError;
use crate::gps_processor::{Point, PositionSample, ProcessResult};
use crate::sampler::{PositionProvider, SampleSink, SamplerOptions, WatchId};
use crate::utils::BoxFuture;

/* Raw data mode: an optional debugging aid that should be off by default.
   Every raw sample is written to a csv file together with the gate decision,
   a new file per recorder. The same format is what `ReplayProvider` reads, so
   a field recording can be replayed through the whole pipeline.
*/

#[derive(Debug, Serialize, Deserialize)]
struct RawSampleRecord {
    timestamp_ms: i64,
    latitude: f64,
    longitude: f64,
    accuracy: Option<f64>,
    speed: Option<f64>,
    heading: Option<f64>,
    #[serde(default)]
    process_result: Option<i8>,
}

impl RawSampleRecord {
    fn into_sample(self) -> Result<PositionSample> {
        let captured_at = DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
            .ok_or_else(|| anyhow!("invalid timestamp_ms: {}", self.timestamp_ms))?;
        Ok(PositionSample {
            point: Point::new(self.latitude, self.longitude),
            accuracy: self.accuracy,
            speed: self.speed,
            heading: self.heading,
            captured_at,
        })
    }
}

pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<PositionSample>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open raw data file {}", path.display()))?;
    let mut samples = Vec::new();
    for record in reader.deserialize::<RawSampleRecord>() {
        samples.push(record?.into_sample()?);
    }
    Ok(samples)
}

pub struct RawSampleRecorder {
    dir: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl RawSampleRecorder {
    pub fn init(support_dir: &str) -> Result<RawSampleRecorder> {
        let dir = Path::new(support_dir).join("raw_data/");
        fs::create_dir_all(&dir)?;
        Ok(RawSampleRecorder { dir, writer: None })
    }

    fn open_new_file(&self) -> Result<csv::Writer<File>> {
        let timestamp_sec = Utc::now().timestamp();
        let mut i = 0;
        let filename = loop {
            let filename = self.dir.join(format!("gps-{}-{}.csv", timestamp_sec, i));
            if fs::metadata(&filename).is_err() {
                break filename;
            }
            i += 1;
        };
        debug!("[raw_data] recording to {}", filename.display());
        Ok(csv::Writer::from_path(filename)?)
    }

    pub fn record(&mut self, sample: &PositionSample, process_result: ProcessResult) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(self.open_new_file()?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.serialize(RawSampleRecord {
                timestamp_ms: sample.captured_at.timestamp_millis(),
                latitude: sample.point.latitude,
                longitude: sample.point.longitude,
                accuracy: sample.accuracy,
                speed: sample.speed,
                heading: sample.heading,
                process_result: Some(process_result.to_int()),
            })?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut result = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                result.push(path);
            }
        }
        result.sort();
        Ok(result)
    }
}

/// Plays back recorded samples as if they came from the device sensor.
/// Delays between samples follow their capture times divided by `speedup`.
/// A restarted watch continues where the previous one stopped.
pub struct ReplayProvider {
    samples: Arc<Vec<PositionSample>>,
    speedup: f64,
    cursor: Arc<AtomicUsize>,
    next_watch_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, CancellationToken>>,
}

impl ReplayProvider {
    pub fn new(samples: Vec<PositionSample>, speedup: f64) -> Self {
        ReplayProvider {
            samples: Arc::new(samples),
            speedup: if speedup > 0.0 { speedup } else { 1.0 },
            cursor: Arc::new(AtomicUsize::new(0)),
            next_watch_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_csv<P: AsRef<Path>>(path: P, speedup: f64) -> Result<Self> {
        Ok(Self::new(load_csv(path)?, speedup))
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.load(Ordering::SeqCst) >= self.samples.len()
    }
}

impl PositionProvider for ReplayProvider {
    fn start_watch(
        &self,
        _options: &SamplerOptions,
        sink: SampleSink,
    ) -> Result<WatchId, SensorError> {
        let id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.watches.lock().unwrap().insert(id, cancel.clone());

        let samples = self.samples.clone();
        let cursor = self.cursor.clone();
        let speedup = self.speedup;
        tokio::spawn(async move {
            let mut previous: Option<DateTime<Utc>> = None;
            loop {
                let index = cursor.load(Ordering::SeqCst);
                let Some(sample) = samples.get(index) else {
                    break;
                };
                if let Some(previous) = previous {
                    let gap_ms = (sample.captured_at - previous).num_milliseconds().max(0);
                    let delay = Duration::from_millis((gap_ms as f64 / speedup) as u64);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() || sink.is_closed() {
                    break;
                }
                sink.push_sample(sample.clone());
                cursor.fetch_add(1, Ordering::SeqCst);
                previous = Some(sample.captured_at);
            }
        });
        Ok(id)
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(cancel) = self.watches.lock().unwrap().remove(&id) {
            cancel.cancel();
        }
    }

    fn get_once(&self, _options: &SamplerOptions) -> BoxFuture<Result<PositionSample, SensorError>> {
        let index = self.cursor.load(Ordering::SeqCst).saturating_sub(1);
        let sample = self.samples.get(index).cloned();
        Box::pin(async move {
            sample.ok_or_else(|| SensorError::PositionUnavailable("nothing to replay".to_string()))
        })
    }
}
