#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use trackpro_core::dispatcher::{FallbackEndpoint, RealtimeChannel};
use trackpro_core::error::{SensorError, TransportError};
use trackpro_core::gps_processor::{Point, PositionSample};
use trackpro_core::raw_data;
use trackpro_core::sampler::{PositionProvider, SampleSink, SamplerOptions, WatchId};
use trackpro_core::utils::BoxFuture;
use trackpro_core::wire::LocationUpdate;

pub const BASE_LAT: f64 = 42.3601;
pub const BASE_LNG: f64 = -71.0589;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn load_drive_for_test() -> Vec<PositionSample> {
    raw_data::load_csv("./tests/data/drive.csv").unwrap()
}

pub fn time_at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + secs, 0).unwrap()
}

pub fn sample_at(secs: i64, latitude: f64, longitude: f64, speed: f64) -> PositionSample {
    PositionSample {
        point: Point::new(latitude, longitude),
        accuracy: Some(5.0),
        speed: Some(speed),
        heading: None,
        captured_at: time_at(secs),
    }
}

/// `meters` north of the base point.
pub fn north_of_base(meters: f64) -> Point {
    Point::new(BASE_LAT + meters / 111_194.93, BASE_LNG)
}

pub fn update_at(job_id: &str, secs: i64, point: Point) -> LocationUpdate {
    LocationUpdate {
        job_id: job_id.to_string(),
        latitude: point.latitude,
        longitude: point.longitude,
        accuracy: Some(5.0),
        speed: Some(10.0),
        heading: None,
        captured_at: time_at(secs),
        driving_score: Some(100),
        is_moving: Some(true),
        confidence: None,
    }
}

/// Position provider driven by the test: samples are pushed by hand into the
/// current watch and one-shot readings are taken from a script.
#[derive(Default)]
pub struct ScriptedProvider {
    sink: Mutex<Option<SampleSink>>,
    once: Mutex<VecDeque<Result<PositionSample, SensorError>>>,
    permission_denied: AtomicBool,
    failing_watches: AtomicUsize,
    next_id: AtomicU64,
    watch_attempts: AtomicUsize,
    watches_started: AtomicUsize,
    watches_cleared: AtomicUsize,
    once_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_permission(&self) {
        self.permission_denied.store(true, Ordering::SeqCst);
    }

    /// The next `count` watch starts fail with an unavailable position.
    pub fn fail_next_watches(&self, count: usize) {
        self.failing_watches.store(count, Ordering::SeqCst);
    }

    pub fn watch_attempts(&self) -> usize {
        self.watch_attempts.load(Ordering::SeqCst)
    }

    pub fn script_once(&self, result: Result<PositionSample, SensorError>) {
        self.once.lock().unwrap().push_back(result);
    }

    pub fn push(&self, sample: PositionSample) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.push_sample(sample);
        }
    }

    pub fn push_error(&self, error: SensorError) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.push_error(error);
        }
    }

    pub fn watches_started(&self) -> usize {
        self.watches_started.load(Ordering::SeqCst)
    }

    pub fn watches_cleared(&self) -> usize {
        self.watches_cleared.load(Ordering::SeqCst)
    }

    pub fn once_calls(&self) -> usize {
        self.once_calls.load(Ordering::SeqCst)
    }
}

impl PositionProvider for ScriptedProvider {
    fn start_watch(
        &self,
        _options: &SamplerOptions,
        sink: SampleSink,
    ) -> Result<WatchId, SensorError> {
        self.watch_attempts.fetch_add(1, Ordering::SeqCst);
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(SensorError::PermissionDenied);
        }
        if self
            .failing_watches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SensorError::PositionUnavailable("no satellites".to_string()));
        }
        *self.sink.lock().unwrap() = Some(sink);
        self.watches_started.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn clear_watch(&self, _id: WatchId) {
        self.watches_cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn get_once(&self, _options: &SamplerOptions) -> BoxFuture<Result<PositionSample, SensorError>> {
        self.once_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.permission_denied.load(Ordering::SeqCst) {
            Err(SensorError::PermissionDenied)
        } else {
            self.once
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SensorError::PositionUnavailable("no fix".to_string())))
        };
        Box::pin(async move { result })
    }
}

/// Realtime channel that only remembers what it was asked to publish.
pub struct RecordingChannel {
    connected: watch::Sender<bool>,
    published: Mutex<Vec<LocationUpdate>>,
}

impl RecordingChannel {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(RecordingChannel {
            connected: watch::channel(connected).0,
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn published(&self) -> Vec<LocationUpdate> {
        self.published.lock().unwrap().clone()
    }
}

impl RealtimeChannel for RecordingChannel {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn publish(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>> {
        let result = if self.is_connected() {
            self.published.lock().unwrap().push(update);
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        };
        Box::pin(async move { result })
    }
}

pub struct RecordingFallback {
    available: AtomicBool,
    posted: Mutex<Vec<LocationUpdate>>,
}

impl RecordingFallback {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(RecordingFallback {
            available: AtomicBool::new(available),
            posted: Mutex::new(Vec::new()),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<LocationUpdate> {
        self.posted.lock().unwrap().clone()
    }
}

impl FallbackEndpoint for RecordingFallback {
    fn post(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>> {
        let result = if self.available.load(Ordering::SeqCst) {
            self.posted.lock().unwrap().push(update);
            Ok(())
        } else {
            Err(TransportError::Network("offline".to_string()))
        };
        Box::pin(async move { result })
    }
}

/// Let spawned tasks run until they are all parked.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
