use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::background::{BackgroundExecutionPolicy, RecurringHandle};
use crate::config::TrackingConfig;
use crate::dispatcher::{DeliveryStatus, TransportDispatcher};
use crate::driving_metrics::{DrivingMetrics, DrivingMetricsCalculator};
use crate::error::{SensorError, TrackingError};
use crate::gps_processor::{AdaptiveScheduler, Point, PositionSample, ScheduleOutcome};
use crate::job::{JobDirectory, JobStatus};
use crate::live_map::check_arrival;
use crate::raw_data::RawSampleRecorder;
use crate::sampler::{GeolocationSampler, SamplerOptions, WatchEvent, WatchHandle};
use crate::utils::Clock;
use crate::wire::LocationUpdate;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Idle,
    RequestingPermission,
    Active,
    /// Active, but the host app is in the background.
    Suspended,
    Stopped,
    PermissionDenied,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Ingested {
    pub outcome: ScheduleOutcome,
    /// Only set when the sample passed the gate.
    pub update: Option<LocationUpdate>,
}

/// One tracking activation for a single job. Owns the scheduler and the
/// metrics of that activation, nothing else mutates them.
pub struct TrackingSession {
    job_id: String,
    started_at: DateTime<Utc>,
    scheduler: AdaptiveScheduler,
    metrics: DrivingMetricsCalculator,
    is_active: bool,
}

impl TrackingSession {
    pub fn new(job_id: &str, started_at: DateTime<Utc>, config: &TrackingConfig) -> Self {
        TrackingSession {
            job_id: job_id.to_string(),
            started_at,
            scheduler: AdaptiveScheduler::new(config),
            metrics: DrivingMetricsCalculator::new(config),
            is_active: true,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn current_interval(&self) -> Duration {
        self.scheduler.current_interval()
    }

    pub fn last_emitted(&self) -> Option<&PositionSample> {
        self.scheduler.last_emitted()
    }

    pub fn metrics(&self) -> &DrivingMetrics {
        self.metrics.metrics()
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    fn is_moving(&self) -> bool {
        self.scheduler
            .last_emitted()
            .is_some_and(|sample| self.scheduler.is_moving(sample.speed_or_zero()))
    }

    /// Every raw sample updates the metrics. Only a sample that passes the
    /// gate adds distance and becomes a `LocationUpdate`.
    pub fn ingest(&mut self, sample: &PositionSample) -> Option<Ingested> {
        if !self.is_active {
            return None;
        }
        self.metrics.record(sample);
        let outcome = self.scheduler.preprocess(sample);
        let update = if outcome.result.is_emitted() {
            self.metrics.add_distance(outcome.moved_m);
            Some(LocationUpdate::from_sample(
                &self.job_id,
                sample,
                self.metrics.metrics().score,
                self.scheduler.is_moving(sample.speed_or_zero()),
            ))
        } else {
            None
        };
        Some(Ingested { outcome, update })
    }

    fn deactivate(&mut self) {
        self.is_active = false;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub job_id: Option<String>,
    pub state: SessionState,
    pub keep_alive_held: bool,
    pub metrics: Option<DrivingMetrics>,
    pub last_position: Option<Point>,
    pub last_captured_at: Option<DateTime<Utc>>,
    pub current_interval_ms: Option<u64>,
    pub repoll_interval_ms: Option<u64>,
    pub foreground: bool,
    pub delivery: DeliveryStatus,
    pub unsynced_updates: usize,
    /// The sensor kept failing past the retry budget.
    pub sensor_warning: bool,
}

pub struct TrackerDeps {
    pub sampler: GeolocationSampler,
    pub jobs: Arc<dyn JobDirectory>,
    pub dispatcher: Arc<TransportDispatcher>,
    pub background: Arc<dyn BackgroundExecutionPolicy>,
    pub clock: Arc<dyn Clock>,
    /// Raw data mode, off unless a recorder is given.
    pub recorder: Option<RawSampleRecorder>,
}

struct SessionRuntime {
    cancel: CancellationToken,
    repoll: Option<RecurringHandle>,
    _sync: RecurringHandle,
}

struct TrackerState {
    session_state: SessionState,
    // bumped on every start and stop, late results carry the old value
    generation: u64,
    session: Option<TrackingSession>,
    runtime: Option<SessionRuntime>,
    foreground: bool,
    sensor_failures: u32,
    sensor_warning: bool,
}

struct Inner {
    config: TrackingConfig,
    sampler: GeolocationSampler,
    jobs: Arc<dyn JobDirectory>,
    dispatcher: Arc<TransportDispatcher>,
    background: Arc<dyn BackgroundExecutionPolicy>,
    clock: Arc<dyn Clock>,
    recorder: Mutex<Option<RawSampleRecorder>>,
    state: Mutex<TrackerState>,
    start_lock: tokio::sync::Mutex<()>,
}

/// Composition root of the tracking core. At most one session runs at a
/// time, starting a new one stops the previous one first. Must be used from
/// within a tokio runtime.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    pub fn new(config: TrackingConfig, deps: TrackerDeps) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Tracker {
            inner: Arc::new(Inner {
                config,
                sampler: deps.sampler,
                jobs: deps.jobs,
                dispatcher: deps.dispatcher,
                background: deps.background,
                clock: deps.clock,
                recorder: Mutex::new(deps.recorder),
                state: Mutex::new(TrackerState {
                    session_state: SessionState::Idle,
                    generation: 0,
                    session: None,
                    runtime: None,
                    foreground: true,
                    sensor_failures: 0,
                    sensor_warning: false,
                }),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Arc<TransportDispatcher> {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().unwrap().session_state
    }

    pub async fn start(&self, job_id: &str) -> Result<(), TrackingError> {
        let inner = &self.inner;
        let _start = inner.start_lock.lock().await;

        let generation = {
            let mut state = inner.state.lock().unwrap();
            if let Some(session) = &state.session {
                info!(
                    "[tracker] terminating session for job {} before starting {}",
                    session.job_id(),
                    job_id
                );
            }
            inner.teardown(&mut state, SessionState::Stopped);
            state.session_state = SessionState::RequestingPermission;
            state.sensor_failures = 0;
            state.sensor_warning = false;
            state.generation
        };

        match inner.prepare(job_id, generation).await {
            Ok(initial) => inner.activate(job_id, generation, initial),
            Err(error) => {
                let mut state = inner.state.lock().unwrap();
                if state.generation == generation {
                    state.session_state = match &error {
                        TrackingError::Sensor(SensorError::PermissionDenied) => {
                            SessionState::PermissionDenied
                        }
                        _ => SessionState::Idle,
                    };
                }
                warn!("[tracker] cannot start tracking job {}: {}", job_id, error);
                Err(error)
            }
        }
    }

    /// Halts the watch, clears the timers and releases the keep-alive before
    /// returning. Sends already handed to the dispatcher may still complete.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.teardown(&mut state, SessionState::Stopped);
    }

    /// Job status hook, stops the session once its job is completed or
    /// cancelled.
    pub fn on_job_status_changed(&self, job_id: &str, status: JobStatus) {
        let mut state = self.inner.state.lock().unwrap();
        let tracked = state
            .session
            .as_ref()
            .is_some_and(|session| session.job_id() == job_id);
        if tracked && status.ends_tracking() {
            info!("[tracker] job {} is {}, stopping", job_id, status);
            self.inner.teardown(&mut state, SessionState::Stopped);
        }
    }

    /// In the background the position is never polled more often than the
    /// background interval. Coming back resumes the motion cadence and
    /// replays the offline queue right away.
    pub fn set_foreground(&self, foreground: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if state.foreground == foreground {
            return;
        }
        state.foreground = foreground;
        if state.session.is_none() {
            return;
        }
        state.session_state = if foreground {
            SessionState::Active
        } else {
            SessionState::Suspended
        };
        info!("[tracker] session {}", state.session_state);
        let generation = state.generation;
        self.inner.schedule_repoll(&mut state, generation);
        drop(state);

        if foreground {
            let dispatcher = self.inner.dispatcher.clone();
            tokio::spawn(async move {
                if let Err(error) = dispatcher.replay().await {
                    warn!("[tracker] replay on foreground failed: {:?}", error);
                }
            });
        }
    }

    /// One-shot reading through the same gate as the watch.
    pub async fn refresh_now(&self) -> Result<Option<LocationUpdate>, TrackingError> {
        let generation = {
            let state = self.inner.state.lock().unwrap();
            if state.session.is_none() {
                return Err(TrackingError::NoActiveSession);
            }
            state.generation
        };
        let options = SamplerOptions::probe(&self.inner.config);
        match self.inner.sampler.get_once(&options).await {
            Ok(sample) => Ok(self.inner.handle_sample(generation, sample)),
            Err(error) => {
                self.inner.handle_sensor_error(generation, error.clone());
                Err(error.into())
            }
        }
    }

    /// Whether the last emitted position is inside the arrival geofence of
    /// `destination`.
    pub fn check_arrival(&self, destination: &Point) -> bool {
        let state = self.inner.state.lock().unwrap();
        state
            .session
            .as_ref()
            .and_then(|session| session.last_emitted())
            .is_some_and(|sample| {
                check_arrival(
                    &sample.point,
                    destination,
                    self.inner.config.geofence_radius_meters,
                )
            })
    }

    pub fn status(&self) -> TrackingStatus {
        let state = self.inner.state.lock().unwrap();
        let session = state.session.as_ref();
        let last = session.and_then(|session| session.last_emitted());
        TrackingStatus {
            job_id: session.map(|session| session.job_id().to_string()),
            state: state.session_state,
            keep_alive_held: self.inner.background.is_keep_alive_held(),
            metrics: session.map(|session| session.metrics().clone()),
            last_position: last.map(|sample| sample.point),
            last_captured_at: last.map(|sample| sample.captured_at),
            current_interval_ms: session.map(|session| session.current_interval().as_millis() as u64),
            repoll_interval_ms: state
                .runtime
                .as_ref()
                .and_then(|runtime| runtime.repoll.as_ref())
                .map(|repoll| repoll.interval().as_millis() as u64),
            foreground: state.foreground,
            delivery: self.inner.dispatcher.delivery_status(),
            unsynced_updates: self.inner.dispatcher.unsynced_count(),
            sensor_warning: state.sensor_warning,
        }
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        self.inner.dispatcher.delivery_status()
    }
}

impl Inner {
    /// Ownership check and permission probe. Returns the probe reading, if
    /// the sensor produced one.
    async fn prepare(
        &self,
        job_id: &str,
        generation: u64,
    ) -> Result<Option<PositionSample>, TrackingError> {
        let grant = self
            .jobs
            .lookup(job_id)
            .await?
            .ok_or_else(|| TrackingError::NotTrackable {
                job_id: job_id.to_string(),
                status: "unknown".to_string(),
            })?;
        if !grant.owned {
            return Err(TrackingError::NotOwner(job_id.to_string()));
        }
        if !grant.status.is_en_route_eligible() {
            return Err(TrackingError::NotTrackable {
                job_id: job_id.to_string(),
                status: grant.status.to_string(),
            });
        }

        let initial = match self.sampler.get_once(&SamplerOptions::probe(&self.config)).await {
            Ok(sample) => Some(sample),
            Err(SensorError::PermissionDenied) => {
                return Err(SensorError::PermissionDenied.into());
            }
            // the watch will keep trying
            Err(error) => {
                warn!("[tracker] permission probe without a fix: {}", error);
                None
            }
        };

        if self.state.lock().unwrap().generation != generation {
            return Err(TrackingError::Cancelled);
        }
        Ok(initial)
    }

    fn activate(
        self: &Arc<Self>,
        job_id: &str,
        generation: u64,
        initial: Option<PositionSample>,
    ) -> Result<(), TrackingError> {
        let watch = match self.sampler.start_watching(SamplerOptions::watch(&self.config)) {
            Ok(watch) => watch,
            Err(error) => {
                let mut state = self.state.lock().unwrap();
                state.session_state = if error.is_fatal() {
                    SessionState::PermissionDenied
                } else {
                    SessionState::Idle
                };
                return Err(error.into());
            }
        };
        if let Err(error) = self.background.acquire_keep_alive() {
            // the watch handle is dropped here, which ends it
            self.state.lock().unwrap().session_state = SessionState::Idle;
            return Err(error.into());
        }

        let mut state = self.state.lock().unwrap();
        if state.generation != generation {
            self.background.release();
            return Err(TrackingError::Cancelled);
        }
        let cancel = CancellationToken::new();
        tokio::spawn(run_watch(
            self.clone(),
            generation,
            watch,
            cancel.child_token(),
        ));
        self.dispatcher.watch_connectivity(cancel.child_token());

        let dispatcher = self.dispatcher.clone();
        let sync = self.background.schedule_recurring(
            self.config.background_interval(),
            Arc::new(move || {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.sync_cycle().await;
                });
            }),
        );

        state.session = Some(TrackingSession::new(job_id, self.clock.now(), &self.config));
        state.runtime = Some(SessionRuntime {
            cancel,
            repoll: None,
            _sync: sync,
        });
        state.session_state = if state.foreground {
            SessionState::Active
        } else {
            SessionState::Suspended
        };
        self.schedule_repoll(&mut state, generation);
        info!("[tracker] tracking job {} ({})", job_id, state.session_state);
        drop(state);

        if let Some(sample) = initial {
            self.handle_sample(generation, sample);
        }
        Ok(())
    }

    /// Ends the current session, if any, and moves to `final_state`.
    fn teardown(&self, state: &mut TrackerState, final_state: SessionState) {
        state.generation += 1;
        let had_session = state.session.is_some();
        if let Some(mut session) = state.session.take() {
            session.deactivate();
            info!(
                "[tracker] session for job {} ended, {:.0} m driven, score {}",
                session.job_id(),
                session.metrics().total_distance_meters,
                session.metrics().score
            );
        }
        if let Some(runtime) = state.runtime.take() {
            runtime.cancel.cancel();
            // dropping the handles cancels both timers
        }
        self.background.release();
        if had_session || state.session_state == SessionState::RequestingPermission {
            state.session_state = final_state;
        }

        if let Some(recorder) = self.recorder.lock().unwrap().as_mut() {
            if let Err(error) = recorder.flush() {
                warn!("[tracker] failed to flush raw data: {:?}", error);
            }
        }
    }

    fn effective_interval(&self, state: &TrackerState) -> Option<Duration> {
        let interval = state.session.as_ref()?.current_interval();
        if state.foreground {
            Some(interval)
        } else {
            Some(interval.max(self.config.background_interval()))
        }
    }

    fn schedule_repoll(self: &Arc<Self>, state: &mut TrackerState, generation: u64) {
        let Some(interval) = self.effective_interval(state) else {
            return;
        };
        let Some(runtime) = state.runtime.as_mut() else {
            return;
        };
        if runtime
            .repoll
            .as_ref()
            .is_some_and(|repoll| repoll.interval() == interval)
        {
            return;
        }
        debug!("[tracker] repolling every {:?}", interval);
        let inner = self.clone();
        runtime.repoll = Some(self.background.schedule_recurring(
            interval,
            Arc::new(move || {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.repoll(generation).await;
                });
            }),
        ));
    }

    async fn repoll(self: Arc<Self>, generation: u64) {
        let options = {
            let state = self.state.lock().unwrap();
            if state.generation != generation {
                return;
            }
            let Some(session) = state.session.as_ref() else {
                return;
            };
            SamplerOptions::repoll(
                &self.config,
                self.effective_interval(&state)
                    .unwrap_or_else(|| session.current_interval()),
                session.is_moving(),
            )
        };
        match self.sampler.get_once(&options).await {
            Ok(sample) => {
                self.handle_sample(generation, sample);
            }
            Err(error) => {
                self.handle_sensor_error(generation, error);
            }
        }
    }

    /// Runs one raw sample through the session. Results for a session that
    /// has been stopped in the meantime are dropped.
    fn handle_sample(
        self: &Arc<Self>,
        generation: u64,
        sample: PositionSample,
    ) -> Option<LocationUpdate> {
        let mut state = self.state.lock().unwrap();
        if state.generation != generation {
            debug!("[tracker] dropping sample for a stopped session");
            return None;
        }
        let ingested = state.session.as_mut()?.ingest(&sample)?;
        state.sensor_failures = 0;
        state.sensor_warning = false;

        if let Some(recorder) = self.recorder.lock().unwrap().as_mut() {
            if let Err(error) = recorder.record(&sample, ingested.outcome.result) {
                warn!("[tracker] failed to record raw sample: {:?}", error);
            }
        }
        if ingested.outcome.new_interval.is_some() {
            self.schedule_repoll(&mut state, generation);
        }
        drop(state);

        if let Some(update) = &ingested.update {
            self.dispatcher.send(update.clone());
        }
        ingested.update
    }

    /// Sensor errors never propagate out of the sampling loop. Returns true
    /// when the session had to end.
    fn handle_sensor_error(&self, generation: u64, error: SensorError) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.generation != generation {
            return true;
        }
        if error.is_fatal() {
            error!("[tracker] location permission revoked, stopping session");
            self.teardown(&mut state, SessionState::PermissionDenied);
            return true;
        }
        state.sensor_failures += 1;
        if state.sensor_failures >= self.config.max_sensor_retries && !state.sensor_warning {
            warn!(
                "[tracker] sensor failed {} times in a row: {}",
                state.sensor_failures, error
            );
            state.sensor_warning = true;
        } else {
            debug!("[tracker] sensor error: {}", error);
        }
        false
    }
}

async fn run_watch(
    inner: Arc<Inner>,
    generation: u64,
    mut watch: WatchHandle,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = watch.recv() => event,
        };
        match event {
            None => break,
            Some(WatchEvent::Sample(sample)) => {
                inner.handle_sample(generation, sample);
            }
            Some(WatchEvent::Error(error)) => {
                if inner.handle_sensor_error(generation, error) {
                    break;
                }
            }
        }
    }
    watch.stop();
}
