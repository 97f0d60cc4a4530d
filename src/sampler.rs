use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TrackingConfig;
use crate::error::SensorError;
use crate::gps_processor::PositionSample;
use crate::utils::BoxFuture;

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AccuracyTier {
    Navigation,
    Balanced,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerOptions {
    pub accuracy: AccuracyTier,
    /// Minimum time between two samples.
    pub min_interval: Duration,
    /// Minimum distance between two samples, in meters.
    pub min_distance_m: f64,
    /// Oldest cached reading the platform may hand back, zero means always
    /// fresh.
    pub max_age: Duration,
    pub timeout: Duration,
}

impl SamplerOptions {
    /// Continuous watch while a session is active.
    pub fn watch(config: &TrackingConfig) -> Self {
        SamplerOptions {
            accuracy: if config.high_accuracy {
                AccuracyTier::Navigation
            } else {
                AccuracyTier::Balanced
            },
            min_interval: config.update_interval(),
            min_distance_m: config.min_distance_change_meters,
            max_age: Duration::ZERO,
            timeout: config.sensor_timeout(),
        }
    }

    /// One-shot reading used to probe the permission before a session starts.
    pub fn probe(config: &TrackingConfig) -> Self {
        SamplerOptions {
            accuracy: AccuracyTier::Navigation,
            min_interval: Duration::ZERO,
            min_distance_m: 0.0,
            max_age: Duration::ZERO,
            timeout: config.sensor_timeout(),
        }
    }

    /// One-shot reading for the repoll timer. Slow cadences accept an older
    /// cached fix.
    pub fn repoll(config: &TrackingConfig, interval: Duration, moving: bool) -> Self {
        SamplerOptions {
            accuracy: if moving {
                AccuracyTier::Navigation
            } else {
                AccuracyTier::Balanced
            },
            min_interval: interval,
            min_distance_m: 0.0,
            max_age: if interval > Duration::from_secs(10) {
                Duration::from_secs(30)
            } else {
                Duration::from_secs(5)
            },
            timeout: Duration::from_secs(10).min(config.sensor_timeout()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SensorEvent {
    Sample(PositionSample),
    Error(SensorError),
}

/// Handed to the platform when a watch starts. Pushing never fails or
/// panics, a closed watch simply drops what it receives.
#[derive(Clone)]
pub struct SampleSink {
    tx: mpsc::UnboundedSender<SensorEvent>,
}

impl SampleSink {
    pub fn push_sample(&self, sample: PositionSample) {
        if self.tx.send(SensorEvent::Sample(sample)).is_err() {
            debug!("[sampler] watch closed, dropping sample");
        }
    }

    pub fn push_error(&self, error: SensorError) {
        if self.tx.send(SensorEvent::Error(error)).is_err() {
            debug!("[sampler] watch closed, dropping error");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub type WatchId = u64;

/// The platform's continuous position sensing capability. Each target
/// provides one adapter.
pub trait PositionProvider: Send + Sync + 'static {
    fn start_watch(&self, options: &SamplerOptions, sink: SampleSink)
        -> Result<WatchId, SensorError>;

    fn clear_watch(&self, id: WatchId);

    fn get_once(&self, options: &SamplerOptions) -> BoxFuture<Result<PositionSample, SensorError>>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Sample(PositionSample),
    Error(SensorError),
}

/// A running watch. Samples and errors arrive on separate channels so an
/// error never ends the sample stream; only a fatal error or `stop` does.
pub struct WatchHandle {
    samples: mpsc::UnboundedReceiver<PositionSample>,
    errors: mpsc::UnboundedReceiver<SensorError>,
    cancel: CancellationToken,
}

impl WatchHandle {
    /// Next sample or error, errors first. `None` once the watch is over.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        tokio::select! {
            biased;
            Some(error) = self.errors.recv() => Some(WatchEvent::Error(error)),
            sample = self.samples.recv() => sample.map(WatchEvent::Sample),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct GeolocationSampler {
    provider: Arc<dyn PositionProvider>,
    retry_backoff: Duration,
    max_restarts: u32,
}

impl GeolocationSampler {
    pub fn new(provider: Arc<dyn PositionProvider>, config: &TrackingConfig) -> Self {
        GeolocationSampler {
            provider,
            retry_backoff: config.sensor_retry_backoff(),
            max_restarts: config.max_sensor_retries,
        }
    }

    pub async fn get_once(&self, options: &SamplerOptions) -> Result<PositionSample, SensorError> {
        match tokio::time::timeout(options.timeout, self.provider.get_once(options)).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::Timeout),
        }
    }

    /// Nothing is sensed until this is called. Calling it again after the
    /// previous handle is stopped starts a fresh watch.
    pub fn start_watching(&self, options: SamplerOptions) -> Result<WatchHandle, SensorError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let sink = SampleSink { tx: raw_tx };
        let watch_id = self.provider.start_watch(&options, sink.clone())?;
        info!(
            "[sampler] watch {} started ({}, every {:?})",
            watch_id, options.accuracy, options.min_interval
        );

        let (samples_tx, samples) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let restart = RestartPolicy {
            backoff: self.retry_backoff,
            max_attempts: self.max_restarts,
        };
        tokio::spawn(supervise(
            self.provider.clone(),
            options,
            watch_id,
            sink,
            raw_rx,
            samples_tx,
            errors_tx,
            cancel.clone(),
            restart,
        ));

        Ok(WatchHandle {
            samples,
            errors,
            cancel,
        })
    }
}

#[derive(Copy, Clone)]
struct RestartPolicy {
    backoff: Duration,
    max_attempts: u32,
}

/// Brings a timed out watch back. Every failed attempt is reported and
/// retried after the backoff. Gives up on a fatal error, on cancellation or
/// once the attempts are used up.
async fn restart_watch(
    provider: &dyn PositionProvider,
    options: &SamplerOptions,
    sink: &SampleSink,
    errors_tx: &mpsc::UnboundedSender<SensorError>,
    cancel: &CancellationToken,
    policy: RestartPolicy,
) -> Option<WatchId> {
    for attempt in 1..=policy.max_attempts.max(1) {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(policy.backoff) => {}
        }
        match provider.start_watch(options, sink.clone()) {
            Ok(id) => {
                info!("[sampler] watch restarted as {} (attempt {})", id, attempt);
                return Some(id);
            }
            Err(error) if error.is_fatal() => {
                let _ = errors_tx.send(error);
                return None;
            }
            Err(error) => {
                warn!("[sampler] restart attempt {} failed: {}", attempt, error);
                let _ = errors_tx.send(error);
            }
        }
    }
    error!(
        "[sampler] giving up on the watch after {} restart attempts",
        policy.max_attempts
    );
    None
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    provider: Arc<dyn PositionProvider>,
    options: SamplerOptions,
    mut watch_id: WatchId,
    sink: SampleSink,
    mut raw_rx: mpsc::UnboundedReceiver<SensorEvent>,
    samples_tx: mpsc::UnboundedSender<PositionSample>,
    errors_tx: mpsc::UnboundedSender<SensorError>,
    cancel: CancellationToken,
    restart: RestartPolicy,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = raw_rx.recv() => event,
        };
        match event {
            None => break,
            Some(SensorEvent::Sample(sample)) => {
                if samples_tx.send(sample).is_err() {
                    break;
                }
            }
            Some(SensorEvent::Error(error)) => {
                let _ = errors_tx.send(error.clone());
                match error {
                    SensorError::PermissionDenied => {
                        warn!("[sampler] permission revoked, ending watch {}", watch_id);
                        break;
                    }
                    SensorError::PositionUnavailable(reason) => {
                        warn!("[sampler] position unavailable: {}", reason);
                    }
                    SensorError::Timeout => {
                        warn!(
                            "[sampler] watch {} timed out, restarting in {:?}",
                            watch_id, restart.backoff
                        );
                        provider.clear_watch(watch_id);
                        match restart_watch(
                            provider.as_ref(),
                            &options,
                            &sink,
                            &errors_tx,
                            &cancel,
                            restart,
                        )
                        .await
                        {
                            Some(id) => watch_id = id,
                            // nothing left to clear
                            None => return,
                        }
                    }
                }
            }
        }
    }
    provider.clear_watch(watch_id);
    debug!("[sampler] watch {} cleared", watch_id);
}
