use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// How the metrics calculator turns a speed delta into an acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccelerationTimebase {
    /// Divide by the time elapsed between the two samples' capture times.
    Elapsed,
    /// Divide by the baseline cadence (`update_interval_ms`), regardless of
    /// when the samples were captured.
    NominalTick,
}

/// Tunables of the tracking engine. Every field has a default taken from the
/// production deployment, so a config file only needs the keys it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackingConfig {
    pub min_distance_change_meters: f64,
    /// Baseline cadence while moving at normal speed.
    pub update_interval_ms: u64,
    pub stationary_interval_ms: u64,
    pub high_speed_interval_ms: u64,
    pub moving_threshold_mps: f64,
    pub high_speed_threshold_mps: f64,
    /// A new cadence is only applied when it differs from the current one by
    /// more than this.
    pub interval_hysteresis_ms: u64,
    /// Ceiling for the repoll timer while backgrounded, and the period of the
    /// offline queue replay.
    pub background_interval_ms: u64,
    pub sensor_timeout_ms: u64,
    pub sensor_retry_backoff_ms: u64,
    pub max_sensor_retries: u32,
    pub offline_queue_capacity: usize,
    pub delayed_after_sync_cycles: u32,
    pub harsh_threshold_mps2: f64,
    pub harsh_braking_penalty: u8,
    pub harsh_acceleration_penalty: u8,
    pub acceleration_timebase: AccelerationTimebase,
    pub geofence_radius_meters: f64,
    pub trail_capacity: usize,
    pub high_accuracy: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_distance_change_meters: 3.0,
            update_interval_ms: 2000,
            stationary_interval_ms: 30_000,
            high_speed_interval_ms: 1000,
            moving_threshold_mps: 1.0,
            high_speed_threshold_mps: 15.0,
            interval_hysteresis_ms: 2000,
            background_interval_ms: 15_000,
            sensor_timeout_ms: 15_000,
            sensor_retry_backoff_ms: 5000,
            max_sensor_retries: 5,
            offline_queue_capacity: 100,
            delayed_after_sync_cycles: 3,
            harsh_threshold_mps2: 3.0,
            harsh_braking_penalty: 5,
            harsh_acceleration_penalty: 3,
            acceleration_timebase: AccelerationTimebase::Elapsed,
            geofence_radius_meters: 50.0,
            trail_capacity: 50,
            high_accuracy: true,
        }
    }
}

impl TrackingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read tracking config {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackingConfig =
            serde_json::from_str(json).context("malformed tracking config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_distance_change_meters >= 0.0) {
            bail!(
                "minDistanceChangeMeters must be non-negative, got {}",
                self.min_distance_change_meters
            );
        }
        for (name, value) in [
            ("updateIntervalMs", self.update_interval_ms),
            ("stationaryIntervalMs", self.stationary_interval_ms),
            ("highSpeedIntervalMs", self.high_speed_interval_ms),
            ("backgroundIntervalMs", self.background_interval_ms),
            ("sensorTimeoutMs", self.sensor_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        if self.moving_threshold_mps > self.high_speed_threshold_mps {
            bail!(
                "movingThresholdMps ({}) is above highSpeedThresholdMps ({})",
                self.moving_threshold_mps,
                self.high_speed_threshold_mps
            );
        }
        if self.offline_queue_capacity == 0 {
            bail!("offlineQueueCapacity must be positive");
        }
        if self.trail_capacity == 0 {
            bail!("trailCapacity must be positive");
        }
        Ok(())
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_timeout_ms)
    }

    pub fn sensor_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sensor_retry_backoff_ms)
    }
}
