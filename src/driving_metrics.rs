use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{AccelerationTimebase, TrackingConfig};
use crate::gps_processor::PositionSample;

pub const MAX_SCORE: u8 = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrivingMetrics {
    pub current_speed_kmh: f64,
    /// m/s²
    pub instantaneous_acceleration: f64,
    pub harsh_braking_count: u32,
    pub harsh_acceleration_count: u32,
    /// Trip grade in [0, 100]. Only goes down within a session.
    pub score: u8,
    pub total_distance_meters: f64,
    pub average_speed_kmh: f64,
}

impl Default for DrivingMetrics {
    fn default() -> Self {
        DrivingMetrics {
            current_speed_kmh: 0.0,
            instantaneous_acceleration: 0.0,
            harsh_braking_count: 0,
            harsh_acceleration_count: 0,
            score: MAX_SCORE,
            total_distance_meters: 0.0,
            average_speed_kmh: 0.0,
        }
    }
}

fn mps_to_kmh(speed: f64) -> f64 {
    speed * 3.6
}

/// Per-session driving behavior. Every raw sample goes through `record`,
/// only gated samples contribute distance via `add_distance`.
pub struct DrivingMetricsCalculator {
    harsh_threshold: f64,
    braking_penalty: u8,
    acceleration_penalty: u8,
    timebase: AccelerationTimebase,
    nominal_tick: Duration,
    metrics: DrivingMetrics,
    last_speed: f64,
    last_captured_at: Option<DateTime<Utc>>,
    speed_sum: f64,
    speed_samples: u64,
}

impl DrivingMetricsCalculator {
    pub fn new(config: &TrackingConfig) -> Self {
        DrivingMetricsCalculator {
            harsh_threshold: config.harsh_threshold_mps2,
            braking_penalty: config.harsh_braking_penalty,
            acceleration_penalty: config.harsh_acceleration_penalty,
            timebase: config.acceleration_timebase,
            nominal_tick: config.update_interval(),
            metrics: DrivingMetrics::default(),
            last_speed: 0.0,
            last_captured_at: None,
            speed_sum: 0.0,
            speed_samples: 0,
        }
    }

    pub fn metrics(&self) -> &DrivingMetrics {
        &self.metrics
    }

    pub fn last_speed(&self) -> f64 {
        self.last_speed
    }

    /// Feed a raw sample, using the speed of the previous sample as baseline.
    pub fn record(&mut self, sample: &PositionSample) -> &DrivingMetrics {
        let previous_speed = self.last_speed;
        self.update(sample, previous_speed)
    }

    pub fn update(&mut self, sample: &PositionSample, previous_speed: f64) -> &DrivingMetrics {
        let speed = sample.speed_or_zero();
        self.metrics.current_speed_kmh = mps_to_kmh(speed);
        self.speed_sum += speed;
        self.speed_samples += 1;
        self.metrics.average_speed_kmh = mps_to_kmh(self.speed_sum / self.speed_samples as f64);

        let elapsed_secs = self
            .last_captured_at
            .map(|last| (sample.captured_at - last).num_milliseconds() as f64 / 1000.0);
        match elapsed_secs {
            // first sample of the session: nothing to compare against
            None => self.advance(sample, speed),
            Some(elapsed) if elapsed <= 0.0 => {
                debug!(
                    "[driving_metrics] skipping acceleration, elapsed {}s since previous sample",
                    elapsed
                );
            }
            Some(elapsed) => {
                let time_delta = match self.timebase {
                    AccelerationTimebase::Elapsed => elapsed,
                    AccelerationTimebase::NominalTick => self.nominal_tick.as_secs_f64(),
                };
                let acceleration = (speed - previous_speed) / time_delta;
                self.metrics.instantaneous_acceleration = acceleration;
                if acceleration < -self.harsh_threshold {
                    self.metrics.harsh_braking_count += 1;
                    self.metrics.score = self.metrics.score.saturating_sub(self.braking_penalty);
                    info!(
                        "[driving_metrics] harsh braking {:.1} m/s², score {}",
                        acceleration, self.metrics.score
                    );
                } else if acceleration > self.harsh_threshold {
                    self.metrics.harsh_acceleration_count += 1;
                    self.metrics.score =
                        self.metrics.score.saturating_sub(self.acceleration_penalty);
                    info!(
                        "[driving_metrics] harsh acceleration {:.1} m/s², score {}",
                        acceleration, self.metrics.score
                    );
                }
                self.advance(sample, speed);
            }
        }
        &self.metrics
    }

    fn advance(&mut self, sample: &PositionSample, speed: f64) {
        self.last_speed = speed;
        self.last_captured_at = Some(sample.captured_at);
    }

    pub fn add_distance(&mut self, meters: f64) {
        self.metrics.total_distance_meters += meters;
    }

    pub fn reset(&mut self) {
        self.metrics = DrivingMetrics::default();
        self.last_speed = 0.0;
        self.last_captured_at = None;
        self.speed_sum = 0.0;
        self.speed_samples = 0;
    }
}
