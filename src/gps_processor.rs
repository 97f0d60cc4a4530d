use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::TrackingConfig;

const EARTH_RADIUS: f64 = 6371000.0; // unit: meter

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Point {
            latitude,
            longitude,
        }
    }

    // great-circle distance in meters
    pub fn haversine_distance(&self, other: &Point) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let delta_phi = (other.latitude - self.latitude).to_radians();
        let delta_lambda = (other.longitude - self.longitude).to_radians();

        let a = (delta_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS * c
    }
}

/// One sensor reading. Produced by the sampler and never mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionSample {
    pub point: Point,
    /// meters
    pub accuracy: Option<f64>,
    /// m/s
    pub speed: Option<f64>,
    /// degrees
    pub heading: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl PositionSample {
    pub fn speed_or_zero(&self) -> f64 {
        // platforms report -1 or NaN when the speed is unknown
        match self.speed {
            Some(speed) if speed.is_finite() && speed > 0.0 => speed,
            _ => 0.0,
        }
    }

    pub fn confidence(&self) -> Confidence {
        Confidence::from_accuracy(self.accuracy)
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
    VeryLow,
}

impl Confidence {
    /// Informational only: a low confidence sample is still emitted.
    pub fn from_accuracy(accuracy: Option<f64>) -> Confidence {
        match accuracy {
            Some(accuracy) if accuracy <= 5.0 => Confidence::High,
            Some(accuracy) if accuracy <= 20.0 => Confidence::Medium,
            Some(accuracy) if accuracy <= 50.0 => Confidence::Low,
            _ => Confidence::VeryLow,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ProcessResult {
    /// No previous emitted position, always emitted.
    First = 0,
    Emit = 1,
    // negative values are for samples that never become a `LocationUpdate`.
    Ignore = -1,
}

impl From<i8> for ProcessResult {
    fn from(i: i8) -> Self {
        match i {
            0 => ProcessResult::First,
            1 => ProcessResult::Emit,
            -1 => ProcessResult::Ignore,
            _ => panic!("invalid `ProcessResult`"),
        }
    }
}

impl ProcessResult {
    pub fn to_int(&self) -> i8 {
        *self as i8
    }

    pub fn is_emitted(&self) -> bool {
        *self != ProcessResult::Ignore
    }
}

/// Minimum-distance filter shared by the update scheduler and the route
/// engine. The only state is the last accepted point.
#[derive(Clone, Debug)]
pub struct DistanceGate {
    min_distance_m: f64,
    last_accepted: Option<Point>,
}

impl DistanceGate {
    pub fn new(min_distance_m: f64) -> Self {
        DistanceGate {
            min_distance_m,
            last_accepted: None,
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(config.min_distance_change_meters)
    }

    pub fn min_distance(&self) -> f64 {
        self.min_distance_m
    }

    pub fn last_accepted(&self) -> Option<&Point> {
        self.last_accepted.as_ref()
    }

    /// Returns the decision and the distance from the last accepted point
    /// (0 for the first one) without changing state.
    pub fn check(&self, point: &Point) -> (ProcessResult, f64) {
        match &self.last_accepted {
            None => (ProcessResult::First, 0.0),
            Some(last) => {
                let distance = last.haversine_distance(point);
                if distance >= self.min_distance_m {
                    (ProcessResult::Emit, distance)
                } else {
                    (ProcessResult::Ignore, distance)
                }
            }
        }
    }

    /// `check` and, when accepted, remember `point` as the new reference.
    pub fn offer(&mut self, point: &Point) -> (ProcessResult, f64) {
        let (result, distance) = self.check(point);
        if result.is_emitted() {
            self.last_accepted = Some(*point);
        }
        (result, distance)
    }

    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MotionState {
    Stationary,
    Moving,
    HighSpeed,
}

#[derive(Clone, Debug)]
pub struct CadencePolicy {
    pub baseline: Duration,
    pub stationary: Duration,
    pub high_speed: Duration,
    pub moving_threshold_mps: f64,
    pub high_speed_threshold_mps: f64,
    pub hysteresis: Duration,
}

impl CadencePolicy {
    pub fn from_config(config: &TrackingConfig) -> Self {
        CadencePolicy {
            baseline: Duration::from_millis(config.update_interval_ms),
            stationary: Duration::from_millis(config.stationary_interval_ms),
            high_speed: Duration::from_millis(config.high_speed_interval_ms),
            moving_threshold_mps: config.moving_threshold_mps,
            high_speed_threshold_mps: config.high_speed_threshold_mps,
            hysteresis: Duration::from_millis(config.interval_hysteresis_ms),
        }
    }

    pub fn classify(&self, speed_mps: f64) -> MotionState {
        if speed_mps <= self.moving_threshold_mps {
            MotionState::Stationary
        } else if speed_mps > self.high_speed_threshold_mps {
            MotionState::HighSpeed
        } else {
            MotionState::Moving
        }
    }

    pub fn interval_for(&self, motion: MotionState) -> Duration {
        match motion {
            MotionState::Stationary => self.stationary,
            MotionState::Moving => self.baseline,
            MotionState::HighSpeed => self.high_speed,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleOutcome {
    pub result: ProcessResult,
    /// Distance from the previously emitted sample, 0 for the first one.
    pub moved_m: f64,
    /// Set when the sample was accepted and the repoll cadence must change.
    pub new_interval: Option<Duration>,
}

/// Decides per sample whether it becomes a `LocationUpdate`, and at which
/// cadence the position should be polled next.
pub struct AdaptiveScheduler {
    gate: DistanceGate,
    policy: CadencePolicy,
    current_interval: Duration,
    last_emitted: Option<PositionSample>,
}

impl AdaptiveScheduler {
    pub fn new(config: &TrackingConfig) -> Self {
        let policy = CadencePolicy::from_config(config);
        AdaptiveScheduler {
            gate: DistanceGate::from_config(config),
            current_interval: policy.baseline,
            policy,
            last_emitted: None,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn last_emitted(&self) -> Option<&PositionSample> {
        self.last_emitted.as_ref()
    }

    pub fn policy(&self) -> &CadencePolicy {
        &self.policy
    }

    pub fn is_moving(&self, speed_mps: f64) -> bool {
        self.policy.classify(speed_mps) != MotionState::Stationary
    }

    pub fn preprocess(&mut self, sample: &PositionSample) -> ScheduleOutcome {
        // a cached fix older than what was already emitted, e.g. from a repoll
        if let Some(last) = &self.last_emitted {
            let time_diff_in_ms = (sample.captured_at - last.captured_at).num_milliseconds();
            if time_diff_in_ms < 0 {
                debug!(
                    "[scheduler] ignoring sample captured {} ms before the last emitted one",
                    -time_diff_in_ms
                );
                return ScheduleOutcome {
                    result: ProcessResult::Ignore,
                    moved_m: 0.0,
                    new_interval: None,
                };
            }
        }
        let (result, moved_m) = self.gate.offer(&sample.point);
        if !result.is_emitted() {
            return ScheduleOutcome {
                result,
                moved_m,
                new_interval: None,
            };
        }
        self.last_emitted = Some(sample.clone());

        let motion = self.policy.classify(sample.speed_or_zero());
        let candidate = self.policy.interval_for(motion);
        let delta = if candidate > self.current_interval {
            candidate - self.current_interval
        } else {
            self.current_interval - candidate
        };
        let new_interval = if delta > self.policy.hysteresis {
            debug!(
                "[scheduler] {} -> cadence {:?} (was {:?})",
                motion, candidate, self.current_interval
            );
            self.current_interval = candidate;
            Some(candidate)
        } else {
            None
        };

        ScheduleOutcome {
            result,
            moved_m,
            new_interval,
        }
    }
}
