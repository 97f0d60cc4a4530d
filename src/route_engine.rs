use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::config::TrackingConfig;
use crate::error::RoutingError;
use crate::gps_processor::{DistanceGate, Point};
use crate::job::JobStatus;
use crate::utils::{BoxFuture, Clock};
use crate::wire::LocationUpdate;

#[derive(Clone, Debug, PartialEq)]
pub struct RouteRequest {
    pub origin: Point,
    pub destination: Point,
    pub depart_at: DateTime<Utc>,
    /// Ask for the duration in current traffic as well.
    pub traffic_aware: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub distance_meters: f64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_in_traffic_seconds: Option<f64>,
}

/// The external routing capability.
pub trait RoutingProvider: Send + Sync {
    fn supports_traffic(&self) -> bool {
        false
    }

    fn compute_route(&self, request: RouteRequest) -> BoxFuture<Result<RouteResponse, RoutingError>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub duration_in_traffic_seconds: Option<f64>,
    pub origin_label: String,
    pub destination_label: String,
}

impl RouteInfo {
    /// Whole minutes, rounded up. Uses the traffic duration when there is one.
    pub fn eta_minutes(&self) -> u32 {
        let seconds = self
            .duration_in_traffic_seconds
            .unwrap_or(self.duration_seconds)
            .max(0.0);
        (seconds / 60.0).ceil() as u32
    }

    pub fn traffic_delay_minutes(&self) -> Option<f64> {
        self.duration_in_traffic_seconds
            .map(|in_traffic| (in_traffic - self.duration_seconds) / 60.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Destination {
    pub point: Point,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaUpdate {
    pub job_id: String,
    pub eta_minutes: u32,
    pub distance_meters: f64,
    pub traffic_delay_minutes: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteEvent {
    EtaChanged { eta: EtaUpdate, route: RouteInfo },
    /// Recomputation failed. The previous route and ETA are still valid.
    Warning { job_id: String, error: RoutingError },
}

fn coordinate_label(point: &Point) -> String {
    format!("{:.5}, {:.5}", point.latitude, point.longitude)
}

/// Single route computation, no state involved.
pub async fn compute_route(
    provider: &dyn RoutingProvider,
    origin: Point,
    destination: &Destination,
    depart_at: DateTime<Utc>,
) -> Result<RouteInfo, RoutingError> {
    let response = provider
        .compute_route(RouteRequest {
            origin,
            destination: destination.point,
            depart_at,
            traffic_aware: provider.supports_traffic(),
        })
        .await?;
    if !response.distance_meters.is_finite() || !response.duration_seconds.is_finite() {
        return Err(RoutingError::NoRoute);
    }
    Ok(RouteInfo {
        distance_meters: response.distance_meters,
        duration_seconds: response.duration_seconds,
        duration_in_traffic_seconds: response
            .duration_in_traffic_seconds
            .filter(|seconds| seconds.is_finite()),
        origin_label: coordinate_label(&origin),
        destination_label: destination.label.clone(),
    })
}

struct EngineState {
    job_id: Option<String>,
    destination: Option<Destination>,
    status: JobStatus,
    gate: DistanceGate,
    last_captured_at: Option<DateTime<Utc>>,
    // sequence of the last request started / the newest one applied
    requested: u64,
    applied: u64,
    route: Option<RouteInfo>,
    eta: Option<EtaUpdate>,
    computations: u64,
}

/// Observer-side ETA tracking for one job. Position updates go in, ETA
/// events come out on a broadcast channel.
pub struct RouteEngine {
    provider: Arc<dyn RoutingProvider>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<RouteEvent>,
    state: Arc<Mutex<EngineState>>,
}

impl RouteEngine {
    pub fn new(
        provider: Arc<dyn RoutingProvider>,
        clock: Arc<dyn Clock>,
        config: &TrackingConfig,
    ) -> Self {
        RouteEngine {
            provider,
            clock,
            events: broadcast::channel(64).0,
            state: Arc::new(Mutex::new(EngineState {
                job_id: None,
                destination: None,
                status: JobStatus::Pending,
                gate: DistanceGate::from_config(config),
                last_captured_at: None,
                requested: 0,
                applied: 0,
                route: None,
                eta: None,
                computations: 0,
            })),
        }
    }

    /// Start following `job_id`. Clears everything learned about a previous
    /// job.
    pub fn set_job(&self, job_id: &str, destination: Destination, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        state.job_id = Some(job_id.to_string());
        state.destination = Some(destination);
        state.status = status;
        state.gate.reset();
        state.last_captured_at = None;
        // anything still in flight belongs to the old job
        state.applied = state.requested;
        state.route = None;
        state.eta = None;
    }

    pub fn set_status(&self, status: JobStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    pub fn last_route(&self) -> Option<RouteInfo> {
        self.state.lock().unwrap().route.clone()
    }

    pub fn last_eta(&self) -> Option<EtaUpdate> {
        self.state.lock().unwrap().eta.clone()
    }

    /// Number of route computations started so far.
    pub fn computations(&self) -> u64 {
        self.state.lock().unwrap().computations
    }

    /// Feed one received position. Returns whether a recomputation was
    /// started. The same update arriving twice, a job that is not en route,
    /// or movement below the gate never triggers one.
    pub fn on_location(&self, update: &LocationUpdate) -> bool {
        let (origin, sequence, job_id, destination) = {
            let mut state = self.state.lock().unwrap();
            if state.job_id.as_deref() != Some(update.job_id.as_str()) {
                return false;
            }
            if state
                .last_captured_at
                .is_some_and(|last| update.captured_at <= last)
            {
                return false;
            }
            state.last_captured_at = Some(update.captured_at);
            if !state.status.is_en_route_eligible() {
                return false;
            }
            let Some(destination) = state.destination.clone() else {
                return false;
            };
            let origin = update.point();
            let (result, _) = state.gate.offer(&origin);
            if !result.is_emitted() {
                return false;
            }
            state.requested += 1;
            state.computations += 1;
            (origin, state.requested, update.job_id.clone(), destination)
        };

        let provider = self.provider.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let result = compute_route(provider.as_ref(), origin, &destination, clock.now()).await;
            let mut state = state.lock().unwrap();
            if sequence <= state.applied {
                debug!("[route] dropping stale route result #{}", sequence);
                return;
            }
            match result {
                Ok(route) => {
                    state.applied = sequence;
                    let eta = EtaUpdate {
                        job_id,
                        eta_minutes: route.eta_minutes(),
                        distance_meters: route.distance_meters,
                        traffic_delay_minutes: route.traffic_delay_minutes(),
                        computed_at: clock.now(),
                    };
                    debug!(
                        "[route] eta {} min, {:.0} m to go",
                        eta.eta_minutes, eta.distance_meters
                    );
                    state.route = Some(route.clone());
                    state.eta = Some(eta.clone());
                    let _ = events.send(RouteEvent::EtaChanged { eta, route });
                }
                Err(error) => {
                    warn!("[route] recomputation failed, keeping last eta: {}", error);
                    let _ = events.send(RouteEvent::Warning { job_id, error });
                }
            }
        });
        true
    }
}

/// Offline routing: great-circle distance at a fixed average speed, with an
/// optional factor applied for the in-traffic duration.
pub struct StraightLineRouter {
    average_speed_mps: f64,
    traffic_factor: Option<f64>,
}

impl StraightLineRouter {
    pub fn new(average_speed_mps: f64, traffic_factor: Option<f64>) -> Self {
        StraightLineRouter {
            average_speed_mps,
            traffic_factor,
        }
    }
}

impl RoutingProvider for StraightLineRouter {
    fn supports_traffic(&self) -> bool {
        self.traffic_factor.is_some()
    }

    fn compute_route(&self, request: RouteRequest) -> BoxFuture<Result<RouteResponse, RoutingError>> {
        let result = if self.average_speed_mps <= 0.0 {
            Err(RoutingError::Unavailable("average speed must be positive".to_string()))
        } else {
            let distance_meters = request.origin.haversine_distance(&request.destination);
            let duration_seconds = distance_meters / self.average_speed_mps;
            Ok(RouteResponse {
                distance_meters,
                duration_seconds,
                duration_in_traffic_seconds: self
                    .traffic_factor
                    .filter(|_| request.traffic_aware)
                    .map(|factor| duration_seconds * factor),
            })
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(duration: f64, in_traffic: Option<f64>) -> RouteInfo {
        RouteInfo {
            distance_meters: 1000.0,
            duration_seconds: duration,
            duration_in_traffic_seconds: in_traffic,
            origin_label: String::new(),
            destination_label: String::new(),
        }
    }

    #[test]
    fn eta_rounds_up() {
        assert_eq!(route(61.0, None).eta_minutes(), 2);
        assert_eq!(route(120.0, None).eta_minutes(), 2);
        assert_eq!(route(0.0, None).eta_minutes(), 0);
        assert_eq!(route(100.0, Some(301.0)).eta_minutes(), 6);
    }

    #[test]
    fn traffic_delay() {
        assert_eq!(route(600.0, Some(900.0)).traffic_delay_minutes(), Some(5.0));
        assert_eq!(route(600.0, None).traffic_delay_minutes(), None);
    }

    #[tokio::test]
    async fn straight_line_without_traffic() {
        let router = StraightLineRouter::new(10.0, None);
        let destination = Destination {
            point: Point::new(0.0, 0.01),
            label: "Customer".to_string(),
        };
        let info = compute_route(&router, Point::new(0.0, 0.0), &destination, Utc::now())
            .await
            .unwrap();
        assert!((info.distance_meters - 1111.95).abs() < 0.1);
        assert!(info.duration_in_traffic_seconds.is_none());
        assert_eq!(info.destination_label, "Customer");
        assert_eq!(info.origin_label, "0.00000, 0.00000");
    }
}
