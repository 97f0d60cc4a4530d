pub mod test_utils;

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use test_utils::*;
use trackpro_core::config::TrackingConfig;
use trackpro_core::error::RoutingError;
use trackpro_core::job::JobStatus;
use trackpro_core::live_map::LiveMapState;
use trackpro_core::route_engine::{
    Destination, RouteEngine, RouteEvent, RouteRequest, RouteResponse, RoutingProvider,
    StraightLineRouter,
};
use trackpro_core::utils::{BoxFuture, ManualClock};

#[derive(Default)]
struct ScriptedRouter {
    requests: Mutex<Vec<RouteRequest>>,
    responses: Mutex<VecDeque<Result<RouteResponse, RoutingError>>>,
}

impl ScriptedRouter {
    fn respond(&self, response: Result<RouteResponse, RoutingError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn requests(&self) -> Vec<RouteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl RoutingProvider for ScriptedRouter {
    fn supports_traffic(&self) -> bool {
        true
    }

    fn compute_route(&self, request: RouteRequest) -> BoxFuture<Result<RouteResponse, RoutingError>> {
        self.requests.lock().unwrap().push(request);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(RoutingError::Unavailable("no script".to_string())));
        Box::pin(async move { response })
    }
}

fn response(duration: f64, in_traffic: Option<f64>) -> Result<RouteResponse, RoutingError> {
    Ok(RouteResponse {
        distance_meters: 5000.0,
        duration_seconds: duration,
        duration_in_traffic_seconds: in_traffic,
    })
}

fn engine_for(router: Arc<ScriptedRouter>, status: JobStatus) -> RouteEngine {
    let engine = RouteEngine::new(
        router,
        Arc::new(ManualClock::new(time_at(0))),
        &TrackingConfig::default(),
    );
    engine.set_job(
        "job-1",
        Destination {
            point: north_of_base(5000.0),
            label: "12 Main St".to_string(),
        },
        status,
    );
    engine
}

#[tokio::test]
async fn one_computation_per_accepted_position() {
    let router = Arc::new(ScriptedRouter::default());
    router.respond(response(600.0, Some(720.0)));
    router.respond(response(590.0, Some(700.0)));
    let engine = engine_for(router.clone(), JobStatus::EnRoute);

    let first = update_at("job-1", 0, north_of_base(0.0));
    let second = update_at("job-1", 2, north_of_base(20.0));
    assert!(engine.on_location(&first));
    assert!(engine.on_location(&second));
    // the same update again, e.g. replayed from the offline queue
    assert!(!engine.on_location(&second));
    settle().await;

    assert_eq!(engine.computations(), 2);
    let requests = router.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|request| request.traffic_aware));
    assert_eq!(requests[0].depart_at, time_at(0));

    let eta = engine.last_eta().unwrap();
    assert_eq!(eta.eta_minutes, 12);
    assert_eq!(eta.traffic_delay_minutes, Some((700.0 - 590.0) / 60.0));
    assert_eq!(engine.last_route().unwrap().destination_label, "12 Main St");
}

#[tokio::test]
async fn sub_threshold_movement_is_not_recomputed() {
    let router = Arc::new(ScriptedRouter::default());
    router.respond(response(600.0, None));
    let engine = engine_for(router.clone(), JobStatus::Assigned);

    assert!(engine.on_location(&update_at("job-1", 0, north_of_base(0.0))));
    assert!(!engine.on_location(&update_at("job-1", 1, north_of_base(1.5))));
    settle().await;
    assert_eq!(router.requests().len(), 1);
    assert_eq!(engine.last_eta().unwrap().eta_minutes, 10);
    assert_eq!(engine.last_eta().unwrap().traffic_delay_minutes, None);
}

#[tokio::test]
async fn failure_keeps_the_last_eta() {
    let router = Arc::new(ScriptedRouter::default());
    router.respond(response(300.0, None));
    router.respond(Err(RoutingError::Unavailable("quota".to_string())));
    let engine = engine_for(router.clone(), JobStatus::EnRoute);
    let mut events = engine.subscribe();
    let mut map = LiveMapState::new("job-1", None, &TrackingConfig::default());

    engine.on_location(&update_at("job-1", 0, north_of_base(0.0)));
    settle().await;
    engine.on_location(&update_at("job-1", 5, north_of_base(100.0)));
    settle().await;

    let first = events.try_recv().unwrap();
    assert!(matches!(first, RouteEvent::EtaChanged { .. }));
    map.apply_route_event(&first);
    let second = events.try_recv().unwrap();
    assert!(matches!(
        second,
        RouteEvent::Warning {
            error: RoutingError::Unavailable(_),
            ..
        }
    ));
    map.apply_route_event(&second);

    assert_eq!(engine.last_eta().unwrap().eta_minutes, 5);
    assert_eq!(map.eta().unwrap().eta_minutes, 5);
    assert!(map.route().is_some());
    assert!(map.warning().is_some());
}

#[tokio::test]
async fn only_en_route_statuses_are_routed() {
    let router = Arc::new(ScriptedRouter::default());
    let engine = engine_for(router.clone(), JobStatus::InProgress);
    assert!(!engine.on_location(&update_at("job-1", 0, north_of_base(0.0))));

    engine.set_status(JobStatus::Arrived);
    router.respond(response(60.0, None));
    assert!(engine.on_location(&update_at("job-1", 1, north_of_base(10.0))));
    assert!(!engine.on_location(&update_at("job-2", 2, north_of_base(50.0))));
    settle().await;
    assert_eq!(router.requests().len(), 1);
}

#[tokio::test]
async fn straight_line_router_in_traffic() {
    let engine = RouteEngine::new(
        Arc::new(StraightLineRouter::new(10.0, Some(1.5))),
        Arc::new(ManualClock::new(Utc::now())),
        &TrackingConfig::default(),
    );
    engine.set_job(
        "job-1",
        Destination {
            point: north_of_base(5990.0),
            label: "Depot".to_string(),
        },
        JobStatus::EnRoute,
    );
    assert!(engine.on_location(&update_at("job-1", 0, north_of_base(0.0))));
    settle().await;

    let eta = engine.last_eta().unwrap();
    // 599 s plain, 898.5 s in traffic
    assert_eq!(eta.eta_minutes, 15);
    let delay = eta.traffic_delay_minutes.unwrap();
    assert!((delay - 4.99).abs() < 1e-3);
}
