//! Replays a recorded drive through the whole pipeline: tracker on the
//! technician side, an in-process hub in the middle and the dispatcher's map
//! with a live ETA on the other end.
//!
//! cargo run --example simulate -- [drive.csv] [speedup]

use std::sync::Arc;
use std::time::Duration;

use trackpro_core::background::TokioBackgroundPolicy;
use trackpro_core::config::TrackingConfig;
use trackpro_core::dispatcher::TransportDispatcher;
use trackpro_core::gps_processor::Point;
use trackpro_core::job::JobStatus;
use trackpro_core::live_map::LiveMapState;
use trackpro_core::offline_queue::OfflineQueue;
use trackpro_core::raw_data::{self, ReplayProvider};
use trackpro_core::relay::{
    BroadcastScope, HubEvent, JobRecord, LocationHub, LoopbackChannel, LoopbackFallback,
};
use trackpro_core::route_engine::{Destination, RouteEngine, StraightLineRouter};
use trackpro_core::sampler::GeolocationSampler;
use trackpro_core::tracker::{Tracker, TrackerDeps};
use trackpro_core::utils::SystemClock;

const JOB_ID: &str = "job-demo";
const TECHNICIAN_ID: &str = "tech-demo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(false)
        .init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .unwrap_or_else(|| "tests/data/drive.csv".to_string());
    let speedup: f64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(20.0);

    let samples = raw_data::load_csv(&path)?;
    let Some(last) = samples.last() else {
        return Err(format!("{} has no samples", path).into());
    };
    // pretend the drive ends a few hundred meters short of the customer
    let destination = Destination {
        point: Point::new(last.point.latitude + 0.003, last.point.longitude),
        label: "Customer".to_string(),
    };

    let config = TrackingConfig::default();
    let hub = Arc::new(LocationHub::new());
    hub.register_job(JobRecord {
        job_id: JOB_ID.to_string(),
        org_id: "demo".to_string(),
        tracking_code: "DEMO".to_string(),
        technician_id: TECHNICIAN_ID.to_string(),
        status: JobStatus::EnRoute,
    });
    let mut dispatcher_view = hub.subscribe(BroadcastScope::Company("demo".to_string()));

    let channel = Arc::new(LoopbackChannel::new(hub.clone(), TECHNICIAN_ID, true));
    let fallback = Arc::new(LoopbackFallback::new(hub.clone(), TECHNICIAN_ID));
    let transport = TransportDispatcher::new(
        channel.clone(),
        fallback,
        OfflineQueue::open_in_memory(config.offline_queue_capacity)?,
        &config,
    );
    let provider = Arc::new(ReplayProvider::new(samples, speedup));
    let tracker = Tracker::new(
        config.clone(),
        TrackerDeps {
            sampler: GeolocationSampler::new(provider.clone(), &config),
            jobs: Arc::new(hub.directory_for(TECHNICIAN_ID)),
            dispatcher: transport,
            background: Arc::new(TokioBackgroundPolicy::new()),
            clock: Arc::new(SystemClock),
            recorder: None,
        },
    )?;

    let router = RouteEngine::new(
        Arc::new(StraightLineRouter::new(11.0, Some(1.25))),
        Arc::new(SystemClock),
        &config,
    );
    router.set_job(JOB_ID, destination.clone(), JobStatus::EnRoute);
    let mut route_events = router.subscribe();
    let mut map = LiveMapState::new(JOB_ID, Some(destination), &config);

    tracker.start(JOB_ID).await?;

    let mut received = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), dispatcher_view.recv()).await;
        let Ok(Ok(event)) = event else {
            if provider.is_finished() {
                break;
            }
            continue;
        };
        if let HubEvent::Location(update) = event {
            received += 1;
            map.apply_location(&update);
            router.on_location(&update);

            // a dead zone in the middle of the drive
            if received == 15 {
                println!("-- channel down");
                channel.set_connected(false);
            } else if received == 25 {
                println!("-- channel up");
                channel.set_connected(true);
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        while let Ok(route_event) = route_events.try_recv() {
            map.apply_route_event(&route_event);
        }
        if let (Some(latest), Some(eta)) = (map.latest(), map.eta()) {
            println!(
                "{} ({:.5}, {:.5}) eta {} min, delivery {}",
                latest.captured_at.format("%H:%M:%S"),
                latest.latitude,
                latest.longitude,
                eta.eta_minutes,
                tracker.delivery_status()
            );
        }
    }

    tracker.stop();
    println!(
        "trail: {} points over {:.0} m, arrived: {}",
        map.trail().len(),
        map.trail().length_meters(),
        map.check_arrival()
    );
    println!("{}", serde_json::to_string_pretty(&tracker.status())?);
    Ok(())
}
