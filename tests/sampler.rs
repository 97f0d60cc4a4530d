pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;
use test_utils::*;
use trackpro_core::config::TrackingConfig;
use trackpro_core::error::SensorError;
use trackpro_core::gps_processor::PositionSample;
use trackpro_core::sampler::{
    AccuracyTier, GeolocationSampler, PositionProvider, SampleSink, SamplerOptions, WatchEvent,
    WatchId,
};
use trackpro_core::utils::BoxFuture;

fn sampler_for(provider: &Arc<ScriptedProvider>) -> GeolocationSampler {
    GeolocationSampler::new(provider.clone(), &TrackingConfig::default())
}

fn watch_options() -> SamplerOptions {
    SamplerOptions::watch(&TrackingConfig::default())
}

#[test]
fn option_presets() {
    let config = TrackingConfig::default();
    let watch = SamplerOptions::watch(&config);
    assert_eq!(watch.accuracy, AccuracyTier::Navigation);
    assert_eq!(watch.min_interval, Duration::from_millis(2000));
    assert_eq!(watch.min_distance_m, 3.0);
    assert_eq!(watch.max_age, Duration::ZERO);

    let slow = SamplerOptions::repoll(&config, Duration::from_secs(30), false);
    assert_eq!(slow.accuracy, AccuracyTier::Balanced);
    assert_eq!(slow.max_age, Duration::from_secs(30));
    let fast = SamplerOptions::repoll(&config, Duration::from_secs(1), true);
    assert_eq!(fast.accuracy, AccuracyTier::Navigation);
    assert_eq!(fast.max_age, Duration::from_secs(5));
    assert_eq!(fast.timeout, Duration::from_secs(10));
}

#[tokio::test]
async fn nothing_is_sensed_before_watching() {
    let provider = ScriptedProvider::new();
    let _sampler = sampler_for(&provider);
    settle().await;
    assert_eq!(provider.watches_started(), 0);
}

#[tokio::test]
async fn errors_do_not_end_the_stream() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    provider.push_error(SensorError::PositionUnavailable("indoors".to_string()));
    provider.push(sample_at(0, BASE_LAT, BASE_LNG, 0.0));

    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::PositionUnavailable(
            "indoors".to_string()
        )))
    );
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Sample(sample_at(0, BASE_LAT, BASE_LNG, 0.0)))
    );
    assert_eq!(provider.watches_cleared(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_restarts_the_watch() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    provider.push_error(SensorError::Timeout);
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::Timeout))
    );
    assert_eq!(provider.watches_cleared(), 1);
    assert_eq!(provider.watches_started(), 1);

    tokio::time::sleep(TrackingConfig::default().sensor_retry_backoff() + Duration::from_millis(1))
        .await;
    assert_eq!(provider.watches_started(), 2);

    provider.push(sample_at(1, BASE_LAT, BASE_LNG, 3.0));
    assert!(matches!(watch.recv().await, Some(WatchEvent::Sample(_))));
}

#[tokio::test(start_paused = true)]
async fn failed_restarts_are_retried_with_backoff() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    provider.fail_next_watches(2);
    provider.push_error(SensorError::Timeout);
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::Timeout))
    );
    for _ in 0..2 {
        assert!(matches!(
            watch.recv().await,
            Some(WatchEvent::Error(SensorError::PositionUnavailable(_)))
        ));
    }

    tokio::time::sleep(TrackingConfig::default().sensor_retry_backoff() + Duration::from_millis(1))
        .await;
    assert_eq!(provider.watch_attempts(), 4);
    assert_eq!(provider.watches_started(), 2);
    provider.push(sample_at(1, BASE_LAT, BASE_LNG, 3.0));
    assert!(matches!(watch.recv().await, Some(WatchEvent::Sample(_))));
}

#[tokio::test(start_paused = true)]
async fn restarts_give_up_after_the_retry_budget() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();
    let budget = TrackingConfig::default().max_sensor_retries as usize;

    provider.fail_next_watches(budget + 10);
    provider.push_error(SensorError::Timeout);
    let mut errors = 0;
    while let Some(event) = watch.recv().await {
        assert!(matches!(event, WatchEvent::Error(_)));
        errors += 1;
    }
    // the timeout itself plus one per failed attempt
    assert_eq!(errors, budget + 1);
    assert_eq!(provider.watch_attempts(), budget + 1);
    assert_eq!(provider.watches_cleared(), 1);
}

#[tokio::test(start_paused = true)]
async fn permission_lost_during_restart() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    provider.push_error(SensorError::Timeout);
    provider.deny_permission();
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::Timeout))
    );
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::PermissionDenied))
    );
    assert_eq!(watch.recv().await, None);
}

#[tokio::test]
async fn revoked_permission_ends_the_watch() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    provider.push_error(SensorError::PermissionDenied);
    assert_eq!(
        watch.recv().await,
        Some(WatchEvent::Error(SensorError::PermissionDenied))
    );
    assert_eq!(watch.recv().await, None);
    assert_eq!(provider.watches_cleared(), 1);
}

#[tokio::test]
async fn stop_clears_the_platform_watch() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let mut watch = sampler.start_watching(watch_options()).unwrap();

    watch.stop();
    assert!(watch.is_stopped());
    settle().await;
    assert_eq!(provider.watches_cleared(), 1);

    provider.push(sample_at(0, BASE_LAT, BASE_LNG, 0.0));
    assert_eq!(watch.recv().await, None);

    // a fresh watch after the previous one was stopped
    let _again = sampler.start_watching(watch_options()).unwrap();
    assert_eq!(provider.watches_started(), 2);
}

/// A sensor that never answers a one-shot request.
struct SilentProvider;

impl PositionProvider for SilentProvider {
    fn start_watch(
        &self,
        _options: &SamplerOptions,
        _sink: SampleSink,
    ) -> Result<WatchId, SensorError> {
        Ok(0)
    }

    fn clear_watch(&self, _id: WatchId) {}

    fn get_once(&self, _options: &SamplerOptions) -> BoxFuture<Result<PositionSample, SensorError>> {
        Box::pin(std::future::pending())
    }
}

#[tokio::test(start_paused = true)]
async fn get_once_times_out() {
    let config = TrackingConfig::default();
    let sampler = GeolocationSampler::new(Arc::new(SilentProvider), &config);
    let result = sampler.get_once(&SamplerOptions::probe(&config)).await;
    assert_eq!(result, Err(SensorError::Timeout));
}

#[tokio::test]
async fn get_once_passes_errors_through() {
    let provider = ScriptedProvider::new();
    let sampler = sampler_for(&provider);
    let config = TrackingConfig::default();

    provider.script_once(Ok(sample_at(0, BASE_LAT, BASE_LNG, 0.0)));
    assert!(sampler.get_once(&SamplerOptions::probe(&config)).await.is_ok());
    provider.deny_permission();
    assert_eq!(
        sampler.get_once(&SamplerOptions::probe(&config)).await,
        Err(SensorError::PermissionDenied)
    );
}
