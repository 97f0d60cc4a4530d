use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::BTreeMap;

use crate::config::TrackingConfig;
use crate::error::RoutingError;
use crate::gps_processor::Point;
use crate::route_engine::{Destination, EtaUpdate, RouteEvent, RouteInfo};
use crate::wire::LocationUpdate;

pub fn check_arrival(position: &Point, destination: &Point, radius_m: f64) -> bool {
    position.haversine_distance(destination) <= radius_m
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrailPoint {
    pub point: Point,
    pub captured_at: DateTime<Utc>,
}

/// The most recent positions of a technician, keyed and ordered by capture
/// time. Inserting the same capture time twice is a no-op.
pub struct Trail {
    capacity: usize,
    points: BTreeMap<DateTime<Utc>, Point>,
}

impl Trail {
    pub fn new(capacity: usize) -> Self {
        Trail {
            capacity,
            points: BTreeMap::new(),
        }
    }

    /// Returns whether the point is part of the trail afterwards. A point
    /// older than everything in a full trail is dropped right away.
    pub fn insert(&mut self, captured_at: DateTime<Utc>, point: Point) -> bool {
        if self.points.contains_key(&captured_at) {
            return false;
        }
        self.points.insert(captured_at, point);
        while self.points.len() > self.capacity {
            self.points.pop_first();
        }
        self.points.contains_key(&captured_at)
    }

    pub fn points(&self) -> Vec<TrailPoint> {
        self.points
            .iter()
            .map(|(captured_at, point)| TrailPoint {
                point: *point,
                captured_at: *captured_at,
            })
            .collect()
    }

    pub fn latest(&self) -> Option<TrailPoint> {
        self.points
            .last_key_value()
            .map(|(captured_at, point)| TrailPoint {
                point: *point,
                captured_at: *captured_at,
            })
    }

    /// Path length along the trail in capture order, in meters.
    pub fn length_meters(&self) -> f64 {
        self.points
            .values()
            .tuple_windows()
            .map(|(a, b)| a.haversine_distance(b))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// What a map screen shows for one job: trail, route and ETA. A failed
/// route recomputation never clears the last good ETA, it only sets a
/// warning.
pub struct LiveMapState {
    job_id: String,
    destination: Option<Destination>,
    geofence_radius_m: f64,
    trail: Trail,
    latest: Option<LocationUpdate>,
    route: Option<RouteInfo>,
    eta: Option<EtaUpdate>,
    warning: Option<RoutingError>,
}

impl LiveMapState {
    pub fn new(job_id: &str, destination: Option<Destination>, config: &TrackingConfig) -> Self {
        LiveMapState {
            job_id: job_id.to_string(),
            destination,
            geofence_radius_m: config.geofence_radius_meters,
            trail: Trail::new(config.trail_capacity),
            latest: None,
            route: None,
            eta: None,
            warning: None,
        }
    }

    /// Returns false for other jobs and for updates already on the trail.
    pub fn apply_location(&mut self, update: &LocationUpdate) -> bool {
        if update.job_id != self.job_id {
            return false;
        }
        if !self.trail.insert(update.captured_at, update.point()) {
            return false;
        }
        let newer = self
            .latest
            .as_ref()
            .map_or(true, |latest| update.captured_at > latest.captured_at);
        if newer {
            self.latest = Some(update.clone());
        }
        true
    }

    pub fn apply_route_event(&mut self, event: &RouteEvent) {
        match event {
            RouteEvent::EtaChanged { eta, route } if eta.job_id == self.job_id => {
                self.eta = Some(eta.clone());
                self.route = Some(route.clone());
                self.warning = None;
            }
            RouteEvent::Warning { job_id, error } if *job_id == self.job_id => {
                self.warning = Some(error.clone());
            }
            _ => {}
        }
    }

    pub fn trail(&self) -> &Trail {
        &self.trail
    }

    pub fn latest(&self) -> Option<&LocationUpdate> {
        self.latest.as_ref()
    }

    pub fn route(&self) -> Option<&RouteInfo> {
        self.route.as_ref()
    }

    pub fn eta(&self) -> Option<&EtaUpdate> {
        self.eta.as_ref()
    }

    pub fn warning(&self) -> Option<&RoutingError> {
        self.warning.as_ref()
    }

    /// Whether the technician's latest position is inside the destination
    /// geofence.
    pub fn check_arrival(&self) -> bool {
        match (&self.latest, &self.destination) {
            (Some(latest), Some(destination)) => {
                check_arrival(&latest.point(), &destination.point, self.geofence_radius_m)
            }
            _ => false,
        }
    }
}
