use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

use crate::dispatcher::{FallbackEndpoint, RealtimeChannel};
use crate::error::TransportError;
use crate::gps_processor::Point;
use crate::job::{JobDirectory, JobGrant, JobStatus};
use crate::utils::BoxFuture;
use crate::wire::{ChannelMessage, LocationUpdate};

/* Reference receiving side. Holds the append-only location series per job,
   de-duplicates by (jobId, capturedAt) and fans every stored update out to
   the three audiences of a job. The loopback adapters at the bottom plug it
   straight into a `TransportDispatcher`, going through the same JSON wire
   format a remote server would see.
*/

const SCOPE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub org_id: String,
    /// Public identifier customers use to follow the job.
    pub tracking_code: String,
    pub technician_id: String,
    pub status: JobStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BroadcastScope {
    Company(String),
    Job(String),
    Tracking(String),
}

impl BroadcastScope {
    pub fn for_job(record: &JobRecord) -> [BroadcastScope; 3] {
        [
            BroadcastScope::Company(record.org_id.clone()),
            BroadcastScope::Job(record.job_id.clone()),
            BroadcastScope::Tracking(record.tracking_code.clone()),
        ]
    }
}

impl fmt::Display for BroadcastScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastScope::Company(id) => write!(f, "company_{}", id),
            BroadcastScope::Job(id) => write!(f, "job_{}", id),
            BroadcastScope::Tracking(code) => write!(f, "tracking_{}", code),
        }
    }
}

impl FromStr for BroadcastScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('_')
            .ok_or_else(|| anyhow!("invalid scope: {}", s))?;
        if id.is_empty() {
            bail!("invalid scope: {}", s);
        }
        match kind {
            "company" => Ok(BroadcastScope::Company(id.to_string())),
            "job" => Ok(BroadcastScope::Job(id.to_string())),
            "tracking" => Ok(BroadcastScope::Tracking(id.to_string())),
            _ => bail!("invalid scope: {}", s),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    Location(LocationUpdate),
    JobStatus { job_id: String, status: JobStatus },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// Already have an update with the same (jobId, capturedAt).
    Duplicate,
}

#[derive(Debug)]
pub enum HubReply {
    Ingested(IngestOutcome),
    StatusChanged,
    Joined(broadcast::Receiver<HubEvent>),
    Left,
}

#[derive(Default)]
struct HubState {
    jobs: HashMap<String, JobRecord>,
    series: HashMap<String, BTreeMap<DateTime<Utc>, LocationUpdate>>,
    total_distance: HashMap<String, f64>,
    scopes: HashMap<BroadcastScope, broadcast::Sender<HubEvent>>,
}

impl HubState {
    fn sender(&mut self, scope: BroadcastScope) -> &broadcast::Sender<HubEvent> {
        self.scopes
            .entry(scope)
            .or_insert_with(|| broadcast::channel(SCOPE_CAPACITY).0)
    }

    fn broadcast(&mut self, record: &JobRecord, event: HubEvent) {
        for scope in BroadcastScope::for_job(record) {
            // no subscriber is fine
            let _ = self.sender(scope).send(event.clone());
        }
    }
}

#[derive(Default)]
pub struct LocationHub {
    state: Mutex<HubState>,
}

impl LocationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job(&self, record: JobRecord) {
        info!(
            "[relay] job {} registered for technician {}",
            record.job_id, record.technician_id
        );
        self.state
            .lock()
            .unwrap()
            .jobs
            .insert(record.job_id.clone(), record);
    }

    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.state.lock().unwrap().jobs.get(job_id).cloned()
    }

    pub fn subscribe(&self, scope: BroadcastScope) -> broadcast::Receiver<HubEvent> {
        self.state.lock().unwrap().sender(scope).subscribe()
    }

    /// Store one update sent by `technician_id`. Both transport paths end up
    /// here, so a duplicate from a replay is acknowledged but neither stored
    /// nor broadcast again.
    pub fn ingest(
        &self,
        technician_id: &str,
        update: LocationUpdate,
    ) -> Result<IngestOutcome, TransportError> {
        update
            .validate()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        let record = state
            .jobs
            .get(&update.job_id)
            .cloned()
            .ok_or_else(|| TransportError::Rejected(format!("unknown job {}", update.job_id)))?;
        if record.technician_id != technician_id {
            warn!(
                "[relay] technician {} is not assigned to job {}",
                technician_id, record.job_id
            );
            return Err(TransportError::Rejected(format!(
                "technician {} is not assigned to job {}",
                technician_id, record.job_id
            )));
        }

        let series = state.series.entry(update.job_id.clone()).or_default();
        if series.contains_key(&update.captured_at) {
            debug!(
                "[relay] duplicate update for job {} at {}",
                update.job_id, update.captured_at
            );
            return Ok(IngestOutcome::Duplicate);
        }

        // consumers order by capturedAt, so a late arrival is spliced in
        let point = update.point();
        let previous = series
            .range(..update.captured_at)
            .next_back()
            .map(|(_, u)| u.point());
        let next = series
            .range(update.captured_at..)
            .next()
            .map(|(_, u)| u.point());
        let delta = splice_distance(previous, point, next);
        series.insert(update.captured_at, update.clone());
        *state
            .total_distance
            .entry(update.job_id.clone())
            .or_insert(0.0) += delta;

        state.broadcast(&record, HubEvent::Location(update));
        Ok(IngestOutcome::Stored)
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let record = match state.jobs.get_mut(job_id) {
            Some(record) => {
                record.status = status;
                record.clone()
            }
            None => return Err(TransportError::Rejected(format!("unknown job {}", job_id))),
        };
        info!("[relay] job {} is now {}", job_id, status);
        state.broadcast(
            &record,
            HubEvent::JobStatus {
                job_id: job_id.to_string(),
                status,
            },
        );
        Ok(())
    }

    /// Entry point for raw realtime channel traffic.
    pub fn handle_message(&self, technician_id: &str, json: &str) -> Result<HubReply, TransportError> {
        let message =
            ChannelMessage::parse(json).map_err(|e| TransportError::Rejected(e.to_string()))?;
        match message {
            ChannelMessage::LocationUpdate(update) => {
                Ok(HubReply::Ingested(self.ingest(technician_id, update)?))
            }
            ChannelMessage::JobStatusUpdate { job_id, status } => {
                let status = JobStatus::from_str(&status)
                    .map_err(|_| TransportError::Rejected(format!("unknown status {}", status)))?;
                self.set_job_status(&job_id, status)?;
                Ok(HubReply::StatusChanged)
            }
            ChannelMessage::JoinTracking(code) => {
                debug!("[relay] joined tracking_{}", code);
                Ok(HubReply::Joined(self.subscribe(BroadcastScope::Tracking(code))))
            }
            ChannelMessage::LeaveTracking(code) => {
                debug!("[relay] left tracking_{}", code);
                Ok(HubReply::Left)
            }
        }
    }

    /// Stored updates of a job in capture order.
    pub fn history(&self, job_id: &str) -> Vec<LocationUpdate> {
        self.state
            .lock()
            .unwrap()
            .series
            .get(job_id)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, job_id: &str) -> Option<LocationUpdate> {
        self.state
            .lock()
            .unwrap()
            .series
            .get(job_id)
            .and_then(|series| series.values().next_back().cloned())
    }

    pub fn total_distance(&self, job_id: &str) -> f64 {
        self.state
            .lock()
            .unwrap()
            .total_distance
            .get(job_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// `JobDirectory` view for the technician signed in on a device.
    pub fn directory_for(self: &Arc<Self>, technician_id: &str) -> HubJobDirectory {
        HubJobDirectory {
            hub: self.clone(),
            technician_id: technician_id.to_string(),
        }
    }
}

fn splice_distance(previous: Option<Point>, point: Point, next: Option<Point>) -> f64 {
    match (previous, next) {
        (None, None) => 0.0,
        (Some(p), None) => p.haversine_distance(&point),
        (None, Some(n)) => point.haversine_distance(&n),
        (Some(p), Some(n)) => {
            p.haversine_distance(&point) + point.haversine_distance(&n) - p.haversine_distance(&n)
        }
    }
}

pub struct HubJobDirectory {
    hub: Arc<LocationHub>,
    technician_id: String,
}

impl JobDirectory for HubJobDirectory {
    fn lookup(&self, job_id: &str) -> BoxFuture<anyhow::Result<Option<JobGrant>>> {
        let grant = self.hub.job(job_id).map(|record| JobGrant {
            owned: record.technician_id == self.technician_id,
            job_id: record.job_id,
            status: record.status,
        });
        Box::pin(async move { Ok(grant) })
    }
}

/// In-process realtime channel. Connectivity can be toggled to simulate
/// dead zones.
pub struct LoopbackChannel {
    hub: Arc<LocationHub>,
    technician_id: String,
    connected: watch::Sender<bool>,
}

impl LoopbackChannel {
    pub fn new(hub: Arc<LocationHub>, technician_id: &str, connected: bool) -> Self {
        LoopbackChannel {
            hub,
            technician_id: technician_id.to_string(),
            connected: watch::channel(connected).0,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            if *current != connected {
                info!(
                    "[relay] loopback channel {}",
                    if connected { "connected" } else { "disconnected" }
                );
                *current = connected;
                true
            } else {
                false
            }
        });
    }
}

impl RealtimeChannel for LoopbackChannel {
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn publish(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>> {
        let result = if self.is_connected() {
            ChannelMessage::LocationUpdate(update)
                .to_json()
                .map_err(|e| TransportError::Rejected(e.to_string()))
                .and_then(|json| self.hub.handle_message(&self.technician_id, &json))
                .map(|_| ())
        } else {
            Err(TransportError::NotConnected)
        };
        Box::pin(async move { result })
    }
}

/// In-process request/response endpoint backed by the same hub.
pub struct LoopbackFallback {
    hub: Arc<LocationHub>,
    technician_id: String,
    available: AtomicBool,
}

impl LoopbackFallback {
    pub fn new(hub: Arc<LocationHub>, technician_id: &str) -> Self {
        LoopbackFallback {
            hub,
            technician_id: technician_id.to_string(),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl FallbackEndpoint for LoopbackFallback {
    fn post(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>> {
        let result = if self.available.load(Ordering::SeqCst) {
            update
                .to_json()
                .and_then(|body| LocationUpdate::parse(&body))
                .map_err(|e| TransportError::Rejected(e.to_string()))
                .and_then(|parsed| self.hub.ingest(&self.technician_id, parsed))
                .map(|_| ())
        } else {
            Err(TransportError::Network("endpoint unreachable".to_string()))
        };
        Box::pin(async move { result })
    }
}
