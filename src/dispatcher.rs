use anyhow::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TrackingConfig;
use crate::error::TransportError;
use crate::offline_queue::{OfflineQueue, QueuedUpdate};
use crate::utils::BoxFuture;
use crate::wire::LocationUpdate;

/// Persistent low-latency channel (a socket). The receiving side fans an
/// update out to the organization, job and public tracking audiences.
pub trait RealtimeChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Current connectivity, changes are used to trigger a replay on
    /// reconnect.
    fn connectivity(&self) -> watch::Receiver<bool>;

    fn publish(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>>;
}

/// Request/response endpoint that the receiver treats exactly like the
/// realtime channel.
pub trait FallbackEndpoint: Send + Sync {
    fn post(&self, update: LocationUpdate) -> BoxFuture<Result<(), TransportError>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Ok,
    /// Queued updates have not been delivered for several sync cycles.
    Delayed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent_primary: u64,
    pub sent_fallback: u64,
    pub failed: u64,
    pub replayed: u64,
}

#[derive(Default)]
struct Counters {
    sent_primary: AtomicU64,
    sent_fallback: AtomicU64,
    failed: AtomicU64,
    replayed: AtomicU64,
}

pub struct TransportDispatcher {
    channel: Arc<dyn RealtimeChannel>,
    fallback: Arc<dyn FallbackEndpoint>,
    queue: Mutex<OfflineQueue>,
    // Every publish of a queued entry on the primary path holds this, so the
    // live path and the replay path never send or mark the same row twice.
    primary_lock: tokio::sync::Mutex<()>,
    stalled_cycles: AtomicU32,
    delayed_after_cycles: u32,
    status: watch::Sender<DeliveryStatus>,
    counters: Counters,
}

impl TransportDispatcher {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        fallback: Arc<dyn FallbackEndpoint>,
        queue: OfflineQueue,
        config: &TrackingConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(DeliveryStatus::Ok);
        Arc::new(TransportDispatcher {
            channel,
            fallback,
            queue: Mutex::new(queue),
            primary_lock: tokio::sync::Mutex::new(()),
            stalled_cycles: AtomicU32::new(0),
            delayed_after_cycles: config.delayed_after_sync_cycles,
            status,
            counters: Counters::default(),
        })
    }

    /// Fire and forget. The update is queued locally right away, delivery
    /// happens on a spawned task and failures are only logged.
    pub fn send(self: &Arc<Self>, update: LocationUpdate) {
        let id = match self.queue.lock().unwrap().append(&update) {
            Ok(id) => Some(id),
            Err(error) => {
                warn!("[dispatcher] failed to queue update offline: {:?}", error);
                None
            }
        };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.deliver(id, update).await;
        });
    }

    async fn deliver(&self, id: Option<i64>, update: LocationUpdate) {
        if self.channel.is_connected() {
            let guard = self.primary_lock.lock().await;
            if let Some(id) = id {
                // a replay got the lock first and already sent this row
                match self.queue.lock().unwrap().is_synced(id) {
                    Ok(true) => {
                        debug!("[dispatcher] {} already synced by a replay", id);
                        return;
                    }
                    Ok(false) => {}
                    Err(error) => warn!("[dispatcher] failed to look up {}: {:?}", id, error),
                }
            }
            match self.channel.publish(update.clone()).await {
                Ok(()) => {
                    self.counters.sent_primary.fetch_add(1, Ordering::Relaxed);
                    if let Some(id) = id {
                        if let Err(error) = self.queue.lock().unwrap().mark_synced(id) {
                            warn!("[dispatcher] failed to mark {} synced: {:?}", id, error);
                        }
                    }
                    return;
                }
                Err(error) => {
                    warn!(
                        "[dispatcher] realtime publish failed, trying fallback: {}",
                        error
                    );
                }
            }
            drop(guard);
        }

        // Stays unsynced in the queue: the next replay pushes it through the
        // realtime channel as well and the receiver drops the duplicate.
        match self.fallback.post(update).await {
            Ok(()) => {
                self.counters.sent_fallback.fetch_add(1, Ordering::Relaxed);
                debug!("[dispatcher] delivered via fallback");
                if let Some(id) = id {
                    if let Err(error) = self.queue.lock().unwrap().mark_fallback_delivered(id) {
                        warn!("[dispatcher] failed to flag {} as delivered: {:?}", id, error);
                    }
                }
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[dispatcher] fallback failed, update kept for replay: {}",
                    error
                );
            }
        }
    }

    /// Push every unsynced entry through the realtime channel in capture
    /// order. Stops at the first failure so order is kept for the next
    /// attempt. Returns the number of entries this call marked synced.
    pub async fn replay(&self) -> Result<usize> {
        let _guard = self.primary_lock.lock().await;
        if !self.channel.is_connected() {
            return Ok(0);
        }
        let pending = self.queue.lock().unwrap().unsynced()?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!("[dispatcher] replaying {} offline updates", pending.len());

        let mut synced = 0;
        for QueuedUpdate { id, update, .. } in pending {
            match self.channel.publish(update).await {
                Ok(()) => {
                    if self.queue.lock().unwrap().mark_synced(id)? {
                        synced += 1;
                    }
                }
                Err(error) => {
                    warn!("[dispatcher] replay interrupted: {}", error);
                    break;
                }
            }
        }
        self.counters
            .replayed
            .fetch_add(synced as u64, Ordering::Relaxed);
        Ok(synced)
    }

    /// One periodic background sync: replay, then update the delivery
    /// status depending on whether anything is stuck. Entries the fallback
    /// endpoint delivered are waiting for the channel, not stuck.
    pub async fn sync_cycle(&self) -> DeliveryStatus {
        let synced = match self.replay().await {
            Ok(synced) => synced,
            Err(error) => {
                warn!("[dispatcher] replay failed: {:?}", error);
                0
            }
        };
        let remaining = match self.queue.lock().unwrap().undelivered_count() {
            Ok(count) => count,
            Err(error) => {
                warn!("[dispatcher] failed to count undelivered: {:?}", error);
                0
            }
        };
        let stalled = if remaining > 0 && synced == 0 {
            self.stalled_cycles.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.stalled_cycles.store(0, Ordering::SeqCst);
            0
        };

        let status = if stalled >= self.delayed_after_cycles {
            DeliveryStatus::Delayed
        } else {
            DeliveryStatus::Ok
        };
        self.status.send_if_modified(|current| {
            if *current != status {
                info!("[dispatcher] delivery status {} -> {}", current, status);
                *current = status;
                true
            } else {
                false
            }
        });
        status
    }

    /// Replays whenever the realtime channel goes from disconnected to
    /// connected, until `cancel` fires.
    pub fn watch_connectivity(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut connectivity = self.channel.connectivity();
        let mut was_connected = *connectivity.borrow_and_update();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *connectivity.borrow_and_update();
                        if connected && !was_connected {
                            info!("[dispatcher] realtime channel reconnected");
                            if let Err(error) = dispatcher.replay().await {
                                warn!("[dispatcher] replay after reconnect failed: {:?}", error);
                            }
                        }
                        was_connected = connected;
                    }
                }
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn delivery_status(&self) -> DeliveryStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeliveryStatus> {
        self.status.subscribe()
    }

    pub fn unsynced_count(&self) -> usize {
        match self.queue.lock().unwrap().unsynced_count() {
            Ok(count) => count,
            Err(error) => {
                warn!("[dispatcher] failed to count unsynced: {:?}", error);
                0
            }
        }
    }

    pub fn queued(&self) -> Result<Vec<QueuedUpdate>> {
        self.queue.lock().unwrap().all()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            sent_primary: self.counters.sent_primary.load(Ordering::Relaxed),
            sent_fallback: self.counters.sent_fallback.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
        }
    }
}
