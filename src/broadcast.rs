//! Fixed-cadence snapshot emission.
//!
//! [`Broadcaster`] fans each snapshot out to bounded per-subscriber
//! channels; [`BroadcastScheduler`] owns the timer thread that fuses,
//! derives and emits once per period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controls::SharedTuning;
use crate::derivation::DerivationTable;
use crate::fusion::FusionState;
use crate::producer::StopToken;
use crate::snapshot::Snapshot;

/// Receiving end of one subscriber's snapshot channel
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    name: String,
    rx: mpsc::Receiver<Snapshot>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next snapshot
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Snapshot> {
        match self.rx.try_recv() {
            Ok(snapshot) => Some(snapshot),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive for consumers outside an async runtime
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Snapshot> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => return Some(snapshot),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) if Instant::now() >= deadline => return None,
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Everything currently queued
    pub fn drain(&mut self) -> Vec<Snapshot> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

struct Subscriber {
    id: u64,
    name: String,
    tx: mpsc::Sender<Snapshot>,
    dropped_ticks: u64,
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Outcome of one emission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    /// Subscribers that stayed full past the timeout and missed this tick
    pub dropped: usize,
    /// Subscribers whose receiver was gone
    pub removed: usize,
}

enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

/// Push-model fan-out to registered subscribers.
///
/// The registry lock is only held to copy senders out and to apply the
/// outcome, never while waiting on a full queue. The emission gate is held
/// for a whole emission so `close` waits for one in progress.
pub struct Broadcaster {
    registry: Mutex<Registry>,
    /// True while emissions are accepted
    gate: Mutex<bool>,
    subscriber_timeout: Duration,
}

impl Broadcaster {
    pub fn new(subscriber_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            gate: Mutex::new(false),
            subscriber_timeout,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, bool> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber with a bounded queue of `capacity` snapshots
    pub fn subscribe(&self, name: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(Subscriber {
            id,
            name: name.to_string(),
            tx,
            dropped_ticks: 0,
        });
        info!("Subscriber '{}' registered (id {})", name, id);
        Subscription {
            id,
            name: name.to_string(),
            rx,
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut registry = self.registry();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.id != id);
        registry.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    pub fn open(&self) {
        *self.gate() = true;
    }

    /// Refuse further emissions. Waits for an in-progress emission, so once
    /// this returns no snapshot can reach a subscriber until reopened.
    pub fn close(&self) {
        *self.gate() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.gate()
    }

    /// Push `snapshot` into one queue, retrying a full queue until `deadline`
    fn deliver(tx: &mpsc::Sender<Snapshot>, snapshot: &Snapshot, deadline: Instant) -> Delivery {
        let mut pending = snapshot.clone();
        loop {
            match tx.try_send(pending) {
                Ok(()) => return Delivery::Delivered,
                Err(TrySendError::Full(_)) if Instant::now() >= deadline => {
                    return Delivery::Dropped
                }
                Err(TrySendError::Full(returned)) => {
                    pending = returned;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Closed(_)) => return Delivery::Closed,
            }
        }
    }

    /// Send a copy of `snapshot` to every subscriber. A full queue is
    /// retried until the per-subscriber timeout, then skipped for this tick.
    /// None when closed.
    pub fn emit(&self, snapshot: &Snapshot) -> Option<EmitReport> {
        let gate = self.gate();
        if !*gate {
            return None;
        }

        let targets: Vec<(u64, mpsc::Sender<Snapshot>)> = self
            .registry()
            .subscribers
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let outcomes: Vec<(u64, Delivery)> = targets
            .iter()
            .map(|(id, tx)| {
                let deadline = Instant::now() + self.subscriber_timeout;
                (*id, Self::deliver(tx, snapshot, deadline))
            })
            .collect();

        let mut report = EmitReport::default();
        let mut registry = self.registry();
        for (id, outcome) in outcomes {
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => {
                    report.dropped += 1;
                    if let Some(subscriber) = registry.subscribers.iter_mut().find(|s| s.id == id) {
                        subscriber.dropped_ticks += 1;
                        debug!(
                            "Subscriber '{}' too slow, skipped snapshot {} ({} skipped so far)",
                            subscriber.name, snapshot.sequence_number, subscriber.dropped_ticks
                        );
                    }
                }
                Delivery::Closed => {
                    report.removed += 1;
                    if let Some(pos) = registry.subscribers.iter().position(|s| s.id == id) {
                        let subscriber = registry.subscribers.remove(pos);
                        info!("Subscriber '{}' went away, removing", subscriber.name);
                    }
                }
            }
        }
        drop(registry);
        drop(gate);
        Some(report)
    }
}

/// Tick counters shared between the scheduler thread and status readers
#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
}

impl SchedulerStats {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::SeqCst)
    }
}

/// Everything one tick reads or writes
#[derive(Clone)]
pub struct TickContext {
    pub pipeline_id: Uuid,
    pub state: Arc<FusionState>,
    pub tuning: SharedTuning,
    pub derivation: Arc<DerivationTable>,
    pub broadcaster: Arc<Broadcaster>,
    /// Last snapshot sequence number issued
    pub sequence: Arc<AtomicU64>,
    pub stats: Arc<SchedulerStats>,
}

impl TickContext {
    /// One fusion cycle: smooth, derive, snapshot, emit
    pub fn tick(&self) -> Snapshot {
        let engine = self.tuning.get().engine;
        let smoothed = engine.cycle(&self.state);
        let derived = self.derivation.derive(&smoothed);
        self.state.store_derived(&derived);

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Snapshot::assemble(
            self.pipeline_id,
            sequence,
            &smoothed,
            &derived,
            &self.state,
        );
        self.stats.ticks.fetch_add(1, Ordering::SeqCst);

        if let Some(report) = self.broadcaster.emit(&snapshot) {
            if report.dropped > 0 || report.removed > 0 {
                debug!(
                    "Snapshot {}: {} delivered, {} dropped, {} removed",
                    sequence, report.delivered, report.dropped, report.removed
                );
            }
        }
        snapshot
    }
}

/// Timer thread driving [`TickContext::tick`]
pub struct BroadcastScheduler {
    thread: JoinHandle<()>,
}

impl BroadcastScheduler {
    pub fn spawn(context: TickContext, stop: StopToken) -> Self {
        let thread = thread::spawn(move || run_scheduler(context, stop));
        Self { thread }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!("Broadcast scheduler thread panicked");
        }
    }
}

fn run_scheduler(context: TickContext, stop: StopToken) {
    let mut period = context.tuning.get().update_period;
    let mut next = Instant::now() + period;
    info!("Broadcast scheduler started ({} ms period)", period.as_millis());

    loop {
        if stop.wait_until(next) {
            break;
        }

        context.tick();

        // Period changes apply from the next boundary
        period = context.tuning.get().update_period;
        next += period;

        let now = Instant::now();
        if next <= now {
            let behind = now - next;
            let skipped = (behind.as_nanos() / period.as_nanos().max(1)) as u32 + 1;
            next += period * skipped;
            context
                .stats
                .skipped_ticks
                .fetch_add(skipped as u64, Ordering::SeqCst);
            warn!("Tick overran its period, skipped {} tick(s)", skipped);
        }
    }

    info!(
        "Broadcast scheduler stopped after {} ticks",
        context.stats.ticks()
    );
}
