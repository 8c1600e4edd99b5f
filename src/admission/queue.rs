//! Priority queue set
//!
//! Five bounded FIFO queues, one per priority class. Enqueue never blocks:
//! a saturated queue evicts its lowest-priority expired entry, then spills to
//! the lowest non-full class below it, then drops.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::priority::PriorityClass;
use crate::latency::LatencyHistogram;
use crate::models::{Request, RequestOrigin};

/// Scheduler period the wait estimates are expressed in.
pub const DRAIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: Request,
    pub origin: RequestOrigin,
    pub score: i32,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { class: PriorityClass },
    Spilled { from: PriorityClass, to: PriorityClass },
    Dropped,
}

impl EnqueueOutcome {
    /// Queue the request actually landed in.
    pub fn class(&self) -> Option<PriorityClass> {
        match self {
            EnqueueOutcome::Queued { class } => Some(*class),
            EnqueueOutcome::Spilled { to, .. } => Some(*to),
            EnqueueOutcome::Dropped => None,
        }
    }
}

struct ClassQueue {
    class: PriorityClass,
    entries: Mutex<VecDeque<QueuedRequest>>,
    max_depth: AtomicUsize,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    evicted: AtomicU64,
    spilled_in: AtomicU64,
    wait: LatencyHistogram,
}

impl ClassQueue {
    fn new(class: PriorityClass) -> Self {
        Self {
            class,
            entries: Mutex::new(VecDeque::new()),
            max_depth: AtomicUsize::new(0),
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            spilled_in: AtomicU64::new(0),
            wait: LatencyHistogram::new(),
        }
    }

    fn pushed(&self, depth: usize) {
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of one queue for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: &'static str,
    pub capacity: usize,
    pub current_depth: usize,
    pub max_depth: usize,
    pub utilization_pct: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub evicted: u64,
    pub spilled_in: u64,
    pub wait_p50_us: u64,
    pub wait_p99_us: u64,
}

pub struct PriorityQueues {
    queues: Vec<ClassQueue>,
    capacity: usize,
    dropped: AtomicU64,
    work: Notify,
}

/// Drain batch for a class at load `load`.
pub fn batch_size(class: PriorityClass, load: f64) -> usize {
    ((class.base_batch() as f64 * (1.0 - load.clamp(0.0, 1.0))).floor() as usize).max(1)
}

impl PriorityQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: PriorityClass::ALL.iter().map(|&c| ClassQueue::new(c)).collect(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            work: Notify::new(),
        }
    }

    fn queue(&self, class: PriorityClass) -> &ClassQueue {
        &self.queues[class.index()]
    }

    pub fn enqueue(&self, item: QueuedRequest) -> EnqueueOutcome {
        self.enqueue_at(item, Instant::now())
    }

    pub fn enqueue_at(&self, item: QueuedRequest, now: Instant) -> EnqueueOutcome {
        let class = PriorityClass::from_score(item.score);
        let outcome = self.place(class, item, now);
        match outcome {
            EnqueueOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_queue_dropped_total", "class" => class.as_str());
            }
            _ => self.work.notify_one(),
        }
        outcome
    }

    fn place(&self, class: PriorityClass, item: QueuedRequest, now: Instant) -> EnqueueOutcome {
        let home = self.queue(class);
        {
            let mut entries = home.entries.lock();
            if entries.len() >= self.capacity {
                let ttl = class.ttl();
                let victim = entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| now.saturating_duration_since(e.enqueued_at) > ttl)
                    .min_by_key(|(_, e)| e.score)
                    .map(|(i, _)| i);
                if let Some(idx) = victim {
                    entries.remove(idx);
                    home.evicted.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_counter!("fabric_queue_evicted_total", "class" => class.as_str());
                }
            }
            if entries.len() < self.capacity {
                entries.push_back(item);
                home.pushed(entries.len());
                return EnqueueOutcome::Queued { class };
            }
        }

        for &target in PriorityClass::ALL.iter().rev() {
            if target <= class {
                break;
            }
            let queue = self.queue(target);
            let mut entries = queue.entries.lock();
            if entries.len() < self.capacity {
                entries.push_back(item);
                queue.pushed(entries.len());
                queue.spilled_in.fetch_add(1, Ordering::Relaxed);
                return EnqueueOutcome::Spilled {
                    from: class,
                    to: target,
                };
            }
        }
        EnqueueOutcome::Dropped
    }

    /// Drain one batch from the highest-priority non-empty class.
    pub fn drain_tick(&self, load: f64) -> Option<(PriorityClass, Vec<QueuedRequest>)> {
        self.drain_tick_at(load, Instant::now())
    }

    pub fn drain_tick_at(
        &self,
        load: f64,
        now: Instant,
    ) -> Option<(PriorityClass, Vec<QueuedRequest>)> {
        for queue in &self.queues {
            let mut entries = queue.entries.lock();
            if entries.is_empty() {
                continue;
            }
            let take = batch_size(queue.class, load).min(entries.len());
            let batch: Vec<QueuedRequest> = entries.drain(..take).collect();
            drop(entries);

            queue
                .total_dequeued
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            for item in &batch {
                queue
                    .wait
                    .record_duration(now.saturating_duration_since(item.enqueued_at));
            }
            return Some((queue.class, batch));
        }
        None
    }

    /// Wait until something may have been enqueued.
    pub async fn wait_for_work(&self) {
        self.work.notified().await
    }

    /// Estimated wait for a new entry of `class`, counting everything ahead of it.
    pub fn estimated_wait(&self, class: PriorityClass, load: f64) -> Duration {
        let ticks: usize = self
            .queues
            .iter()
            .filter(|q| q.class <= class)
            .map(|q| {
                let depth = q.entries.lock().len();
                depth.div_ceil(batch_size(q.class, load))
            })
            .sum();
        DRAIN_TICK * (ticks as u32 + 1)
    }

    pub fn depth(&self, class: PriorityClass) -> usize {
        self.queue(class).entries.lock().len()
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.entries.lock().len()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .map(|q| {
                let depth = q.entries.lock().len();
                QueueSnapshot {
                    name: q.class.as_str(),
                    capacity: self.capacity,
                    current_depth: depth,
                    max_depth: q.max_depth.load(Ordering::Relaxed),
                    utilization_pct: depth as f64 / self.capacity as f64 * 100.0,
                    total_enqueued: q.total_enqueued.load(Ordering::Relaxed),
                    total_dequeued: q.total_dequeued.load(Ordering::Relaxed),
                    evicted: q.evicted.load(Ordering::Relaxed),
                    spilled_in: q.spilled_in.load(Ordering::Relaxed),
                    wait_p50_us: q.wait.percentile(50.0),
                    wait_p99_us: q.wait.percentile(99.0),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestType;
    use std::net::{IpAddr, Ipv4Addr};

    fn item(score: i32, tag: &str, at: Instant) -> QueuedRequest {
        QueuedRequest {
            request: Request::new(RequestType::Analytics, serde_json::json!({})).with_id(tag),
            origin: RequestOrigin::anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            score,
            enqueued_at: at,
        }
    }

    fn ids(batch: &[QueuedRequest]) -> Vec<String> {
        batch
            .iter()
            .map(|q| q.request.id.clone().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_batch_size_shrinks_with_load() {
        assert_eq!(batch_size(PriorityClass::Critical, 0.0), 10);
        assert_eq!(batch_size(PriorityClass::Critical, 0.55), 4);
        assert_eq!(batch_size(PriorityClass::Background, 0.0), 1);
        assert_eq!(batch_size(PriorityClass::High, 0.99), 1);
    }

    #[test]
    fn test_fifo_within_class() {
        let queues = PriorityQueues::new(100);
        let now = Instant::now();
        for i in 0..6 {
            queues.enqueue_at(item(40, &format!("r{}", i), now), now);
        }
        let (class, batch) = queues.drain_tick_at(0.0, now).unwrap();
        assert_eq!(class, PriorityClass::Low);
        assert_eq!(ids(&batch), vec!["r0", "r1"]);
        let (_, batch) = queues.drain_tick_at(0.0, now).unwrap();
        assert_eq!(ids(&batch), vec!["r2", "r3"]);
    }

    #[test]
    fn test_one_class_per_tick_in_priority_order() {
        let queues = PriorityQueues::new(100);
        let now = Instant::now();
        queues.enqueue_at(item(10, "bg", now), now);
        queues.enqueue_at(item(55, "med", now), now);
        queues.enqueue_at(item(95, "crit", now), now);

        let order: Vec<PriorityClass> = std::iter::from_fn(|| queues.drain_tick_at(0.0, now))
            .map(|(c, _)| c)
            .collect();
        assert_eq!(
            order,
            vec![
                PriorityClass::Critical,
                PriorityClass::Medium,
                PriorityClass::Background
            ]
        );
    }

    #[test]
    fn test_full_queue_evicts_expired_lowest() {
        let queues = PriorityQueues::new(2);
        let t0 = Instant::now();
        queues.enqueue_at(item(92, "old-high", t0), t0);
        queues.enqueue_at(item(90, "old-low", t0), t0);

        let later = t0 + Duration::from_secs(6);
        let outcome = queues.enqueue_at(item(99, "new", later), later);
        assert_eq!(
            outcome,
            EnqueueOutcome::Queued {
                class: PriorityClass::Critical
            }
        );
        let (_, batch) = queues.drain_tick_at(0.0, later).unwrap();
        assert_eq!(ids(&batch), vec!["old-high", "new"]);
    }

    #[test]
    fn test_full_queue_spills_to_lowest_then_drops() {
        let queues = PriorityQueues::new(1);
        let now = Instant::now();
        queues.enqueue_at(item(75, "a", now), now);
        assert_eq!(
            queues.enqueue_at(item(75, "b", now), now),
            EnqueueOutcome::Spilled {
                from: PriorityClass::High,
                to: PriorityClass::Background
            }
        );
        assert_eq!(
            queues.enqueue_at(item(75, "c", now), now).class(),
            Some(PriorityClass::Low)
        );
        queues.enqueue_at(item(75, "d", now), now);
        assert_eq!(
            queues.enqueue_at(item(75, "e", now), now),
            EnqueueOutcome::Dropped
        );
        assert_eq!(queues.dropped(), 1);
        assert_eq!(queues.total_depth(), 4);
    }

    #[test]
    fn test_estimated_wait_counts_entries_ahead() {
        let queues = PriorityQueues::new(100);
        let now = Instant::now();
        assert_eq!(queues.estimated_wait(PriorityClass::Low, 0.0), DRAIN_TICK);
        for i in 0..20 {
            queues.enqueue_at(item(95, &format!("c{}", i), now), now);
        }
        // 20 critical entries at 10 per tick.
        assert_eq!(queues.estimated_wait(PriorityClass::Low, 0.0), DRAIN_TICK * 3);
    }
}
