//! Ticker tasks owned by the admission layer: queue drain and adaptive scaling.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::AdmissionPipeline;
use super::priority::PriorityClass;
use super::queue::{QueuedRequest, DRAIN_TICK};

pub const ADAPTIVE_SCALING_PERIOD: Duration = Duration::from_secs(5);

/// Receives requests released from the priority queues.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, class: PriorityClass, item: QueuedRequest);
}

/// One ordered lane per class. Each lane awaits its dispatches one after the
/// other, so requests of a class are dispatched in the order they were
/// drained while a slow class never holds up the others.
fn spawn_lanes(dispatcher: &Arc<dyn Dispatcher>) -> Vec<mpsc::UnboundedSender<QueuedRequest>> {
    PriorityClass::ALL
        .iter()
        .map(|&class| {
            let (tx, mut rx) = mpsc::unbounded_channel::<QueuedRequest>();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    dispatcher.dispatch(class, item).await;
                }
            });
            tx
        })
        .collect()
}

/// Drain one class per tick, in strict priority order. Parks on the queue's
/// notifier while everything is empty.
pub async fn run_drain_loop(
    pipeline: Arc<AdmissionPipeline>,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
) {
    let queues = pipeline.queues().clone();
    let lanes = spawn_lanes(&dispatcher);
    let mut ticker = tokio::time::interval(DRAIN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let load = pipeline.load_monitor().load();
        match queues.drain_tick(load) {
            Some((class, batch)) => {
                debug!(class = class.as_str(), batch = batch.len(), "Draining queue");
                let lane = &lanes[class.index()];
                for item in batch {
                    if lane.send(item).is_err() {
                        warn!(class = class.as_str(), "Dispatch lane closed, dropping request");
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queues.wait_for_work() => {}
                }
            }
        }
    }
    info!("Queue drain loop stopped");
}

/// Every period, rescale limits and breaker sensitivity from current load.
pub async fn run_adaptive_scaling(
    pipeline: Arc<AdmissionPipeline>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let load = pipeline.load_monitor().load();
                pipeline.adapt_limits(load);
                pipeline.cleanup(std::time::Instant::now());
            }
        }
    }
    info!("Adaptive scaling loop stopped");
}
