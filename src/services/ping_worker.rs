//! Ping worker - applies queued location pings off the ingestion path
//!
//! The MQTT client enqueues parsed pings via a bounded mpsc channel and never
//! waits on the engine; the worker drains the channel and runs each ping
//! through `AccessEngine::auto_ping`. Per-subject ordering is preserved because
//! a single worker consumes the queue in arrival order.

use crate::domain::types::{Coordinate, LocationPing};
use crate::infra::metrics::Metrics;
use crate::services::engine::AccessEngine;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A ping waiting to be applied
#[derive(Debug)]
pub struct QueuedPing {
    pub ping: LocationPing,
    /// When the ping was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl QueuedPing {
    pub fn new(ping: LocationPing) -> Self {
        Self { ping, enqueued_at: Instant::now() }
    }
}

pub struct PingWorker {
    engine: Arc<AccessEngine>,
    ping_rx: mpsc::Receiver<QueuedPing>,
    metrics: Arc<Metrics>,
}

impl PingWorker {
    pub fn new(
        engine: Arc<AccessEngine>,
        ping_rx: mpsc::Receiver<QueuedPing>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { engine, ping_rx, metrics }
    }

    /// Run the worker, processing pings until the channel closes
    pub async fn run(mut self) {
        info!("ping_worker_started");

        while let Some(queued) = self.ping_rx.recv().await {
            let queue_delay_us = queued.enqueued_at.elapsed().as_micros() as u64;
            self.metrics.set_ping_queue_depth(self.ping_rx.len() as u64);
            self.apply(queued.ping);

            if queue_delay_us > 1000 {
                warn!(queue_delay_us = %queue_delay_us, "ping_queue_delay_high");
            }
        }

        info!("ping_worker_stopped");
    }

    fn apply(&self, ping: LocationPing) {
        let coordinate = match Coordinate::new(ping.latitude, ping.longitude) {
            Ok(c) => c,
            Err(e) => {
                self.metrics.record_rejection(&e);
                warn!(subject = %ping.subject_id, error = %e, "ping_invalid");
                return;
            }
        };

        match self.engine.auto_ping(&ping.subject_id, coordinate) {
            Ok(outcome) => {
                if let Some(rejection) = outcome.rejection {
                    debug!(subject = %ping.subject_id, code = %rejection.code, "ping_entry_refused");
                }
            }
            // Rejections are already logged and counted by the engine
            Err(e) => debug!(subject = %ping.subject_id, code = %e.code(), "ping_failed"),
        }
    }
}

/// Create a ping channel and worker
///
/// Returns the sender (for the MQTT client) and the worker (to be spawned)
pub fn create_ping_worker(
    engine: Arc<AccessEngine>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (mpsc::Sender<QueuedPing>, PingWorker) {
    let (ping_tx, ping_rx) = mpsc::channel(buffer_size);
    let worker = PingWorker::new(engine, ping_rx, metrics);
    (ping_tx, worker)
}
