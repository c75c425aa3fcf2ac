use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use depotledger_events::{EventBus, EventEnvelope};

use super::WorkerHandle;
use crate::catalog::Catalog;
use crate::engine::{EngineError, InventoryEngine, SweepReport};
use crate::event_store::EventStore;

/// Periodic expiry of reservations past their deadline.
///
/// Each tick hands the current time to the sweep task. Failed ticks are
/// logged and retried on the next one.
#[derive(Debug)]
pub struct ReservationSweeper;

impl ReservationSweeper {
    pub fn spawn<T, E>(name: &'static str, interval: Duration, mut task: T) -> io::Result<WorkerHandle>
    where
        T: FnMut(DateTime<Utc>) -> Result<SweepReport, E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || sweep_loop(name, interval, shutdown_rx, &mut task))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Sweep `engine` every `reservations.sweep_interval_secs`.
    pub fn for_engine<S, B, C>(engine: Arc<InventoryEngine<S, B, C>>) -> io::Result<WorkerHandle>
    where
        S: EventStore + Send + Sync + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + Send + Sync + 'static,
        C: Catalog + Send + Sync + 'static,
    {
        let interval = engine.config().reservations.sweep_interval();
        Self::spawn("reservation-sweeper", interval, move |now| -> Result<SweepReport, EngineError> {
            engine.expire_due_reservations(now)
        })
    }
}

fn sweep_loop<T, E>(name: &'static str, interval: Duration, shutdown_rx: mpsc::Receiver<()>, task: &mut T)
where
    T: FnMut(DateTime<Utc>) -> Result<SweepReport, E>,
    E: core::fmt::Display,
{
    info!(worker = name, interval_ms = interval.as_millis() as u64, "sweeper started");
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match task(Utc::now()) {
            Ok(report) if report.expired.is_empty() && report.failed == 0 => {
                debug!(worker = name, "nothing to expire");
            }
            Ok(report) => info!(
                worker = name,
                expired = report.expired.len(),
                released = report.released,
                failed = report.failed,
                "reservations expired"
            ),
            Err(err) => warn!(worker = name, error = %err, "reservation sweep failed"),
        }
    }
    info!(worker = name, "sweeper stopped");
}
