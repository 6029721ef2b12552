//! Client disconnect detection.
//!
//! A [`DisconnectMonitor`] runs next to the aggregator for the lifetime of a
//! request. It polls a [`Transport`] on a fixed interval and, the first time
//! the client is gone, cancels the request's abort token and logs the
//! cancellation. It never produces data.

use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Liveness of the connection a request arrived on.
pub trait Transport: Send + Sync + 'static {
    /// Returns `true` once the client can no longer receive output.
    fn is_disconnected(&self) -> bool;
}

/// A response sender is disconnected once its receiver is dropped, which is
/// what an HTTP layer does when the client goes away mid-stream.
impl<T: Send + 'static> Transport for mpsc::Sender<T> {
    fn is_disconnected(&self) -> bool {
        self.is_closed()
    }
}

/// State shared between the monitor task and its handle.
#[derive(Debug)]
struct Shared {
    request_id: Arc<str>,
    fired: AtomicBool,
    fired_signal: CancellationToken,
    abort: CancellationToken,
}

impl Shared {
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.abort.cancel();
        self.fired_signal.cancel();
        tracing::warn!(
            request_id = %self.request_id,
            category = "client-cancelled",
            "Completion generation {} cancelled by user.",
            self.request_id
        );
        true
    }
}

/// Handle to a running disconnect monitor.
///
/// Dropping the handle stops the background task.
#[derive(Debug)]
pub struct DisconnectMonitor {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl DisconnectMonitor {
    /// Spawns a monitor that checks `transport` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(
        request_id: Arc<str>,
        transport: T,
        interval: Duration,
        abort: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            request_id,
            fired: AtomicBool::new(false),
            fired_signal: CancellationToken::new(),
            abort,
        });

        let task = tokio::spawn(watch(Arc::clone(&shared), transport, interval));

        Self { shared, task }
    }

    /// Reports the client as gone.
    ///
    /// Only the first call, from here or from the monitor task, has any
    /// effect. Returns whether this call was that first one.
    pub fn fire(&self) -> bool {
        self.shared.fire()
    }

    /// Returns `true` once a disconnect has been observed.
    pub fn is_fired(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    /// Resolves once a disconnect has been observed.
    pub async fn fired(&self) {
        self.shared.fired_signal.cancelled().await;
    }
}

impl Drop for DisconnectMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch<T: Transport>(shared: Arc<Shared>, transport: T, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if shared.fired.load(Ordering::Acquire) {
            break;
        }

        if transport.is_disconnected() {
            shared.fire();
            break;
        }
    }

    tracing::trace!(request_id = %shared.request_id, "Disconnect monitor stopped");
}
