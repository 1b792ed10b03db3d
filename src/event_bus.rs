//! Fan-out of [`SimEvent`]s to many independent subscribers.
//!
//! Publishers never block: an event goes into a bounded ingress queue and a
//! single dispatcher task, spawned on the bus's home runtime, copies it into
//! every subscriber's own bounded queue. A subscriber whose queue is full
//! simply misses that event. Subscribers only care about the latest state, so
//! dropped events are neither retried nor reported.
//!
//! The dispatcher owns the subscriber list outright, so publishing from a
//! worker thread never contends with subscriber iteration.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::events::SimEvent;

enum Control {
    Subscribe(mpsc::Sender<SimEvent>),
    Close,
}

struct BusShared {
    publish_tx: mpsc::Sender<SimEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
    subscriber_capacity: usize,
    subscribers: AtomicUsize,
    closed: AtomicBool,
}

/// Cloneable handle to the event bus. All clones share one dispatcher.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create a bus whose dispatcher runs on the current tokio runtime.
    pub fn new(config: &SimulationConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| SimError::Internal {
            message: format!("EventBus needs a tokio runtime: {}", e),
        })?;
        Ok(Self::with_handle(&handle, config))
    }

    /// Create a bus whose dispatcher runs on `handle`. Publishing is then
    /// safe from any thread, inside or outside that runtime.
    pub fn with_handle(handle: &Handle, config: &SimulationConfig) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(BusShared {
            publish_tx,
            control_tx,
            subscriber_capacity: config.subscriber_queue_capacity.max(1),
            subscribers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        handle.spawn(dispatch(publish_rx, control_rx, Arc::downgrade(&shared)));
        debug!(
            "[EventBus] Initialized (subscriber queue={})",
            shared.subscriber_capacity
        );

        Self { shared }
    }

    /// Register a new subscriber. It receives every event published after
    /// this call returns, until the bus is closed or the handle is dropped.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.shared.subscriber_capacity);
        if self.shared.control_tx.send(Control::Subscribe(tx)).is_err() {
            debug!("[EventBus] Subscribe after close, returning ended subscription");
        }
        Subscription { rx }
    }

    /// Enqueue an event for all current subscribers. Never blocks.
    pub fn publish(&self, event: SimEvent) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        match self.shared.publish_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "[EventBus] Publish queue full, dropping {} for {}",
                    event.name(),
                    event.device_id()
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Number of live subscribers as last seen by the dispatcher.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// End every subscriber's stream. Later publishes are discarded and later
    /// subscriptions end immediately.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.control_tx.send(Control::Close);
        info!("[EventBus] Closed");
    }
}

async fn dispatch(
    mut publish_rx: mpsc::Receiver<SimEvent>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    shared: std::sync::Weak<BusShared>,
) {
    let mut subscribers: Vec<mpsc::Sender<SimEvent>> = Vec::new();

    loop {
        tokio::select! {
            biased;

            control = control_rx.recv() => match control {
                Some(Control::Subscribe(tx)) => {
                    subscribers.push(tx);
                    info!("[EventBus] Subscriber connected (total: {})", subscribers.len());
                }
                Some(Control::Close) | None => break,
            },

            event = publish_rx.recv() => {
                let Some(event) = event else { break };
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        debug!("[EventBus] Subscriber queue full, dropping {}", event.name());
                        true
                    }
                    Err(TrySendError::Closed(_)) => {
                        info!("[EventBus] Subscriber disconnected");
                        false
                    }
                });
            }
        }

        match shared.upgrade() {
            Some(shared) => shared.subscribers.store(subscribers.len(), Ordering::Relaxed),
            None => break,
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.subscribers.store(0, Ordering::Relaxed);
    }
    // Dropping the senders ends every subscription.
    subscribers.clear();
}

/// One consumer's view of the bus.
///
/// Yields events until the bus closes; cannot be restarted afterwards.
pub struct Subscription {
    rx: mpsc::Receiver<SimEvent>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<SimEvent> {
        self.rx.recv().await
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SimEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = SimEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
