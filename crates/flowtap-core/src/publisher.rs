//! Event publisher - the ordered channel between the capture loop and sinks
//!
//! The overflow policy is always explicit:
//!
//! - [`OverflowPolicy::Block`]: bounded channel, publishing waits for room and
//!   back-pressure reaches packet processing
//! - [`OverflowPolicy::DropNewest`]: bounded channel, events that do not fit
//!   are dropped and counted
//! - [`OverflowPolicy::DropOldest`]: ring channel, unread events are overwritten
//!   and the consumer counts what it missed

use crate::events::HttpMessageEvent;
use crate::metrics::SharedMetrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Events are shared between the channel and every sink
pub type SharedEvent = Arc<HttpMessageEvent>;

/// What to do when the consumer falls behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Block,
    DropNewest,
    DropOldest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DropNewest => "drop_newest",
            OverflowPolicy::DropOldest => "drop_oldest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "Invalid overflow policy: {}. Must be one of: block, drop_newest, drop_oldest",
                other
            )),
        }
    }
}

/// Publisher errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event channel closed")]
    Closed,
}

enum Outlet {
    Bounded(mpsc::Sender<SharedEvent>),
    Ring(broadcast::Sender<SharedEvent>),
}

/// Sending half of the event channel
#[derive(Clone)]
pub struct EventPublisher {
    outlet: Arc<Outlet>,
    policy: OverflowPolicy,
    metrics: SharedMetrics,
}

/// Receiving half of the event channel
pub struct EventStream {
    inlet: Inlet,
    metrics: SharedMetrics,
}

enum Inlet {
    Bounded(mpsc::Receiver<SharedEvent>),
    Ring(broadcast::Receiver<SharedEvent>),
}

/// Create a publisher/stream pair holding up to `capacity` undelivered events
pub fn channel(
    capacity: usize,
    policy: OverflowPolicy,
    metrics: SharedMetrics,
) -> (EventPublisher, EventStream) {
    let capacity = capacity.max(1);
    let (outlet, inlet) = match policy {
        OverflowPolicy::Block | OverflowPolicy::DropNewest => {
            let (tx, rx) = mpsc::channel(capacity);
            (Outlet::Bounded(tx), Inlet::Bounded(rx))
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (Outlet::Ring(tx), Inlet::Ring(rx))
        }
    };

    (
        EventPublisher {
            outlet: Arc::new(outlet),
            policy,
            metrics: metrics.clone(),
        },
        EventStream { inlet, metrics },
    )
}

impl EventPublisher {
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Publish one event according to the overflow policy.
    ///
    /// Only fails once the consumer has gone away.
    pub async fn publish(&self, event: HttpMessageEvent) -> Result<(), PublishError> {
        let event = Arc::new(event);
        match (&*self.outlet, self.policy) {
            (Outlet::Bounded(tx), OverflowPolicy::DropNewest) => match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    let total = self
                        .metrics
                        .pipeline
                        .events_dropped
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    if total == 1 || total % 1000 == 0 {
                        warn!("Event channel full, dropped {} events so far", total);
                    }
                    debug!("Dropped event {} ({})", dropped.event_id, dropped.flow);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(PublishError::Closed),
            },
            (Outlet::Bounded(tx), _) => {
                tx.send(event).await.map_err(|_| PublishError::Closed)?;
            }
            (Outlet::Ring(tx), _) => {
                tx.send(event).map_err(|_| PublishError::Closed)?;
            }
        }

        self.metrics
            .pipeline
            .events_published
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl EventStream {
    /// Next event, or `None` once every publisher is gone and the channel drained
    pub async fn recv(&mut self) -> Option<SharedEvent> {
        match &mut self.inlet {
            Inlet::Bounded(rx) => rx.recv().await,
            Inlet::Ring(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        self.metrics
                            .pipeline
                            .events_dropped
                            .fetch_add(missed, Ordering::Relaxed);
                        warn!("Event consumer lagged, {} oldest events overwritten", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}
