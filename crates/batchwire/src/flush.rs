//! One flush: decode and filter, coalesce per key, invoke the handler, and
//! settle every delivery of the batch.
//!
//! Everything here is sequential and scoped to a single call of [`flush`].
//! The key → group map never outlives it.

use std::collections::HashMap;

use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::Delivery;
use crate::envelope::EventEnvelope;
use crate::error::is_cancelled;
use crate::handler::{EventHandler, Routing};

/// Identity of a coalesced group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// The implicit group of a board-level worker.
    Batch,
    Key(String),
}

/// All deliveries of one flush that share a key, with the last event seen
/// for that key.
#[derive(Debug)]
pub struct CoalescedGroup<D> {
    pub key: GroupKey,
    pub latest: EventEnvelope,
    pub deliveries: SmallVec<[D; 4]>,
}

/// What happened during one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub received: usize,
    pub malformed: usize,
    pub ignored: usize,
    pub groups: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.received == 0
    }
}

/// Decode every delivery and settle the ones that will not reach the
/// handler. Returns the remaining deliveries in arrival order.
pub fn decode_and_filter<D, H>(
    handler: &H,
    batch: Vec<D>,
    report: &mut FlushReport,
) -> Vec<(GroupKey, EventEnvelope, D)>
where
    D: Delivery,
    H: EventHandler + ?Sized,
{
    let mut routed = Vec::with_capacity(batch.len());

    for delivery in batch {
        let envelope = match EventEnvelope::decode(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(
                    worker = handler.name(),
                    message_id = delivery.id(),
                    %error,
                    "malformed event payload, nacking"
                );
                delivery.nack();
                report.malformed += 1;
                continue;
            }
        };

        match handler.route(&envelope) {
            Routing::Ignore => {
                delivery.ack();
                report.ignored += 1;
            }
            Routing::Unroutable => {
                warn!(
                    worker = handler.name(),
                    message_id = delivery.id(),
                    event_type = %envelope.event_type,
                    "event has no coalescing key, acking and skipping"
                );
                delivery.ack();
                report.ignored += 1;
            }
            Routing::Batch => routed.push((GroupKey::Batch, envelope, delivery)),
            Routing::Key(key) => routed.push((GroupKey::Key(key), envelope, delivery)),
        }
    }

    routed
}

/// Collapse routed events into one group per key.
///
/// The last event received for a key wins. Groups come back in the order
/// their key was first seen.
pub fn coalesce<D>(routed: Vec<(GroupKey, EventEnvelope, D)>) -> Vec<CoalescedGroup<D>> {
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<CoalescedGroup<D>> = Vec::new();

    for (key, envelope, delivery) in routed {
        match index.get(&key) {
            Some(&position) => {
                let group = &mut groups[position];
                group.latest = envelope;
                group.deliveries.push(delivery);
            }
            None => {
                index.insert(key.clone(), groups.len());
                let mut deliveries = SmallVec::new();
                deliveries.push(delivery);
                groups.push(CoalescedGroup {
                    key,
                    latest: envelope,
                    deliveries,
                });
            }
        }
    }

    groups
}

/// Call the handler once per group and settle the group's deliveries.
pub async fn invoke<D, H>(
    handler: &H,
    cancel: &CancellationToken,
    groups: Vec<CoalescedGroup<D>>,
    report: &mut FlushReport,
) where
    D: Delivery,
    H: EventHandler + ?Sized,
{
    for group in groups {
        match handler.handle(cancel, &group.latest).await {
            Ok(()) => {
                for delivery in &group.deliveries {
                    delivery.ack();
                }
                report.succeeded += 1;
            }
            Err(err) => {
                for delivery in &group.deliveries {
                    delivery.nack();
                }
                report.failed += 1;

                if cancel.is_cancelled() || is_cancelled(&err) {
                    debug!(
                        worker = handler.name(),
                        key = ?group.key,
                        "handler interrupted by shutdown, messages nacked"
                    );
                } else {
                    error!(
                        worker = handler.name(),
                        key = ?group.key,
                        messages = group.deliveries.len(),
                        error = ?err,
                        "handler failed, messages nacked for redelivery"
                    );
                }
            }
        }
    }
}

/// Run a whole batch through decode, coalesce and invoke.
#[tracing::instrument(skip_all, fields(worker = handler.name(), size = batch.len()))]
pub async fn flush<D, H>(handler: &H, cancel: &CancellationToken, batch: Vec<D>) -> FlushReport
where
    D: Delivery,
    H: EventHandler + ?Sized,
{
    let mut report = FlushReport {
        received: batch.len(),
        ..FlushReport::default()
    };

    let routed = decode_and_filter(handler, batch, &mut report);
    let groups = coalesce(routed);
    report.groups = groups.len();
    invoke(handler, cancel, groups, &mut report).await;

    debug!(
        received = report.received,
        malformed = report.malformed,
        ignored = report.ignored,
        groups = report.groups,
        failed = report.failed,
        "flushed batch"
    );
    report
}
