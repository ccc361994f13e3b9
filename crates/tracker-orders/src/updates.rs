//! Change notification relay for the order namespace.
//!
//! The relay turns the store's raw change stream into typed order updates:
//! each committed write yields the updated order together with its latest
//! log event. No filtering happens here; every new order and every
//! transition produces one update.

use tracker_store::Changes;
use tracker_types::{truncate_id, Order, OrderEvent};

/// One order update as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
	/// The newest entry of the order's log.
	pub event: OrderEvent,
	/// The full order as committed.
	pub order: Order,
}

/// A cancellable subscription to order updates.
///
/// Dropping the handle cancels the subscription. Delivery ordering is
/// whatever the store's change stream guarantees.
pub struct OrderUpdates {
	changes: Changes,
}

impl OrderUpdates {
	pub(crate) fn new(changes: Changes) -> Self {
		Self { changes }
	}

	/// Receives the next order update.
	///
	/// Returns `None` once the underlying store has been dropped. Writes
	/// that do not decode as an order are skipped with a warning.
	pub async fn recv(&mut self) -> Option<OrderUpdate> {
		while let Some(change) = self.changes.recv().await {
			let order: Order = match serde_json::from_slice(&change.record.value) {
				Ok(order) => order,
				Err(e) => {
					tracing::warn!(
						key = %change.record.key,
						error = %e,
						"Skipping change that does not decode as an order"
					);
					continue;
				},
			};

			// Persisted orders always carry at least the placement event.
			let Some(event) = order.latest_event().cloned() else {
				continue;
			};

			tracing::debug!(
				order_id = %truncate_id(&order.id),
				event = %event.kind,
				"Order update"
			);
			return Some(OrderUpdate { event, order });
		}
		None
	}
}
