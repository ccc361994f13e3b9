//! Order lifecycle management for the tracker system.
//!
//! This module enforces the order status state machine: an order is created
//! by `place_order` and advances through `prepared` to `picked up`, or is
//! cancelled while still `placed`. Every transition appends exactly one
//! event to the order's log and re-persists the whole aggregate under a
//! compare-and-swap precondition, so a raced transition surfaces as the
//! appropriate precondition error instead of a duplicate log entry.

use std::sync::Arc;
use thiserror::Error;
use tracker_store::{Precondition, PutOptions, StoreError, StoreService};
use tracker_types::{
	customer_label, order_key, truncate_id, Order, OrderEventKind, OrderStatus,
	CUSTOMER_INDEX_LABEL, ORDER_KEY_PREFIX,
};

mod updates;

pub use updates::{OrderUpdate, OrderUpdates};

/// Number of attempts a transition makes before giving up on conflicting writes.
const MAX_TRANSITION_ATTEMPTS: usize = 5;

/// Errors that can occur during order lifecycle operations.
///
/// All variants are recoverable and caller-surfaced; callers must inspect
/// the result before treating it as a valid order.
#[derive(Debug, Error)]
pub enum OrderError {
	/// The requested id has no persisted order.
	#[error("Order not found")]
	NotFound,
	/// A prepare was attempted on an order that is no longer `placed`.
	#[error("Order already prepared (status: {status})")]
	AlreadyPrepared { status: OrderStatus },
	/// A pickup was attempted on an order that is not `prepared`.
	#[error("Order cannot be picked up (status: {status})")]
	CannotBePickedUp { status: OrderStatus },
	/// A cancel was attempted on an order that is no longer `placed`.
	#[error("Order cannot be cancelled (status: {status})")]
	NotCancellable { status: OrderStatus },
	/// A storage operation failed.
	#[error("Storage error: {0}")]
	Storage(#[from] StoreError),
}

/// Service enforcing the order lifecycle over a key/value store.
///
/// Orders are persisted as whole aggregates under `order:<id>`, tagged with
/// a customer-scoped secondary index label so customer lookup avoids a full
/// scan.
pub struct OrderService {
	/// The storage service orders are persisted through.
	store: Arc<StoreService>,
}

impl OrderService {
	/// Creates a new OrderService backed by the given store.
	pub fn new(store: Arc<StoreService>) -> Self {
		Self { store }
	}

	/// Creates and persists a new order for the given product and customer.
	///
	/// The order starts in status `placed` with a single `order placed` log
	/// entry. The write is create-only; a colliding id is a storage error.
	pub async fn place_order(
		&self,
		product_id: &str,
		customer_id: &str,
	) -> Result<Order, OrderError> {
		let order = Order::place(product_id, customer_id);
		let options = PutOptions::default()
			.label(CUSTOMER_INDEX_LABEL, customer_label(customer_id))
			.precondition(Precondition::Absent);

		self.store
			.put(&order_key(&order.id), &order, options)
			.await?;

		tracing::info!(
			order_id = %truncate_id(&order.id),
			customer_id,
			product_id,
			"Placed order"
		);
		Ok(order)
	}

	/// Fetches the order with the given id.
	pub async fn get_order(&self, id: &str) -> Result<Order, OrderError> {
		match self.store.get::<Order>(&order_key(id)).await {
			Ok(versioned) => Ok(versioned.value),
			Err(StoreError::NotFound) => Err(OrderError::NotFound),
			Err(e) => Err(e.into()),
		}
	}

	/// Returns every persisted order, in no particular order.
	pub async fn get_all_orders(&self) -> Result<Vec<Order>, OrderError> {
		Ok(self.store.scan(ORDER_KEY_PREFIX).await?)
	}

	/// Returns every order placed by the given customer.
	pub async fn get_orders_by_customer(&self, customer_id: &str) -> Result<Vec<Order>, OrderError> {
		Ok(self
			.store
			.get_by_label(CUSTOMER_INDEX_LABEL, &customer_label(customer_id))
			.await?)
	}

	/// Moves a placed order to `prepared`.
	pub async fn prepare_order(&self, id: &str) -> Result<Order, OrderError> {
		self.transition(id, OrderEventKind::Prepared, |status| match status {
			OrderStatus::Placed => Ok(()),
			status => Err(OrderError::AlreadyPrepared { status }),
		})
		.await
	}

	/// Moves a prepared order to `picked up`.
	pub async fn pick_up_order(&self, id: &str) -> Result<Order, OrderError> {
		self.transition(id, OrderEventKind::PickedUp, |status| match status {
			OrderStatus::Prepared => Ok(()),
			status => Err(OrderError::CannotBePickedUp { status }),
		})
		.await
	}

	/// Cancels an order that has not been prepared yet.
	pub async fn cancel_order(&self, id: &str) -> Result<Order, OrderError> {
		self.transition(id, OrderEventKind::Cancelled, |status| match status {
			OrderStatus::Placed => Ok(()),
			status => Err(OrderError::NotCancellable { status }),
		})
		.await
	}

	/// Subscribes to order updates.
	///
	/// Every committed write in the order namespace, whether a new order or
	/// a transition, yields one update carrying the latest log event and the
	/// full order. Dropping the handle cancels the subscription.
	pub fn updates(&self) -> OrderUpdates {
		OrderUpdates::new(self.store.watch(ORDER_KEY_PREFIX))
	}

	/// Runs one transition as a conditional read-modify-write.
	///
	/// The precondition is validated against the same revision the write is
	/// conditioned on. A conflicting concurrent write restarts the whole
	/// cycle against fresh state, so the raced caller sees the precondition
	/// error rather than silently appending a duplicate event.
	async fn transition<F>(
		&self,
		id: &str,
		kind: OrderEventKind,
		check: F,
	) -> Result<Order, OrderError>
	where
		F: Fn(OrderStatus) -> Result<(), OrderError>,
	{
		let key = order_key(id);

		for _ in 0..MAX_TRANSITION_ATTEMPTS {
			let versioned = match self.store.get::<Order>(&key).await {
				Ok(versioned) => versioned,
				Err(StoreError::NotFound) => return Err(OrderError::NotFound),
				Err(e) => return Err(e.into()),
			};

			check(versioned.value.status)?;

			let mut order = versioned.value;
			order.record(kind);

			let options = PutOptions::default()
				.label(CUSTOMER_INDEX_LABEL, customer_label(&order.customer_id))
				.precondition(Precondition::Revision(versioned.revision));

			match self.store.put(&key, &order, options).await {
				Ok(_) => {
					tracing::info!(
						order_id = %truncate_id(id),
						status = %order.status,
						"Order transitioned"
					);
					return Ok(order);
				},
				Err(StoreError::Conflict { .. }) => {
					tracing::warn!(
						order_id = %truncate_id(id),
						"Conflicting write, retrying transition"
					);
				},
				Err(e) => return Err(e.into()),
			}
		}

		Err(OrderError::Storage(StoreError::Conflict { key }))
	}
}
