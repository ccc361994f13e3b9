//! Order types for the tracker system.
//!
//! This module defines the order aggregate and its append-only event log.
//! The serialized shape is part of the stored contract: field names are
//! camelCase and status/event strings contain spaces (`picked up`,
//! `order picked up`), so the serde renames here must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current lifecycle stage of an order.
///
/// The legal transitions form a small state machine: `placed` may move to
/// `prepared` or `cancelled`, and `prepared` may move to `picked up`.
/// `picked up` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
	/// The order has been created and is waiting to be prepared.
	#[serde(rename = "placed")]
	Placed,
	/// The order has been prepared and is waiting for pickup.
	#[serde(rename = "prepared")]
	Prepared,
	/// The order has been picked up. Terminal.
	#[serde(rename = "picked up")]
	PickedUp,
	/// The order has been cancelled before preparation. Terminal.
	#[serde(rename = "cancelled")]
	Cancelled,
}

impl OrderStatus {
	/// Returns the stored string representation of the status.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Placed => "placed",
			OrderStatus::Prepared => "prepared",
			OrderStatus::PickedUp => "picked up",
			OrderStatus::Cancelled => "cancelled",
		}
	}

	/// Returns true if no further transition is permitted from this status.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::PickedUp | OrderStatus::Cancelled)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The kind of fact recorded by an order event.
///
/// Each kind maps one-to-one onto the status the order holds after the
/// event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventKind {
	/// The order was created.
	#[serde(rename = "order placed")]
	Placed,
	/// The order was prepared.
	#[serde(rename = "order prepared")]
	Prepared,
	/// The order was picked up.
	#[serde(rename = "order picked up")]
	PickedUp,
	/// The order was cancelled.
	#[serde(rename = "order cancelled")]
	Cancelled,
}

impl OrderEventKind {
	/// Returns the stored string representation of the event kind.
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderEventKind::Placed => "order placed",
			OrderEventKind::Prepared => "order prepared",
			OrderEventKind::PickedUp => "order picked up",
			OrderEventKind::Cancelled => "order cancelled",
		}
	}

	/// Returns the status an order holds after an event of this kind.
	pub fn status(&self) -> OrderStatus {
		match self {
			OrderEventKind::Placed => OrderStatus::Placed,
			OrderEventKind::Prepared => OrderStatus::Prepared,
			OrderEventKind::PickedUp => OrderStatus::PickedUp,
			OrderEventKind::Cancelled => OrderStatus::Cancelled,
		}
	}
}

impl fmt::Display for OrderEventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An immutable fact recording one transition an order has undergone.
///
/// The product and customer references are populated only on the
/// `order placed` event, mirroring the originating command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
	/// Unique identifier for this event.
	pub id: String,
	/// The kind of transition this event records.
	#[serde(rename = "type")]
	pub kind: OrderEventKind,
	/// Instant at which the event was recorded.
	pub timestamp: DateTime<Utc>,
	/// Product reference, present only on the placement event.
	#[serde(rename = "productId", skip_serializing_if = "Option::is_none")]
	pub product_id: Option<String>,
	/// Customer reference, present only on the placement event.
	#[serde(rename = "customerId", skip_serializing_if = "Option::is_none")]
	pub customer_id: Option<String>,
}

impl OrderEvent {
	/// Creates a new event of the given kind with a fresh id and timestamp.
	pub fn new(kind: OrderEventKind) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			kind,
			timestamp: Utc::now(),
			product_id: None,
			customer_id: None,
		}
	}

	/// Creates the placement event carrying the originating references.
	pub fn placed(product_id: &str, customer_id: &str) -> Self {
		Self {
			product_id: Some(product_id.to_string()),
			customer_id: Some(customer_id.to_string()),
			..Self::new(OrderEventKind::Placed)
		}
	}
}

/// The order aggregate tracked by this system.
///
/// The log is append-only; insertion order is chronological order, and the
/// status always equals the status mapped from the last log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	/// Unique identifier, immutable once created.
	pub id: String,
	/// Product reference set at creation.
	#[serde(rename = "productId")]
	pub product_id: String,
	/// Customer reference set at creation.
	#[serde(rename = "customerId")]
	pub customer_id: String,
	/// Current lifecycle status.
	pub status: OrderStatus,
	/// Append-only event log; the first entry is always `order placed`.
	pub log: Vec<OrderEvent>,
}

impl Order {
	/// Creates a freshly placed order with a single placement log entry.
	pub fn place(product_id: &str, customer_id: &str) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			product_id: product_id.to_string(),
			customer_id: customer_id.to_string(),
			status: OrderStatus::Placed,
			log: vec![OrderEvent::placed(product_id, customer_id)],
		}
	}

	/// Appends an event of the given kind and moves the status accordingly.
	///
	/// Precondition checks belong to the caller; this only keeps the
	/// status-equals-last-entry invariant intact.
	pub fn record(&mut self, kind: OrderEventKind) {
		self.status = kind.status();
		self.log.push(OrderEvent::new(kind));
	}

	/// Returns the most recent log entry, if any.
	pub fn latest_event(&self) -> Option<&OrderEvent> {
		self.log.last()
	}
}
