//! Key layout for the order namespace.
//!
//! Orders are stored under `order:<id>`. Customer-scoped lookup goes through
//! the secondary index label `label1`, which holds `orders:<customerId>` and
//! is re-attached on every re-persist.

/// Prefix under which all order aggregates are stored.
pub const ORDER_KEY_PREFIX: &str = "order:";

/// Name of the secondary index label carrying the customer scope.
pub const CUSTOMER_INDEX_LABEL: &str = "label1";

/// Returns the storage key for the order with the given id.
pub fn order_key(id: &str) -> String {
	format!("{}{}", ORDER_KEY_PREFIX, id)
}

/// Returns the secondary index label value for the given customer.
pub fn customer_label(customer_id: &str) -> String {
	format!("orders:{}", customer_id)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_layout() {
		assert_eq!(order_key("abc"), "order:abc");
		assert!(order_key("abc").starts_with(ORDER_KEY_PREFIX));
		assert_eq!(customer_label("C1"), "orders:C1");
	}
}
