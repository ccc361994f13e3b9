//! Common types module for the order tracker system.
//!
//! This module defines the core data types and structures shared across the
//! tracker components: the order aggregate and its event log, the key layout
//! used by the storage backends, and the configuration validation framework.

/// Key layout for orders and their secondary index labels.
pub mod keys;
/// The order aggregate, its status state machine, and the event log.
pub mod order;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Utility functions shared across crates.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use keys::*;
pub use order::*;
pub use registry::*;
pub use utils::truncate_id;
pub use validation::*;
