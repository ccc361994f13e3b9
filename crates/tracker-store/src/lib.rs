//! Storage module for the order tracker system.
//!
//! This module provides the key/value store abstraction the tracker is built
//! on: revisioned records with secondary index labels, conditional writes
//! (create-only and compare-and-swap), prefix scans, label lookups, and a
//! change stream for push notification of committed writes. Two backends are
//! provided, in-memory and file-based.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracker_types::{ConfigSchema, ImplementationRegistry};

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Error that occurs when a requested record is not found.
	#[error("Not found")]
	NotFound,
	/// Error that occurs when a write precondition does not hold.
	#[error("Revision conflict on key '{key}'")]
	Conflict { key: String },
	/// Error that occurs during serialization/deserialization.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// Error that occurs in the storage backend.
	#[error("Backend error: {0}")]
	Backend(String),
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// A stored record together with its metadata.
#[derive(Debug, Clone)]
pub struct Record {
	/// The full storage key.
	pub key: String,
	/// The raw stored bytes.
	pub value: Vec<u8>,
	/// Revision the record was committed at, monotonically increasing from 1.
	pub revision: u64,
	/// Secondary index labels attached at write time.
	pub labels: HashMap<String, String>,
}

/// Condition a write must satisfy to commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precondition {
	/// Unconditional write.
	#[default]
	None,
	/// The key must not exist yet (create-only).
	Absent,
	/// The key must currently be at exactly this revision (compare-and-swap).
	Revision(u64),
}

/// Options controlling a single put operation.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
	/// Secondary index labels to attach to the record.
	pub labels: HashMap<String, String>,
	/// Condition the write must satisfy.
	pub precondition: Precondition,
}

impl PutOptions {
	/// Attaches a secondary index label to the write.
	pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.labels.insert(name.into(), value.into());
		self
	}

	/// Sets the write precondition.
	pub fn precondition(mut self, precondition: Precondition) -> Self {
		self.precondition = precondition;
		self
	}
}

/// Whether a committed write created a key or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Created,
	Updated,
}

/// A committed write as seen on the change stream.
#[derive(Debug, Clone)]
pub struct Change {
	/// Whether the write created or updated the key.
	pub kind: ChangeKind,
	/// The record as committed.
	pub record: Record,
}

/// Trait defining the low-level interface for storage backends.
///
/// This trait must be implemented by any storage backend that wants to
/// integrate with the tracker. It provides revisioned key-value operations
/// with conditional writes, secondary index labels, and change notification.
#[async_trait]
pub trait KvStore: Send + Sync {
	/// Retrieves the record stored under the given key.
	async fn get(&self, key: &str) -> Result<Record, StoreError>;

	/// Stores raw bytes under the given key, subject to the put options.
	///
	/// Returns the revision the write committed at.
	async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<u64, StoreError>;

	/// Returns every record whose key starts with the given prefix.
	async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StoreError>;

	/// Returns every record carrying the given label name/value pair.
	async fn get_by_label(&self, name: &str, value: &str) -> Result<Vec<Record>, StoreError>;

	/// Subscribes to committed writes for keys matching the given prefix.
	fn watch(&self, prefix: &str) -> Changes;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for storage factory functions.
///
/// This is the function signature that all storage implementations must
/// provide to create instances of their store.
pub type StoreFactory = fn(&toml::Value) -> Result<Box<dyn KvStore>, StoreError>;

/// Registry trait for storage implementations.
///
/// This trait extends the base ImplementationRegistry to specify that
/// storage implementations must provide a StoreFactory.
pub trait StoreRegistry: ImplementationRegistry<Factory = StoreFactory> {}

/// Get all registered storage implementations.
///
/// Returns a vector of (name, factory) tuples for all available storage
/// implementations. This is used by the service to resolve the configured
/// primary backend.
pub fn get_all_implementations() -> Vec<(&'static str, StoreFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// Fan-out point for committed writes.
///
/// Backends hold one feed and publish every committed write into it.
/// Subscribers receive changes through cancellable [`Changes`] handles;
/// dropping the handle cancels the subscription. Slow subscribers may lose
/// the oldest pending changes (broadcast semantics).
pub struct ChangeFeed {
	sender: broadcast::Sender<Change>,
}

impl ChangeFeed {
	/// Creates a new feed with the given channel capacity.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Publishes a committed write to all current subscribers.
	pub fn publish(&self, change: Change) {
		// Send fails only when there are no subscribers, which is fine.
		let _ = self.sender.send(change);
	}

	/// Creates a subscription covering keys with the given prefix.
	pub fn subscribe(&self, prefix: &str) -> Changes {
		Changes {
			receiver: self.sender.subscribe(),
			prefix: prefix.to_string(),
		}
	}
}

/// A cancellable change-stream subscription.
pub struct Changes {
	receiver: broadcast::Receiver<Change>,
	prefix: String,
}

impl Changes {
	/// Receives the next change whose key matches this subscription's prefix.
	///
	/// Returns `None` once the owning store has been dropped. A lagged
	/// subscriber skips the overwritten changes and keeps receiving.
	pub async fn recv(&mut self) -> Option<Change> {
		loop {
			match self.receiver.recv().await {
				Ok(change) => {
					if change.record.key.starts_with(&self.prefix) {
						return Some(change);
					}
				},
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					tracing::warn!(skipped, "Change subscriber lagged, oldest changes dropped");
				},
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

/// A typed value together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
	pub value: T,
	pub revision: u64,
}

/// High-level storage service that provides typed operations.
///
/// The StoreService wraps a low-level storage backend and provides
/// convenient methods for storing and retrieving typed data with
/// automatic JSON serialization/deserialization.
pub struct StoreService {
	/// The underlying storage backend implementation.
	backend: Box<dyn KvStore>,
}

impl StoreService {
	/// Creates a new StoreService with the specified backend.
	pub fn new(backend: Box<dyn KvStore>) -> Self {
		Self { backend }
	}

	/// Serializes and stores a value, returning the committed revision.
	pub async fn put<T: Serialize>(
		&self,
		key: &str,
		data: &T,
		options: PutOptions,
	) -> Result<u64, StoreError> {
		let bytes =
			serde_json::to_vec(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
		self.backend.put(key, bytes, options).await
	}

	/// Retrieves and deserializes a value together with its revision.
	pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Versioned<T>, StoreError> {
		let record = self.backend.get(key).await?;
		let value = serde_json::from_slice(&record.value)
			.map_err(|e| StoreError::Serialization(e.to_string()))?;
		Ok(Versioned {
			value,
			revision: record.revision,
		})
	}

	/// Retrieves and deserializes every value whose key starts with the prefix.
	pub async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
		let records = self.backend.scan(prefix).await?;
		records
			.into_iter()
			.map(|record| {
				serde_json::from_slice(&record.value)
					.map_err(|e| StoreError::Serialization(e.to_string()))
			})
			.collect()
	}

	/// Retrieves and deserializes every value carrying the given label.
	pub async fn get_by_label<T: DeserializeOwned>(
		&self,
		name: &str,
		value: &str,
	) -> Result<Vec<T>, StoreError> {
		let records = self.backend.get_by_label(name, value).await?;
		records
			.into_iter()
			.map(|record| {
				serde_json::from_slice(&record.value)
					.map_err(|e| StoreError::Serialization(e.to_string()))
			})
			.collect()
	}

	/// Subscribes to committed writes for keys matching the given prefix.
	pub fn watch(&self, prefix: &str) -> Changes {
		self.backend.watch(prefix)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::implementations::memory::MemoryStore;
	use serde::Deserialize;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Sample {
		name: String,
		count: u32,
	}

	fn service() -> StoreService {
		StoreService::new(Box::new(MemoryStore::new()))
	}

	#[tokio::test]
	async fn typed_put_and_get() {
		let store = service();
		let sample = Sample {
			name: "a".into(),
			count: 3,
		};

		let revision = store
			.put("sample:1", &sample, PutOptions::default())
			.await
			.unwrap();
		assert_eq!(revision, 1);

		let read = store.get::<Sample>("sample:1").await.unwrap();
		assert_eq!(read.value, sample);
		assert_eq!(read.revision, 1);
	}

	#[tokio::test]
	async fn get_missing_key_is_not_found() {
		let store = service();
		let result = store.get::<Sample>("sample:missing").await;
		assert!(matches!(result, Err(StoreError::NotFound)));
	}

	#[tokio::test]
	async fn scan_filters_by_prefix() {
		let store = service();
		for (key, count) in [("sample:1", 1), ("sample:2", 2), ("other:1", 9)] {
			let sample = Sample {
				name: key.into(),
				count,
			};
			store.put(key, &sample, PutOptions::default()).await.unwrap();
		}

		let samples: Vec<Sample> = store.scan("sample:").await.unwrap();
		assert_eq!(samples.len(), 2);
		assert!(samples.iter().all(|s| s.name.starts_with("sample:")));
	}

	#[tokio::test]
	async fn label_lookup_returns_tagged_values() {
		let store = service();
		let sample = Sample {
			name: "a".into(),
			count: 1,
		};
		store
			.put(
				"sample:1",
				&sample,
				PutOptions::default().label("label1", "group:x"),
			)
			.await
			.unwrap();
		store
			.put("sample:2", &sample, PutOptions::default())
			.await
			.unwrap();

		let tagged: Vec<Sample> = store.get_by_label("label1", "group:x").await.unwrap();
		assert_eq!(tagged.len(), 1);
	}

	#[tokio::test]
	async fn undecodable_value_surfaces_as_serialization_error() {
		let backend = MemoryStore::new();
		backend
			.put("sample:1", b"not json".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let store = StoreService::new(Box::new(backend));
		let result = store.get::<Sample>("sample:1").await;
		assert!(matches!(result, Err(StoreError::Serialization(_))));
	}
}
