//! In-memory storage backend implementation for the order tracker.
//!
//! This module provides a memory-based implementation of the KvStore trait,
//! useful for testing and development scenarios where persistence is not
//! required. Revisions and preconditions are fully supported, so transition
//! races behave exactly as they do against a persistent backend.

use crate::{
	Change, ChangeFeed, ChangeKind, Changes, KvStore, Precondition, PutOptions, Record, StoreError,
	StoreFactory, StoreRegistry,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracker_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError,
};

/// Default capacity of the change broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A stored entry with its metadata.
#[derive(Debug, Clone)]
struct Entry {
	value: Vec<u8>,
	revision: u64,
	labels: HashMap<String, String>,
}

/// In-memory storage implementation.
///
/// This implementation stores data in a HashMap protected by a read-write
/// lock, providing fast access but no persistence across restarts.
pub struct MemoryStore {
	/// The in-memory entries protected by a read-write lock.
	entries: Arc<RwLock<HashMap<String, Entry>>>,
	/// Fan-out point for committed writes.
	feed: ChangeFeed,
}

impl MemoryStore {
	/// Creates a new MemoryStore with the default change channel capacity.
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
	}

	/// Creates a new MemoryStore with the given change channel capacity.
	pub fn with_capacity(channel_capacity: usize) -> Self {
		Self {
			entries: Arc::new(RwLock::new(HashMap::new())),
			feed: ChangeFeed::new(channel_capacity),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl KvStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Record, StoreError> {
		let entries = self.entries.read().await;
		let entry = entries.get(key).ok_or(StoreError::NotFound)?;
		Ok(Record {
			key: key.to_string(),
			value: entry.value.clone(),
			revision: entry.revision,
			labels: entry.labels.clone(),
		})
	}

	async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<u64, StoreError> {
		let mut entries = self.entries.write().await;
		let existing = entries.get(key);

		match (options.precondition, existing) {
			(Precondition::Absent, Some(_)) => {
				return Err(StoreError::Conflict {
					key: key.to_string(),
				})
			},
			(Precondition::Revision(_), None) => return Err(StoreError::NotFound),
			(Precondition::Revision(expected), Some(entry)) if entry.revision != expected => {
				return Err(StoreError::Conflict {
					key: key.to_string(),
				})
			},
			_ => {},
		}

		let kind = if existing.is_some() {
			ChangeKind::Updated
		} else {
			ChangeKind::Created
		};
		let revision = existing.map(|e| e.revision).unwrap_or(0) + 1;

		entries.insert(
			key.to_string(),
			Entry {
				value: value.clone(),
				revision,
				labels: options.labels.clone(),
			},
		);

		self.feed.publish(Change {
			kind,
			record: Record {
				key: key.to_string(),
				value,
				revision,
				labels: options.labels,
			},
		});

		Ok(revision)
	}

	async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StoreError> {
		let entries = self.entries.read().await;
		Ok(entries
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(key, entry)| Record {
				key: key.clone(),
				value: entry.value.clone(),
				revision: entry.revision,
				labels: entry.labels.clone(),
			})
			.collect())
	}

	async fn get_by_label(&self, name: &str, value: &str) -> Result<Vec<Record>, StoreError> {
		let entries = self.entries.read().await;
		Ok(entries
			.iter()
			.filter(|(_, entry)| entry.labels.get(name).map(String::as_str) == Some(value))
			.map(|(key, entry)| Record {
				key: key.clone(),
				value: entry.value.clone(),
				revision: entry.revision,
				labels: entry.labels.clone(),
			})
			.collect())
	}

	fn watch(&self, prefix: &str) -> Changes {
		self.feed.subscribe(prefix)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStoreSchema)
	}
}

/// Configuration schema for MemoryStore.
pub struct MemoryStoreSchema;

impl ConfigSchema for MemoryStoreSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![Field::new(
				"channel_capacity",
				FieldType::Integer {
					min: Some(1),
					max: None,
				},
			)],
		);
		schema.validate(config)
	}
}

/// Registry for the in-memory storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = StoreFactory;

	fn factory() -> Self::Factory {
		create_store
	}
}

impl StoreRegistry for Registry {}

/// Factory function to create a memory storage backend from configuration.
///
/// Configuration parameters:
/// - `channel_capacity`: Capacity of the change broadcast channel (default: 256)
pub fn create_store(config: &toml::Value) -> Result<Box<dyn KvStore>, StoreError> {
	let channel_capacity = match config.get("channel_capacity").and_then(|v| v.as_integer()) {
		Some(v) => usize::try_from(v).ok().filter(|c| *c >= 1).ok_or_else(|| {
			StoreError::Configuration(format!("channel_capacity must be at least 1, got {}", v))
		})?,
		None => DEFAULT_CHANNEL_CAPACITY,
	};

	Ok(Box::new(MemoryStore::with_capacity(channel_capacity)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn put_and_get_with_revisions() {
		let store = MemoryStore::new();

		let first = store
			.put("k", b"one".to_vec(), PutOptions::default())
			.await
			.unwrap();
		assert_eq!(first, 1);

		let second = store
			.put("k", b"two".to_vec(), PutOptions::default())
			.await
			.unwrap();
		assert_eq!(second, 2);

		let record = store.get("k").await.unwrap();
		assert_eq!(record.value, b"two");
		assert_eq!(record.revision, 2);
	}

	#[tokio::test]
	async fn absent_precondition_rejects_existing_key() {
		let store = MemoryStore::new();
		store
			.put("k", b"one".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let result = store
			.put(
				"k",
				b"two".to_vec(),
				PutOptions::default().precondition(Precondition::Absent),
			)
			.await;
		assert!(matches!(result, Err(StoreError::Conflict { .. })));
	}

	#[tokio::test]
	async fn stale_revision_is_rejected() {
		let store = MemoryStore::new();
		store
			.put("k", b"one".to_vec(), PutOptions::default())
			.await
			.unwrap();
		store
			.put("k", b"two".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let result = store
			.put(
				"k",
				b"three".to_vec(),
				PutOptions::default().precondition(Precondition::Revision(1)),
			)
			.await;
		assert!(matches!(result, Err(StoreError::Conflict { .. })));

		// A write conditioned on the current revision commits.
		let revision = store
			.put(
				"k",
				b"three".to_vec(),
				PutOptions::default().precondition(Precondition::Revision(2)),
			)
			.await
			.unwrap();
		assert_eq!(revision, 3);
	}

	#[tokio::test]
	async fn revision_precondition_on_missing_key_is_not_found() {
		let store = MemoryStore::new();
		let result = store
			.put(
				"k",
				b"one".to_vec(),
				PutOptions::default().precondition(Precondition::Revision(1)),
			)
			.await;
		assert!(matches!(result, Err(StoreError::NotFound)));
	}

	#[tokio::test]
	async fn scan_and_label_lookup() {
		let store = MemoryStore::new();
		store
			.put(
				"order:1",
				b"a".to_vec(),
				PutOptions::default().label("label1", "orders:C1"),
			)
			.await
			.unwrap();
		store
			.put(
				"order:2",
				b"b".to_vec(),
				PutOptions::default().label("label1", "orders:C2"),
			)
			.await
			.unwrap();
		store
			.put("other:1", b"c".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let orders = store.scan("order:").await.unwrap();
		assert_eq!(orders.len(), 2);

		let tagged = store.get_by_label("label1", "orders:C1").await.unwrap();
		assert_eq!(tagged.len(), 1);
		assert_eq!(tagged[0].key, "order:1");
	}

	#[test]
	fn factory_rejects_non_positive_channel_capacity() {
		let config: toml::Value = "channel_capacity = -1".parse().unwrap();
		assert!(matches!(
			create_store(&config),
			Err(StoreError::Configuration(_))
		));

		let config: toml::Value = "channel_capacity = 0".parse().unwrap();
		assert!(matches!(
			create_store(&config),
			Err(StoreError::Configuration(_))
		));

		let config: toml::Value = "channel_capacity = 8".parse().unwrap();
		assert!(create_store(&config).is_ok());
	}

	#[tokio::test]
	async fn watch_receives_matching_changes_in_order() {
		let store = MemoryStore::new();
		let mut changes = store.watch("order:");

		store
			.put("order:1", b"a".to_vec(), PutOptions::default())
			.await
			.unwrap();
		store
			.put("other:1", b"b".to_vec(), PutOptions::default())
			.await
			.unwrap();
		store
			.put("order:1", b"c".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let first = changes.recv().await.unwrap();
		assert_eq!(first.kind, ChangeKind::Created);
		assert_eq!(first.record.key, "order:1");
		assert_eq!(first.record.revision, 1);

		// The write outside the prefix is filtered out.
		let second = changes.recv().await.unwrap();
		assert_eq!(second.kind, ChangeKind::Updated);
		assert_eq!(second.record.revision, 2);
	}
}
