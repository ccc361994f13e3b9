//! File-based storage backend implementation for the order tracker.
//!
//! This module stores each record as a binary file on the filesystem,
//! providing simple persistence without external dependencies. Files carry a
//! fixed-size header with the committed revision, followed by a JSON envelope
//! holding the original key and the secondary index labels, followed by the
//! raw value bytes. Writes go through a temp-file-then-rename so a crashed
//! write never leaves a half-written record behind.

use crate::{
	Change, ChangeFeed, ChangeKind, Changes, KvStore, Precondition, PutOptions, Record, StoreError,
	StoreFactory, StoreRegistry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracker_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError,
};

/// Default capacity of the change broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[allow(clippy::doc_nested_refdefs)]
/// Fixed-size file header carrying the record revision.
///
/// Binary layout (64 bytes total):
/// - [0-3]: Magic bytes "OTKV"
/// - [4-5]: Version (u16, little-endian)
/// - [6-13]: Revision (u64, little-endian)
/// - [14-17]: Envelope length in bytes (u32, little-endian)
/// - [18-63]: Reserved/padding for future use
#[derive(Debug, Clone)]
struct FileHeader {
	revision: u64,
	envelope_len: u32,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"OTKV";
	const VERSION: u16 = 1;
	const SIZE: usize = 64;

	/// Serializes the header to bytes.
	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&Self::VERSION.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.revision.to_le_bytes());
		bytes[14..18].copy_from_slice(&self.envelope_len.to_le_bytes());
		bytes
	}

	/// Deserializes a header from bytes.
	fn deserialize(bytes: &[u8]) -> Result<Self, StoreError> {
		if bytes.len() < Self::SIZE {
			return Err(StoreError::Backend("File too small for header".into()));
		}

		if &bytes[0..4] != Self::MAGIC {
			return Err(StoreError::Backend("Unrecognized file format".into()));
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StoreError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut revision_bytes = [0u8; 8];
		revision_bytes.copy_from_slice(&bytes[6..14]);
		let mut len_bytes = [0u8; 4];
		len_bytes.copy_from_slice(&bytes[14..18]);

		Ok(Self {
			revision: u64::from_le_bytes(revision_bytes),
			envelope_len: u32::from_le_bytes(len_bytes),
		})
	}
}

/// JSON envelope stored between the header and the value bytes.
///
/// The key is kept here because the filename sanitization is lossy.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
	key: String,
	labels: HashMap<String, String>,
}

/// File-based storage implementation.
pub struct FileStore {
	/// Base directory path for storing files.
	base_path: PathBuf,
	/// Fan-out point for committed writes.
	feed: ChangeFeed,
	/// Serializes read-check-write cycles so conditional puts are atomic.
	write_lock: Mutex<()>,
}

impl FileStore {
	/// Creates a new FileStore rooted at the given base path.
	pub fn new(base_path: PathBuf, channel_capacity: usize) -> Self {
		Self {
			base_path,
			feed: ChangeFeed::new(channel_capacity),
			write_lock: Mutex::new(()),
		}
	}

	/// Converts a storage key to a filesystem-safe file path.
	///
	/// The escape character escapes itself, so distinct keys never map to
	/// the same file.
	fn file_path(&self, key: &str) -> PathBuf {
		let mut safe_key = String::with_capacity(key.len());
		for ch in key.chars() {
			match ch {
				'_' => safe_key.push_str("__"),
				':' => safe_key.push_str("_c"),
				'/' => safe_key.push_str("_s"),
				ch => safe_key.push(ch),
			}
		}
		self.base_path.join(format!("{}.bin", safe_key))
	}

	/// Reads and decodes the record stored in the given file.
	async fn read_record(&self, path: &PathBuf) -> Result<Record, StoreError> {
		let data = match fs::read(path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(StoreError::NotFound)
			},
			Err(e) => return Err(StoreError::Backend(e.to_string())),
		};

		let header = FileHeader::deserialize(&data)?;
		let envelope_end = FileHeader::SIZE + header.envelope_len as usize;
		if data.len() < envelope_end {
			return Err(StoreError::Backend("Truncated record envelope".into()));
		}

		let envelope: Envelope = serde_json::from_slice(&data[FileHeader::SIZE..envelope_end])
			.map_err(|e| StoreError::Serialization(e.to_string()))?;

		Ok(Record {
			key: envelope.key,
			value: data[envelope_end..].to_vec(),
			revision: header.revision,
			labels: envelope.labels,
		})
	}

	/// Reads every decodable record under the base path.
	async fn read_all(&self) -> Result<Vec<Record>, StoreError> {
		let mut records = Vec::new();
		let mut entries = match fs::read_dir(&self.base_path).await {
			Ok(entries) => entries,
			// A store nothing was ever written to is simply empty.
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
			Err(e) => return Err(StoreError::Backend(e.to_string())),
		};

		while let Some(entry) = entries
			.next_entry()
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))?
		{
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}
			match self.read_record(&path).await {
				Ok(record) => records.push(record),
				Err(e) => {
					tracing::debug!("Skipping file {:?}: {}", path, e);
				},
			}
		}

		Ok(records)
	}
}

#[async_trait]
impl KvStore for FileStore {
	async fn get(&self, key: &str) -> Result<Record, StoreError> {
		let record = self.read_record(&self.file_path(key)).await?;
		// A record written under a different key must not satisfy this one.
		if record.key != key {
			return Err(StoreError::NotFound);
		}
		Ok(record)
	}

	async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<u64, StoreError> {
		// The lock spans the revision read and the rename, so the
		// precondition cannot be invalidated by a concurrent put.
		let _guard = self.write_lock.lock().await;

		let path = self.file_path(key);
		let existing = match self.read_record(&path).await {
			Ok(record) => Some(record),
			Err(StoreError::NotFound) => None,
			Err(e) => return Err(e),
		};

		match (options.precondition, &existing) {
			(Precondition::Absent, Some(_)) => {
				return Err(StoreError::Conflict {
					key: key.to_string(),
				})
			},
			(Precondition::Revision(_), None) => return Err(StoreError::NotFound),
			(Precondition::Revision(expected), Some(record)) if record.revision != expected => {
				return Err(StoreError::Conflict {
					key: key.to_string(),
				})
			},
			_ => {},
		}

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| StoreError::Backend(e.to_string()))?;
		}

		let kind = if existing.is_some() {
			ChangeKind::Updated
		} else {
			ChangeKind::Created
		};
		let revision = existing.map(|r| r.revision).unwrap_or(0) + 1;

		let envelope = Envelope {
			key: key.to_string(),
			labels: options.labels.clone(),
		};
		let envelope_bytes =
			serde_json::to_vec(&envelope).map_err(|e| StoreError::Serialization(e.to_string()))?;
		let header = FileHeader {
			revision,
			envelope_len: envelope_bytes.len() as u32,
		};

		let mut file_data =
			Vec::with_capacity(FileHeader::SIZE + envelope_bytes.len() + value.len());
		file_data.extend_from_slice(&header.serialize());
		file_data.extend_from_slice(&envelope_bytes);
		file_data.extend_from_slice(&value);

		// Write atomically by writing to temp file then renaming
		let temp_path = path.with_extension("tmp");
		fs::write(&temp_path, file_data)
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))?;
		fs::rename(&temp_path, &path)
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))?;

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
		let mut records = self.read_all().await?;
		records.retain(|record| record.key.starts_with(prefix));
		Ok(records)
	}

	async fn get_by_label(&self, name: &str, value: &str) -> Result<Vec<Record>, StoreError> {
		let mut records = self.read_all().await?;
		records.retain(|record| record.labels.get(name).map(String::as_str) == Some(value));
		Ok(records)
	}

	fn watch(&self, prefix: &str) -> Changes {
		self.feed.subscribe(prefix)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStoreSchema)
	}
}

/// Configuration schema for FileStore.
pub struct FileStoreSchema;

impl ConfigSchema for FileStoreSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("storage_path", FieldType::String),
				Field::new(
					"channel_capacity",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
			],
		);
		schema.validate(config)
	}
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StoreFactory;

	fn factory() -> Self::Factory {
		create_store
	}
}

impl StoreRegistry for Registry {}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for record files (default: "./data/orders")
/// - `channel_capacity`: Capacity of the change broadcast channel (default: 256)
pub fn create_store(config: &toml::Value) -> Result<Box<dyn KvStore>, StoreError> {
	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/orders")
		.to_string();

	let channel_capacity = match config.get("channel_capacity").and_then(|v| v.as_integer()) {
		Some(v) => usize::try_from(v).ok().filter(|c| *c >= 1).ok_or_else(|| {
			StoreError::Configuration(format!("channel_capacity must be at least 1, got {}", v))
		})?,
		None => DEFAULT_CHANNEL_CAPACITY,
	};

	Ok(Box::new(FileStore::new(
		PathBuf::from(storage_path),
		channel_capacity,
	)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn store(dir: &TempDir) -> FileStore {
		FileStore::new(dir.path().to_path_buf(), DEFAULT_CHANNEL_CAPACITY)
	}

	#[tokio::test]
	async fn put_get_roundtrip_with_labels() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);

		let revision = store
			.put(
				"order:1",
				b"payload".to_vec(),
				PutOptions::default().label("label1", "orders:C1"),
			)
			.await
			.unwrap();
		assert_eq!(revision, 1);

		let record = store.get("order:1").await.unwrap();
		assert_eq!(record.key, "order:1");
		assert_eq!(record.value, b"payload");
		assert_eq!(record.labels.get("label1").unwrap(), "orders:C1");
	}

	#[tokio::test]
	async fn records_survive_reopening_the_store() {
		let dir = TempDir::new().unwrap();
		{
			let store = store(&dir);
			store
				.put("order:1", b"payload".to_vec(), PutOptions::default())
				.await
				.unwrap();
			store
				.put("order:1", b"payload2".to_vec(), PutOptions::default())
				.await
				.unwrap();
		}

		let reopened = store(&dir);
		let record = reopened.get("order:1").await.unwrap();
		assert_eq!(record.value, b"payload2");
		assert_eq!(record.revision, 2);

		// Compare-and-swap works against the persisted revision.
		let result = reopened
			.put(
				"order:1",
				b"stale".to_vec(),
				PutOptions::default().precondition(Precondition::Revision(1)),
			)
			.await;
		assert!(matches!(result, Err(StoreError::Conflict { .. })));
	}

	#[tokio::test]
	async fn scan_and_label_lookup_recover_original_keys() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);

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

		let mut orders = store.scan("order:").await.unwrap();
		orders.sort_by(|a, b| a.key.cmp(&b.key));
		assert_eq!(orders.len(), 2);
		assert_eq!(orders[0].key, "order:1");

		let tagged = store.get_by_label("label1", "orders:C2").await.unwrap();
		assert_eq!(tagged.len(), 1);
		assert_eq!(tagged[0].key, "order:2");
	}

	#[tokio::test]
	async fn distinct_keys_never_share_a_file() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);

		store
			.put("order:1", b"colon".to_vec(), PutOptions::default())
			.await
			.unwrap();
		store
			.put("order_1", b"underscore".to_vec(), PutOptions::default())
			.await
			.unwrap();
		store
			.put("order_c1", b"escaped".to_vec(), PutOptions::default())
			.await
			.unwrap();

		assert_eq!(store.get("order:1").await.unwrap().value, b"colon");
		assert_eq!(store.get("order_1").await.unwrap().value, b"underscore");
		assert_eq!(store.get("order_c1").await.unwrap().value, b"escaped");
		assert_eq!(store.scan("order").await.unwrap().len(), 3);
	}

	#[tokio::test]
	async fn missing_key_is_not_found() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);
		assert!(matches!(
			store.get("order:missing").await,
			Err(StoreError::NotFound)
		));
		// Scanning an empty store is not an error.
		assert!(store.scan("order:").await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn absent_precondition_rejects_existing_file() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);

		store
			.put("order:1", b"a".to_vec(), PutOptions::default())
			.await
			.unwrap();
		let result = store
			.put(
				"order:1",
				b"b".to_vec(),
				PutOptions::default().precondition(Precondition::Absent),
			)
			.await;
		assert!(matches!(result, Err(StoreError::Conflict { .. })));
	}

	#[test]
	fn factory_rejects_non_positive_channel_capacity() {
		let config: toml::Value = "channel_capacity = -1".parse().unwrap();
		assert!(matches!(
			create_store(&config),
			Err(StoreError::Configuration(_))
		));

		let config: toml::Value = "storage_path = \"./data\"\nchannel_capacity = 16".parse().unwrap();
		assert!(create_store(&config).is_ok());
	}

	#[tokio::test]
	async fn watch_sees_committed_writes() {
		let dir = TempDir::new().unwrap();
		let store = store(&dir);
		let mut changes = store.watch("order:");

		store
			.put("order:1", b"a".to_vec(), PutOptions::default())
			.await
			.unwrap();

		let change = changes.recv().await.unwrap();
		assert_eq!(change.kind, ChangeKind::Created);
		assert_eq!(change.record.key, "order:1");
	}
}
