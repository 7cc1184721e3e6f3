use std::{
	collections::hash_map::DefaultHasher,
	fs::OpenOptions,
	hash::{Hash, Hasher},
	io::{ErrorKind, Write},
	path::{Path, PathBuf},
	time::{Duration, SystemTime},
};

use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const STRIPES: usize = 64;

/// What an outbound message waiting for an asynchronous MDN left behind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRecord {
	pub mic: String,
	pub payload: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Take {
	/// The record matched and is gone, along with its payload
	Taken(PendingRecord),
	/// The record did not match and was left alone
	Kept(PendingRecord),
	Absent,
}

/// Durable records keyed by outbound message id. All operations on one id
/// are atomic with respect to each other.
pub trait PendingStore: Send + Sync {
	/// Fails with `Duplicate` rather than replace an existing record.
	fn put(&self, message_id: &str, record: &PendingRecord) -> Result<(), PendingError>;

	fn get(&self, message_id: &str) -> Result<Option<PendingRecord>, PendingError>;

	/// Removes the record and its payload. Removing a missing record is fine.
	fn delete(&self, message_id: &str) -> Result<(), PendingError>;

	/// Looks the record up and deletes it if `matches` says so, without
	/// letting anything else touch the record in between.
	fn take_if_matches(
		&self,
		message_id: &str,
		matches: &dyn Fn(&PendingRecord) -> bool,
	) -> Result<Take, PendingError>;

	/// Keeps a copy of an outbound payload until its MDN arrives
	fn store_payload(&self, message_id: &str, payload: &[u8]) -> Result<PathBuf, PendingError>;

	/// Deletes records older than `max_age`, returning their keys
	fn sweep(&self, max_age: Duration) -> Result<Vec<String>, PendingError>;
}

/// Pending records as files, one per message id. A record file holds the MIC
/// on its first line and the payload path on its second.
pub struct PendingDirectory {
	records: PathBuf,
	payloads: PathBuf,
	stripes: Vec<Mutex<()>>,
}

impl PendingDirectory {
	pub fn open<R: Into<PathBuf>, P: Into<PathBuf>>(records: R, payloads: P) -> std::io::Result<Self> {
		let records = records.into();
		let payloads = payloads.into();
		std::fs::create_dir_all(&records)?;
		std::fs::create_dir_all(&payloads)?;

		Ok(Self {
			records,
			payloads,
			stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
		})
	}

	pub fn records_dir(&self) -> &Path {
		&self.records
	}

	fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		self.stripes[(hasher.finish() % STRIPES as u64) as usize].lock()
	}

	fn read(&self, key: &str) -> Result<Option<PendingRecord>, PendingError> {
		let text = match std::fs::read_to_string(self.records.join(key)) {
			Ok(text) => text,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};

		let mut lines = text.lines();
		match (lines.next(), lines.next()) {
			(Some(mic), Some(payload)) if !payload.trim().is_empty() => Ok(Some(PendingRecord {
				mic: mic.to_string(),
				payload: PathBuf::from(payload.trim()),
			})),
			_ => Err(PendingError::Corrupt(key.to_string())),
		}
	}

	// An unreadable record is still removed, only its payload is left behind
	fn read_or_warn(&self, key: &str) -> Option<PendingRecord> {
		match self.read(key) {
			Ok(record) => record,
			Err(err) => {
				tracing::warn!(key, "removing pending record, its payload may be left behind: {}", err);
				None
			}
		}
	}

	fn remove(&self, key: &str, record: Option<&PendingRecord>) -> Result<(), PendingError> {
		if let Some(record) = record {
			ignore_missing(std::fs::remove_file(&record.payload))?;
		}
		ignore_missing(std::fs::remove_file(self.records.join(key)))?;

		Ok(())
	}
}

impl PendingStore for PendingDirectory {
	fn put(&self, message_id: &str, record: &PendingRecord) -> Result<(), PendingError> {
		let key = record_key(message_id);
		let _guard = self.lock(&key);

		let text = format!("{}\n{}\n", record.mic, record.payload.display());
		publish(&self.records, &key, text.as_bytes()).map_err(|err| duplicate(err, message_id))?;

		tracing::debug!(message_id, key = key.as_str(), "stored pending record");
		Ok(())
	}

	fn get(&self, message_id: &str) -> Result<Option<PendingRecord>, PendingError> {
		let key = record_key(message_id);
		let _guard = self.lock(&key);

		self.read(&key)
	}

	fn delete(&self, message_id: &str) -> Result<(), PendingError> {
		let key = record_key(message_id);
		let _guard = self.lock(&key);

		let record = self.read_or_warn(&key);
		self.remove(&key, record.as_ref())
	}

	fn take_if_matches(
		&self,
		message_id: &str,
		matches: &dyn Fn(&PendingRecord) -> bool,
	) -> Result<Take, PendingError> {
		let key = record_key(message_id);
		let _guard = self.lock(&key);

		let record = match self.read(&key)? {
			Some(record) => record,
			None => return Ok(Take::Absent),
		};

		if matches(&record) {
			self.remove(&key, Some(&record))?;
			Ok(Take::Taken(record))
		} else {
			Ok(Take::Kept(record))
		}
	}

	fn store_payload(&self, message_id: &str, payload: &[u8]) -> Result<PathBuf, PendingError> {
		let key = record_key(message_id);
		let _guard = self.lock(&key);

		// The payload of a live record is never replaced
		if self.records.join(&key).exists() {
			return Err(PendingError::Duplicate(message_id.to_string()));
		}

		publish(&self.payloads, &key, payload).map_err(|err| duplicate(err, message_id))
	}

	fn sweep(&self, max_age: Duration) -> Result<Vec<String>, PendingError> {
		let now = SystemTime::now();
		let mut removed = vec![];

		for entry in std::fs::read_dir(&self.records)? {
			let entry = entry?;
			let key = entry.file_name().to_string_lossy().into_owned();
			if key.starts_with('.') {
				continue;
			}

			let _guard = self.lock(&key);

			let modified = match entry.metadata().and_then(|meta| meta.modified()) {
				Ok(modified) => modified,
				Err(err) if err.kind() == ErrorKind::NotFound => continue,
				Err(err) => return Err(err.into()),
			};

			if now.duration_since(modified).unwrap_or_default() <= max_age {
				continue;
			}

			let record = self.read_or_warn(&key);
			self.remove(&key, record.as_ref())?;
			tracing::info!(key = key.as_str(), "swept expired pending record");
			removed.push(key);
		}

		Ok(removed)
	}
}

/// A file name for a message id. Angle brackets and surrounding whitespace
/// are dropped, anything outside a conservative character set becomes `_`,
/// and a digest of the id keeps distinct ids apart.
pub fn record_key(message_id: &str) -> String {
	let id = message_id.trim();
	let id = id.strip_prefix('<').unwrap_or(id);
	let id = id.strip_suffix('>').unwrap_or(id).trim();

	let mut safe: String = id
		.chars()
		.take(96)
		.map(|c| match c {
			'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '@' => c,
			_ => '_',
		})
		.collect();
	if safe.starts_with('.') || safe.is_empty() {
		safe.insert(0, '_');
	}

	let digest = Sha256::digest(id.as_bytes());
	let suffix: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();

	format!("{}-{}", safe, suffix)
}

/// Writes `bytes` to `dir/name` through a temporary file. Linking fails if the
/// name exists, so nothing already published is ever replaced.
fn publish(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
	let path = dir.join(name);
	let tmp = dir.join(format!(".{}.{:08x}.tmp", name, rand::thread_rng().gen::<u32>()));

	{
		let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
		file.write_all(bytes)?;
		file.sync_all()?;
	}

	let linked = std::fs::hard_link(&tmp, &path);
	ignore_missing(std::fs::remove_file(&tmp))?;
	linked.map(|()| path)
}

fn duplicate(err: std::io::Error, message_id: &str) -> PendingError {
	match err.kind() {
		ErrorKind::AlreadyExists => PendingError::Duplicate(message_id.to_string()),
		_ => err.into(),
	}
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
	match result {
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
		other => other,
	}
}

#[derive(Debug, Error)]
pub enum PendingError {
	#[error("a pending record for '{0}' already exists")]
	Duplicate(String),
	#[error("pending record '{0}' is unreadable")]
	Corrupt(String),
	#[error("pending store I/O failed")]
	Io(#[from] std::io::Error),
}
