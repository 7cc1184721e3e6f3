use std::{
	fs::OpenOptions,
	io::{ErrorKind, Write},
	path::{Path, PathBuf},
	time::SystemTime,
};

use gethostname::gethostname;
use rand::Rng;
use thiserror::Error;

use crate::{mdn::Mdn, message::Message};

/// Where received messages and MDNs are kept once processed. Running without
/// one is allowed; nothing is stored then.
pub trait MessageStore: Send + Sync {
	fn store_message(&self, message: &Message) -> Result<PathBuf, StoreError>;

	fn store_mdn(&self, mdn: &Mdn) -> Result<PathBuf, StoreError>;
}

/// A maildir: files are written into `tmp` and renamed into `new` once
/// complete, so readers of `new` never see a partial file.
pub struct Maildir {
	maildir: PathBuf,
}

impl Maildir {
	pub fn new<B: Into<PathBuf>>(maildir: B) -> Self {
		Self {
			maildir: maildir.into(),
		}
	}

	pub fn path(&self) -> &Path {
		&self.maildir
	}

	pub fn create_directories(&self) -> std::io::Result<()> {
		for sub in ["tmp", "new", "cur"] {
			std::fs::create_dir_all(self.maildir.join(sub))?;
		}

		Ok(())
	}

	pub fn save(&self, contents: &[u8]) -> std::io::Result<PathBuf> {
		loop {
			let unique_name = Self::get_unique_name();
			let tmp_path = self.maildir.join("tmp").join(&unique_name);
			let new_path = self.maildir.join("new").join(&unique_name);

			let mut tmp = match OpenOptions::new().write(true).create_new(true).open(&tmp_path) {
				Ok(file) => file,
				Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
				Err(err) => return Err(err),
			};
			tmp.write_all(contents)?;
			tmp.sync_all()?;
			drop(tmp);

			std::fs::rename(tmp_path, &new_path)?;
			return Ok(new_path);
		}
	}

	fn get_unique_name() -> String {
		let secs = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|time| time.as_secs())
			.unwrap_or_default();
		let middle: u32 = rand::thread_rng().gen();
		let hostname = gethostname().to_string_lossy().replace('/', "-");

		format!("{}.{:08x}.{}", secs, middle, hostname)
	}
}

/// Messages and MDNs in two maildirs under one root
pub struct DirectoryStore {
	messages: Maildir,
	mdns: Maildir,
}

impl DirectoryStore {
	pub fn open<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
		let messages = Maildir::new(root.as_ref().join("messages"));
		let mdns = Maildir::new(root.as_ref().join("mdn"));
		messages.create_directories()?;
		mdns.create_directories()?;

		Ok(Self { messages, mdns })
	}
}

impl MessageStore for DirectoryStore {
	fn store_message(&self, message: &Message) -> Result<PathBuf, StoreError> {
		let data = message.data.as_ref().ok_or(StoreError::NoData)?;

		let mut contents = vec![];
		message.headers.write_to(&mut contents);
		contents.extend_from_slice(b"\r\n");
		contents.extend_from_slice(&data.to_bytes());

		let path = self.messages.save(&contents)?;
		tracing::info!(
			message_id = message.message_id().unwrap_or_default(),
			path = %path.display(),
			"stored message"
		);
		Ok(path)
	}

	fn store_mdn(&self, mdn: &Mdn) -> Result<PathBuf, StoreError> {
		let mut contents = b"Headers:\r\n".to_vec();
		mdn.headers.write_to(&mut contents);

		contents.extend_from_slice(b"\r\nAttributes:\r\n");
		for (key, value) in &mdn.attributes {
			contents.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
		}

		contents.extend_from_slice(b"\r\nText:\r\n");
		contents.extend_from_slice(mdn.text.as_bytes());

		let path = self.mdns.save(&contents)?;
		tracing::info!(
			message_id = mdn.message_id().unwrap_or_default(),
			path = %path.display(),
			"stored MDN"
		);
		Ok(path)
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("message has no content to store")]
	NoData,
	#[error("failed to write to the store")]
	Io(#[from] std::io::Error),
}
