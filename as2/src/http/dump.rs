use std::{
	fs::OpenOptions,
	io::{ErrorKind, Write},
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
	time::SystemTime,
};

use super::Request;

/// Writes every inbound request verbatim to a directory for debugging.
/// Nothing here is allowed to interrupt the exchange, errors are only logged.
pub struct DumpDirectory {
	dir: PathBuf,
	counter: AtomicU64,
}

impl DumpDirectory {
	pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
		Self {
			dir: dir.into(),
			counter: AtomicU64::new(0),
		}
	}

	pub fn path(&self) -> &Path {
		&self.dir
	}

	pub fn dump(&self, request: &Request) -> Option<PathBuf> {
		match self.write(request) {
			Ok(path) => {
				tracing::debug!(path = %path.display(), "dumped request");
				Some(path)
			}
			Err(err) => {
				tracing::warn!(dir = %self.dir.display(), "failed to dump request: {}", err);
				None
			}
		}
	}

	fn write(&self, request: &Request) -> std::io::Result<PathBuf> {
		std::fs::create_dir_all(&self.dir)?;

		let millis = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|time| time.as_millis())
			.unwrap_or_default();

		loop {
			let count = self.counter.fetch_add(1, Ordering::Relaxed);
			let path = self.dir.join(format!("as2-{}-{}.http", millis, count));

			let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
				Ok(file) => file,
				Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
				Err(err) => return Err(err),
			};

			let mut head = vec![];
			request.headers.write_to(&mut head);
			head.extend_from_slice(b"\r\n");

			file.write_all(&head)?;
			file.write_all(&request.body)?;

			return Ok(path);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::headers::Headers;

	#[test]
	fn dumps_headers_and_body() {
		let dir = tempfile::tempdir().unwrap();
		let dump = DumpDirectory::new(dir.path().join("dumps"));

		let mut headers = Headers::new();
		headers.set("AS2-From", "alice");
		let request = Request::new("POST", "/", headers, b"body".to_vec());

		let first = dump.dump(&request).unwrap();
		let second = dump.dump(&request).unwrap();
		assert_ne!(first, second);

		let name = first.file_name().unwrap().to_string_lossy().into_owned();
		assert!(name.starts_with("as2-") && name.ends_with(".http"));
		assert_eq!(std::fs::read(first).unwrap(), b"AS2-From: alice\r\n\r\nbody");
	}

	#[test]
	fn failure_is_swallowed() {
		let dir = tempfile::tempdir().unwrap();
		let blocker = dir.path().join("file");
		std::fs::write(&blocker, b"").unwrap();

		let dump = DumpDirectory::new(blocker.join("nested"));
		let request = Request::new("POST", "/", Headers::new(), vec![]);

		assert!(dump.dump(&request).is_none());
	}
}
