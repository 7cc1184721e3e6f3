use std::{fmt::Display, str::FromStr};

use thiserror::Error;

pub const AS2_FROM: &str = "AS2-From";
pub const AS2_TO: &str = "AS2-To";
pub const AS2_VERSION: &str = "AS2-Version";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const MESSAGE_ID: &str = "Message-ID";
pub const DATE: &str = "Date";
pub const SUBJECT: &str = "Subject";
pub const MIME_VERSION: &str = "Mime-Version";
pub const DISPOSITION_NOTIFICATION_TO: &str = "Disposition-Notification-To";
pub const DISPOSITION_NOTIFICATION_OPTIONS: &str = "Disposition-Notification-Options";
pub const RECEIPT_DELIVERY_OPTION: &str = "Receipt-Delivery-Option";

/// An ordered list of header fields. Names compare case-insensitively and a
/// name may occur more than once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
	entries: Vec<(String, String)>,
}

impl Headers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the first value stored under `name`
	pub fn get(&self, name: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
		self.entries
			.iter()
			.filter(move |(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	/// All values of `name` joined by `delimiter`, or None if there are none.
	pub fn get_joined(&self, name: &str, delimiter: &str) -> Option<String> {
		let values: Vec<&str> = self.get_all(name).collect();

		if values.is_empty() {
			None
		} else {
			Some(values.join(delimiter))
		}
	}

	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Replaces every value of `name` with a single value, keeping the position
	/// of the first occurrence.
	pub fn set<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
		let name = name.into();
		let value = value.into();
		let mut found = false;

		self.entries.retain_mut(|(key, existing)| {
			if !key.eq_ignore_ascii_case(&name) {
				return true;
			}

			if found {
				false
			} else {
				found = true;
				*existing = value.clone();
				true
			}
		});

		if !found {
			self.entries.push((name, value));
		}
	}

	pub fn add<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
		self.entries.push((name.into(), value.into()));
	}

	/// Removes all values of `name`, returning whether there were any.
	pub fn remove(&mut self, name: &str) -> bool {
		let before = self.entries.len();
		self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
		before != self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries
			.iter()
			.map(|(key, value)| (key.as_str(), value.as_str()))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn header_lines(&self) -> impl Iterator<Item = String> + '_ {
		self.iter().map(|(key, value)| format!("{}: {}", key, value))
	}

	/// Writes every header as `name: value\r\n`. No trailing blank line.
	pub fn write_to(&self, out: &mut Vec<u8>) {
		for line in self.header_lines() {
			out.extend_from_slice(line.as_bytes());
			out.extend_from_slice(b"\r\n");
		}
	}

	/// Builds headers from raw lines without their line endings. Lines starting
	/// with a space or tab continue the previous header.
	pub fn from_lines<I, S>(lines: I) -> Result<Self, ParseHeaderError>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut headers = Headers::new();

		for line in lines {
			let line = line.as_ref();

			if line.starts_with(' ') || line.starts_with('\t') {
				match headers.entries.last_mut() {
					Some((_, value)) => {
						value.push(' ');
						value.push_str(line.trim());
					}
					None => return Err(ParseHeaderError::OrphanContinuation),
				}
				continue;
			}

			let (name, value) = line
				.split_once(':')
				.ok_or_else(|| ParseHeaderError::MissingColon(line.to_string()))?;

			let name = name.trim();
			if name.is_empty() {
				return Err(ParseHeaderError::EmptyName);
			}

			headers.add(name, value.trim());
		}

		Ok(headers)
	}
}

impl FromStr for Headers {
	type Err = ParseHeaderError;

	/// Parses a header block. Parsing stops at the first empty line.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_lines(
			s.split('\n')
				.map(|line| line.strip_suffix('\r').unwrap_or(line))
				.take_while(|line| !line.is_empty()),
		)
	}
}

impl Display for Headers {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		for line in self.header_lines() {
			write!(f, "{}\r\n", line)?;
		}

		Ok(())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHeaderError {
	#[error("header line has no colon: '{0}'")]
	MissingColon(String),
	#[error("header name is empty")]
	EmptyName,
	#[error("continuation line without a header to continue")]
	OrphanContinuation,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn lookup_is_case_insensitive() {
		let mut headers = Headers::new();
		headers.add("Content-Type", "text/plain");

		assert_eq!(headers.get("content-type"), Some("text/plain"));
		assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
		assert!(headers.get("Content-Length").is_none());
	}

	#[test]
	fn multiple_values() {
		let mut headers = Headers::new();
		headers.add("X-Thing", "one");
		headers.add("Other", "o");
		headers.add("x-thing", "two");

		assert_eq!(headers.get_all("X-THING").collect::<Vec<_>>(), vec!["one", "two"]);
		assert_eq!(headers.get_joined("x-thing", ", "), Some("one, two".to_string()));

		headers.set("X-Thing", "three");
		assert_eq!(headers.get_all("x-thing").collect::<Vec<_>>(), vec!["three"]);
		assert_eq!(headers.iter().next(), Some(("X-Thing", "three")));
	}

	#[test]
	fn folded_lines() {
		let headers: Headers = "Subject: a long\r\n\tsubject line\r\nAS2-To: bob\r\n\r\nbody"
			.parse()
			.unwrap();

		assert_eq!(headers.get("subject"), Some("a long subject line"));
		assert_eq!(headers.get("as2-to"), Some("bob"));
		assert_eq!(headers.len(), 2);
	}

	#[test]
	fn bad_lines() {
		assert_eq!(
			Headers::from_lines(["no colon here"]),
			Err(ParseHeaderError::MissingColon("no colon here".into()))
		);
		assert_eq!(
			Headers::from_lines([" continued"]),
			Err(ParseHeaderError::OrphanContinuation)
		);
	}

	#[test]
	fn remove_all() {
		let mut headers = Headers::new();
		headers.add("A", "1");
		headers.add("a", "2");

		assert!(headers.remove("A"));
		assert!(headers.is_empty());
		assert!(!headers.remove("A"));
	}
}
