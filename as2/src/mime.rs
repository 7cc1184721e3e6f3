use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use thiserror::Error;

use crate::headers::{
	Headers, ParseHeaderError, CONTENT_TRANSFER_ENCODING, CONTENT_TYPE,
};

/// A MIME entity: its own header block and the (still transfer-encoded) content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimePart {
	pub headers: Headers,
	pub content: Vec<u8>,
}

impl MimePart {
	pub fn new<S: Into<String>>(content_type: S, content: Vec<u8>) -> Self {
		let mut headers = Headers::new();
		headers.set(CONTENT_TYPE, content_type);

		Self { headers, content }
	}

	pub fn content_type(&self) -> Option<&str> {
		self.headers.get(CONTENT_TYPE)
	}

	/// The lowercased `type/subtype` without parameters. Parts without a
	/// Content-Type are `text/plain` as per RFC 2045.
	pub fn media_type(&self) -> String {
		media_type(self.content_type().unwrap_or("text/plain"))
	}

	pub fn is_media_type(&self, media: &str) -> bool {
		self.media_type().eq_ignore_ascii_case(media)
	}

	pub fn is_text(&self) -> bool {
		self.media_type().starts_with("text/")
	}

	pub fn transfer_encoding(&self) -> Option<&str> {
		self.headers.get(CONTENT_TRANSFER_ENCODING)
	}

	pub fn boundary(&self) -> Option<String> {
		self.content_type().and_then(|ct| parameter(ct, "boundary"))
	}

	/// Header block, blank line, content
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.content.len() + 128);
		self.headers.write_to(&mut out);
		out.extend_from_slice(b"\r\n");
		out.extend_from_slice(&self.content);
		out
	}

	/// Splits raw bytes at the first blank line into headers and content.
	pub fn parse(bytes: &[u8]) -> Result<Self, MimeError> {
		let (head, content) = split_head(bytes).ok_or(MimeError::NoHeaderTerminator)?;
		let head = std::str::from_utf8(head).map_err(|_| MimeError::NonAsciiHeaders)?;

		Ok(Self {
			headers: head.parse()?,
			content: content.to_vec(),
		})
	}

	/// The content with its Content-Transfer-Encoding undone. Only base64 needs
	/// any work; 7bit, 8bit and binary are identities.
	pub fn decoded_content(&self) -> Result<Vec<u8>, MimeError> {
		match self.transfer_encoding() {
			Some(cte) if cte.trim().eq_ignore_ascii_case("base64") => decode_base64(&self.content),
			_ => Ok(self.content.clone()),
		}
	}

	/// The raw bytes of each body part of a multipart entity, in order.
	pub fn raw_parts(&self) -> Result<Vec<&[u8]>, MimeError> {
		let boundary = self.boundary().ok_or(MimeError::NoBoundary)?;
		let delimiter = format!("--{}", boundary);
		let delimiter = delimiter.as_bytes();
		let content = &self.content;

		let mut starts = vec![];
		let mut from = 0;
		while let Some(index) = find(content, delimiter, from) {
			from = index + delimiter.len();
			if index == 0 || content[index - 1] == b'\n' {
				starts.push(index);
			}
		}

		let mut parts = vec![];
		for window in starts.windows(2) {
			let (start, next) = (window[0], window[1]);

			if content[start + delimiter.len()..].starts_with(b"--") {
				break;
			}

			let body_start = match find(content, b"\n", start) {
				Some(newline) => newline + 1,
				None => break,
			};

			// The line break before a delimiter belongs to the delimiter
			let mut body_end = next;
			if body_end > body_start && content[body_end - 1] == b'\n' {
				body_end -= 1;
				if body_end > body_start && content[body_end - 1] == b'\r' {
					body_end -= 1;
				}
			}

			parts.push(&content[body_start..body_end.max(body_start)]);
		}

		if parts.is_empty() {
			Err(MimeError::NoParts)
		} else {
			Ok(parts)
		}
	}

	pub fn parts(&self) -> Result<Vec<MimePart>, MimeError> {
		self.raw_parts()?.into_iter().map(MimePart::parse).collect()
	}

	/// Builds a multipart entity. `content_type` is the full header value and
	/// must carry the same `boundary`.
	pub fn multipart<S: Into<String>>(content_type: S, boundary: &str, parts: &[Vec<u8>]) -> Self {
		let mut content = vec![];

		for part in parts {
			content.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
			content.extend_from_slice(part);
			content.extend_from_slice(b"\r\n");
		}
		content.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

		Self::new(content_type, content)
	}
}

pub fn new_boundary() -> String {
	let random: u64 = rand::thread_rng().gen();
	format!("----=_Part_{:016x}", random)
}

/// `type/subtype` of a Content-Type value, lowercased
pub fn media_type(content_type: &str) -> String {
	content_type
		.split(';')
		.next()
		.unwrap_or_default()
		.trim()
		.to_ascii_lowercase()
}

/// Looks up a parameter of a structured header value such as
/// `multipart/signed; boundary="abc"; micalg=sha-256`. Quotes are removed.
pub fn parameter(value: &str, name: &str) -> Option<String> {
	value.split(';').skip(1).find_map(|param| {
		let (key, value) = param.split_once('=')?;

		if key.trim().eq_ignore_ascii_case(name) {
			Some(value.trim().trim_matches('"').to_string())
		} else {
			None
		}
	})
}

pub fn encode_base64_lines(data: &[u8]) -> Vec<u8> {
	let encoded = STANDARD.encode(data);
	let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 38);

	for line in encoded.as_bytes().chunks(76) {
		out.extend_from_slice(line);
		out.extend_from_slice(b"\r\n");
	}

	out
}

pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>, MimeError> {
	let stripped: Vec<u8> = data
		.iter()
		.copied()
		.filter(|b| !b.is_ascii_whitespace())
		.collect();

	STANDARD
		.decode(stripped)
		.map_err(|_| MimeError::InvalidBase64)
}

fn split_head(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
	if let Some(rest) = bytes.strip_prefix(b"\r\n") {
		return Some((&[], rest));
	}
	if let Some(rest) = bytes.strip_prefix(b"\n") {
		return Some((&[], rest));
	}

	let crlf = find(bytes, b"\r\n\r\n", 0).map(|i| (i, i + 4));
	let lf = find(bytes, b"\n\n", 0).map(|i| (i, i + 2));

	let (head_end, body_start) = match (crlf, lf) {
		(Some(a), Some(b)) => {
			if a.0 <= b.0 {
				a
			} else {
				b
			}
		}
		(Some(a), None) => a,
		(None, Some(b)) => b,
		(None, None) => return None,
	};

	Some((&bytes[..head_end], &bytes[body_start..]))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
	if needle.is_empty() || from >= haystack.len() {
		return None;
	}

	haystack[from..]
		.windows(needle.len())
		.position(|window| window == needle)
		.map(|index| index + from)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MimeError {
	#[error("no blank line between MIME headers and content")]
	NoHeaderTerminator,
	#[error("MIME headers are not valid text")]
	NonAsciiHeaders,
	#[error("bad MIME header: {0}")]
	BadHeader(#[from] ParseHeaderError),
	#[error("multipart content type has no boundary")]
	NoBoundary,
	#[error("multipart entity has no body parts")]
	NoParts,
	#[error("content is not valid base64")]
	InvalidBase64,
}
