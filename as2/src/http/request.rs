use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};

use super::{chunked::decode_chunked, HttpError, Responder, LENGTH_REQUIRED};
use crate::headers::{Headers, CONTENT_LENGTH, TRANSFER_ENCODING};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
	pub method: String,
	pub path: String,
	pub version: String,
	pub headers: Headers,
	pub body: Vec<u8>,
}

impl Request {
	pub fn new<M: Into<String>, P: Into<String>>(method: M, path: P, headers: Headers, body: Vec<u8>) -> Self {
		Self {
			method: method.into(),
			path: path.into(),
			version: "HTTP/1.1".into(),
			headers,
			body,
		}
	}

	/// The request as it goes on the wire. With `chunk_size` the body is sent
	/// chunked and Content-Length is left out.
	pub fn as_bytes(&self, chunk_size: Option<usize>) -> Vec<u8> {
		let mut out = format!("{} {} {}\r\n", self.method, self.path, self.version).into_bytes();

		for (name, value) in self.headers.iter() {
			if name.eq_ignore_ascii_case(CONTENT_LENGTH) || name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
				continue;
			}
			out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
		}

		match chunk_size {
			Some(size) => {
				out.extend_from_slice(format!("{}: chunked\r\n\r\n", TRANSFER_ENCODING).as_bytes());
				out.extend_from_slice(&super::encode_chunked(&self.body, size));
			}
			None => {
				out.extend_from_slice(format!("{}: {}\r\n\r\n", CONTENT_LENGTH, self.body.len()).as_bytes());
				out.extend_from_slice(&self.body);
			}
		}

		out
	}
}

/// Reads one request from the connection. If the body length can't be
/// determined a 411 goes out through `responder` before the error is returned.
/// Bodies over `limit` bytes are a protocol error.
pub async fn read_request<R, W>(reader: &mut R, responder: &mut Responder<W>, limit: usize) -> Result<Request, HttpError>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let line = read_line(reader)
		.await?
		.ok_or_else(|| HttpError::protocol("connection closed before a request line"))?;

	let tokens: Vec<&str> = line.split_whitespace().collect();
	let (method, path, version) = match tokens.as_slice() {
		[method, version] => (*method, "/", *version),
		[method, path, version, ..] => (*method, *path, *version),
		_ => return Err(HttpError::protocol(format!("invalid request line ({})", line))),
	};

	let mut headers = read_header_block(reader).await?;

	let body = if let Some(length) = headers.get(CONTENT_LENGTH) {
		read_sized(reader, content_length(length)?, limit).await?
	} else if wants_chunked(&headers) {
		let body = decode_chunked(reader, limit).await?;
		headers.set(CONTENT_LENGTH, body.len().to_string());
		body
	} else {
		responder.send_simple(LENGTH_REQUIRED).await?;
		return Err(HttpError::LengthRequired);
	};

	Ok(Request {
		method: method.to_string(),
		path: path.to_string(),
		version: version.to_string(),
		headers,
		body,
	})
}

pub(super) fn content_length(value: &str) -> Result<usize, HttpError> {
	value
		.trim()
		.parse()
		.map_err(|_| HttpError::protocol(format!("invalid Content-Length '{}'", value)))
}

/// Reads exactly `length` bytes, refusing up front when that is over `limit`.
/// The buffer grows with what actually arrives.
pub(super) async fn read_sized<R: AsyncRead + Unpin>(reader: &mut R, length: usize, limit: usize) -> Result<Vec<u8>, HttpError> {
	if length > limit {
		return Err(HttpError::protocol(format!(
			"body of {} bytes exceeds the {} byte limit",
			length, limit
		)));
	}

	let mut body = vec![];
	reader.take(length as u64).read_to_end(&mut body).await?;
	if body.len() < length {
		return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
	}

	Ok(body)
}

/// True when Transfer-Encoding is `chunked`, ignoring case and any whitespace.
pub(super) fn wants_chunked(headers: &Headers) -> bool {
	headers.get(TRANSFER_ENCODING).map_or(false, |te| {
		te.chars()
			.filter(|c| !c.is_whitespace())
			.collect::<String>()
			.eq_ignore_ascii_case("chunked")
	})
}

/// A line without its line ending, or None at the end of the stream.
pub(super) async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, HttpError> {
	let mut buf = vec![];
	if reader.read_until(b'\n', &mut buf).await? == 0 {
		return Ok(None);
	}

	if buf.ends_with(b"\n") {
		buf.pop();
	}
	if buf.ends_with(b"\r") {
		buf.pop();
	}

	Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub(super) async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Headers, HttpError> {
	let mut lines = vec![];

	loop {
		match read_line(reader).await? {
			Some(line) if line.is_empty() => break,
			Some(line) => lines.push(line),
			None => return Err(HttpError::protocol("connection closed inside the headers")),
		}
	}

	Headers::from_lines(lines).map_err(|err| HttpError::protocol(err.to_string()))
}
