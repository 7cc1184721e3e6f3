use std::borrow::Cow;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
	chunked::decode_chunked,
	request::{content_length, read_header_block, read_line, read_sized, wants_chunked},
	HttpError,
};
use crate::headers::{Headers, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
	pub code: u16,
	pub headers: Headers,
	pub body: Vec<u8>,
}

impl Response {
	pub fn new(code: u16) -> Self {
		Self {
			code,
			headers: Headers::new(),
			body: vec![],
		}
	}

	pub fn with_body(code: u16, headers: Headers, body: Vec<u8>) -> Self {
		Self {
			code,
			headers,
			body,
		}
	}

	/// A response whose only content is its own status line. This is what
	/// partners get for every error.
	pub fn simple(code: u16) -> Self {
		let mut headers = Headers::new();
		headers.set(CONTENT_TYPE, "text/plain");

		Self {
			code,
			headers,
			body: format!("{} {}\r\n", code, reason_phrase(code)).into_bytes(),
		}
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.code)
	}

	pub fn as_bytes(&self) -> Vec<u8> {
		let mut out = format!("HTTP/1.1 {} {}\r\n", self.code, reason_phrase(self.code)).into_bytes();

		for (name, value) in self.headers.iter() {
			if name.eq_ignore_ascii_case(CONTENT_LENGTH) || name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
				continue;
			}
			out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
		}
		out.extend_from_slice(format!("{}: {}\r\n", CONTENT_LENGTH, self.body.len()).as_bytes());
		out.extend_from_slice(b"Connection: close\r\n\r\n");
		out.extend_from_slice(&self.body);

		out
	}
}

/// Sends the one response a connection gets. Anything after the first
/// response is refused.
pub struct Responder<W> {
	writer: W,
	sent: Option<u16>,
}

impl<W: AsyncWrite + Unpin> Responder<W> {
	pub fn new(writer: W) -> Self {
		Self { writer, sent: None }
	}

	pub async fn send(&mut self, response: &Response) -> Result<(), HttpError> {
		if let Some(code) = self.sent {
			tracing::warn!(
				sent = code,
				refused = response.code,
				"refusing to send a second response on one connection"
			);
			return Err(HttpError::AlreadyResponded);
		}

		self.sent = Some(response.code);
		self.writer.write_all(&response.as_bytes()).await?;
		self.writer.flush().await?;

		Ok(())
	}

	pub async fn send_simple(&mut self, code: u16) -> Result<(), HttpError> {
		self.send(&Response::simple(code)).await
	}

	/// The status code that went out, if any
	pub fn sent(&self) -> Option<u16> {
		self.sent
	}

	pub fn into_inner(self) -> W {
		self.writer
	}
}

/// Reads a response on the client side. The body is framed by Content-Length,
/// chunked encoding, or the end of the stream, and may not exceed `limit`.
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<Response, HttpError> {
	let status = read_line(reader)
		.await?
		.ok_or_else(|| HttpError::protocol("connection closed before a status line"))?;

	let mut tokens = status.split_whitespace();
	let version = tokens.next().unwrap_or_default();
	if !version.starts_with("HTTP/") {
		return Err(HttpError::protocol(format!("invalid status line ({})", status)));
	}

	let code: u16 = tokens
		.next()
		.and_then(|code| code.parse().ok())
		.ok_or_else(|| HttpError::protocol(format!("invalid status code ({})", status)))?;

	let headers = read_header_block(reader).await?;

	let body = if let Some(length) = headers.get(CONTENT_LENGTH) {
		read_sized(reader, content_length(length)?, limit).await?
	} else if wants_chunked(&headers) {
		decode_chunked(reader, limit).await?
	} else {
		let mut body = vec![];
		reader.take((limit as u64).saturating_add(1)).read_to_end(&mut body).await?;
		if body.len() > limit {
			return Err(HttpError::protocol(format!("response body exceeds the {} byte limit", limit)));
		}
		body
	};

	Ok(Response {
		code,
		headers,
		body,
	})
}

pub fn reason_phrase(code: u16) -> Cow<'static, str> {
	let phrase = match code {
		100 => "Continue",
		101 => "Switching Protocols",

		200 => "OK",
		201 => "Created",
		202 => "Accepted",
		203 => "Non-Authoritative Information",
		204 => "No Content",
		205 => "Reset Content",
		206 => "Partial Content",

		300 => "Multiple Choices",
		301 => "Moved Permanently",
		302 => "Found",
		303 => "See Other",
		304 => "Not Modified",
		305 => "Use Proxy",
		307 => "Temporary Redirect",

		400 => "Bad Request",
		401 => "Unauthorized",
		402 => "Payment Required",
		403 => "Forbidden",
		404 => "Not Found",
		405 => "Method Not Allowed",
		406 => "Not Acceptable",
		407 => "Proxy Authentication Required",
		408 => "Request Time-out",
		409 => "Conflict",
		410 => "Gone",
		411 => "Length Required",
		412 => "Precondition Failed",
		413 => "Request Entity Too Large",
		414 => "Request-URI Too Large",
		415 => "Unsupported Media Type",
		416 => "Requested range not satisfiable",
		417 => "Expectation Failed",

		500 => "Internal Server Error",
		501 => "Not Implemented",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		504 => "Gateway Time-out",
		505 => "HTTP Version not supported",

		_ => return Cow::Owned(format!("Unknown ({})", code)),
	};

	Cow::Borrowed(phrase)
}
