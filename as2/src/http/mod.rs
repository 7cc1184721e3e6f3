mod chunked;
mod dump;
mod request;
mod response;

pub use chunked::{decode_chunked, encode_chunked};
pub use dump::DumpDirectory;
pub use request::{read_request, Request};
pub use response::{read_response, reason_phrase, Responder, Response};

use thiserror::Error;

pub const OK: u16 = 200;
pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const LENGTH_REQUIRED: u16 = 411;
pub const INTERNAL_SERVER_ERROR: u16 = 500;

#[derive(Debug, Error)]
pub enum HttpError {
	#[error("invalid HTTP framing: {0}")]
	Protocol(String),
	#[error("request has neither Content-Length nor chunked Transfer-Encoding")]
	LengthRequired,
	#[error("a response was already sent on this connection")]
	AlreadyResponded,
	#[error("connection error")]
	Io(#[from] std::io::Error),
}

impl HttpError {
	pub(crate) fn protocol<S: Into<String>>(message: S) -> Self {
		Self::Protocol(message.into())
	}
}
