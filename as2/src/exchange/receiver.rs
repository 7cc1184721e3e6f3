use tokio::io::{AsyncBufRead, AsyncWrite};

use super::{mic_algorithm, ExchangeError, ProcessError, Session, WithContext};
use crate::{
	crypto,
	headers::{CONTENT_TRANSFER_ENCODING, CONTENT_TYPE},
	http::{read_request, HttpError, Request, Responder, Response, BAD_REQUEST, NOT_FOUND, OK},
	mdn::{self, Disposition, DispositionError, Mdn, MdnState, MicMatch},
	message::{
		Message, MessageContext, HTTP_ORIGINAL_CONTENT_LENGTH, HTTP_ORIGINAL_CONTENT_TRANSFER_ENCODING,
		HTTP_REQUEST_TYPE, HTTP_REQUEST_URL, HTTP_REQUEST_VERSION,
	},
	mime::{self, MimePart},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
	Message,
	AsyncMdn,
}

/// What became of one inbound request
#[derive(Debug)]
pub struct ReceiveOutcome {
	pub kind: MessageKind,
	pub status: u16,
	/// The message id, or for an MDN the id of the message it answers
	pub message_id: Option<String>,
	pub mic: Option<String>,
	pub mic_match: Option<MicMatch>,
	pub disposition_warning: Option<DispositionError>,
}

impl Session {
	/// Handles one request on a connection: an AS2 message or an
	/// asynchronous MDN. Exactly one response is sent unless the connection
	/// itself fails.
	pub async fn receive<R, W>(&self, reader: &mut R, responder: &mut Responder<W>) -> Result<ReceiveOutcome, ExchangeError>
	where
		R: AsyncBufRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let request = match read_request(reader, responder, self.config.max_body_size).await {
			Ok(request) => request,
			Err(err) => {
				if let HttpError::Protocol(_) = err {
					if let Err(err) = responder.send_simple(BAD_REQUEST).await {
						tracing::debug!("failed to answer a malformed request: {}", err);
					}
				}
				return Err(ExchangeError::new(MessageContext::default(), err));
			}
		};

		if let Some(dump) = &self.dump {
			dump.dump(&request);
		}

		let is_mdn = self.config.is_async_mdn_path(&request.path)
			|| request
				.headers
				.get(CONTENT_TYPE)
				.map_or(false, |content_type| mime::media_type(content_type) == "multipart/report");

		if is_mdn {
			self.receive_mdn(request, responder).await
		} else {
			self.receive_message(request, responder).await
		}
	}

	async fn receive_message<W>(&self, request: Request, responder: &mut Responder<W>) -> Result<ReceiveOutcome, ExchangeError>
	where
		W: AsyncWrite + Unpin,
	{
		let mut message = Message::new();
		message.headers = request.headers;
		message.set_attribute(HTTP_REQUEST_TYPE, request.method);
		message.set_attribute(HTTP_REQUEST_URL, request.path);
		message.set_attribute(HTTP_REQUEST_VERSION, request.version);

		let prepared = self.process_message(&mut message, request.body).and_then(|mic| {
			let mdn = if message.requests_mdn() {
				Some(self.mdn.generate(
					&message,
					&Disposition::processed(),
					Some(&mic),
					&receipt_text(&message),
				)?)
			} else {
				None
			};
			Ok((mic, mdn))
		});

		let context = message.context();
		let (mic, mdn) = match prepared {
			Ok(prepared) => prepared,
			Err(err) => {
				tracing::warn!("{}: {}", context, err);
				responder.send_simple(BAD_REQUEST).await.context(&context)?;
				self.send_error_mdn(&message, &err).await;
				return Err(ExchangeError::new(context, err));
			}
		};

		let response = match (&mdn, message.async_mdn_url()) {
			(Some(Mdn { data: Some(data), headers, .. }), None) => {
				Response::with_body(OK, headers.clone(), data.content.clone())
			}
			_ => Response::simple(OK),
		};
		responder.send(&response).await.context(&context)?;

		tracing::info!(
			message_id = context.message_id.as_deref().unwrap_or_default(),
			sender = context.sender.as_deref().unwrap_or_default(),
			receiver = context.receiver.as_deref().unwrap_or_default(),
			mic = mic.as_str(),
			"received message"
		);

		if let (Some(mdn), Some(url)) = (&mdn, message.async_mdn_url()) {
			if let Err(err) = self.deliver_async_mdn(url, mdn).await {
				tracing::warn!(url, "{}: failed to deliver MDN: {}", context, err);
			}
		}

		if let Some(store) = &self.store {
			store.store_message(&message).context(&context)?;
		}
		if let Some(mdn) = &mdn {
			self.store_mdn(mdn);
		}

		Ok(ReceiveOutcome {
			kind: MessageKind::Message,
			status: OK,
			message_id: context.message_id,
			mic: Some(mic),
			mic_match: None,
			disposition_warning: None,
		})
	}

	// Resolves, decodes and opens the body, returning its MIC
	fn process_message(&self, message: &mut Message, body: Vec<u8>) -> Result<String, ProcessError> {
		self.registry.resolve_message(message)?;
		if message.message_id().is_none() {
			return Err(ProcessError::MissingMessageId);
		}

		// The request's own header wins over the partnership default
		let encoding = message
			.headers
			.get(CONTENT_TRANSFER_ENCODING)
			.or_else(|| message.partnership.content_transfer_encoding_receive())
			.map(|encoding| encoding.trim().to_ascii_lowercase());

		let body = match encoding {
			Some(encoding) => {
				let decoded = if encoding == "base64" {
					message.set_attribute(HTTP_ORIGINAL_CONTENT_LENGTH, body.len().to_string());
					mime::decode_base64(&body)?
				} else {
					body
				};
				message.set_attribute(HTTP_ORIGINAL_CONTENT_TRANSFER_ENCODING, encoding);
				decoded
			}
			None => body,
		};

		let content_type = message
			.headers
			.get(CONTENT_TYPE)
			.ok_or(ProcessError::MissingPayload)?;
		let part = MimePart::new(content_type, body);

		let opened = crypto::open(
			&part,
			&message.partnership,
			self.certs.as_ref(),
			self.config.trust_embedded_certificate,
		)?;

		let algorithm = mic_algorithm(
			opened.verified.as_ref().map(|verified| verified.algorithm),
			&message.disposition_options(),
		);
		let mic = crypto::mic_over(opened.mic_input().0, algorithm);

		tracing::debug!(
			message_id = message.message_id().unwrap_or_default(),
			encrypted = opened.encrypted,
			signed = opened.verified.is_some(),
			"opened message"
		);

		message.data = Some(opened.content);
		Ok(mic)
	}

	// A failed message still gets its receipt if it asked for one to be posted
	async fn send_error_mdn(&self, message: &Message, err: &ProcessError) {
		let url = match message.async_mdn_url() {
			Some(url) if message.requests_mdn() && message.partnership.is_resolved() => url,
			_ => return,
		};

		let disposition = Disposition::error(err.disposition_description());
		let text = format!(
			"The message could not be processed and was rejected.\n{}\n",
			err
		);

		let result = match self.mdn.generate(message, &disposition, None, &text) {
			Ok(mdn) => self.deliver_async_mdn(url, &mdn).await,
			Err(err) => Err(err.into()),
		};

		if let Err(err) = result {
			tracing::warn!(url, "{}: failed to deliver error MDN: {}", message.context(), err);
		}
	}

	async fn receive_mdn<W>(&self, request: Request, responder: &mut Responder<W>) -> Result<ReceiveOutcome, ExchangeError>
	where
		W: AsyncWrite + Unpin,
	{
		let mut state = MdnState::Received;

		let mut envelope = Message::new();
		envelope.headers = request.headers.clone();
		let context = envelope.context();

		let mut mdn = match self.mdn.parse_incoming(request.headers, request.body) {
			Ok(mdn) => mdn,
			Err(err) => {
				tracing::warn!("{}: unreadable MDN: {}", context, err);
				state.advance(MdnState::Rejected).context(&context)?;
				responder.send_simple(BAD_REQUEST).await.context(&context)?;
				return Err(ExchangeError::new(context, err));
			}
		};
		state.advance(MdnState::Parsed).context(&context)?;

		let context = MessageContext {
			message_id: mdn.original_message_id().map(str::to_string),
			sender: Some(mdn.partnership.sender_id.clone()),
			receiver: Some(mdn.partnership.receiver_id.clone()),
		};
		if let Err(err) = self.update_partnership(&mut mdn.partnership) {
			tracing::warn!("{}: {}", context, err);
		}
		self.store_mdn(&mdn);

		let (status, rejection) = match mdn::check_async_mic(&mdn, self.pending.as_ref()) {
			Ok(MicMatch::Matched) => (OK, None),
			Ok(MicMatch::NotMatched) => (NOT_FOUND, Some(ProcessError::MicMismatch)),
			Ok(MicMatch::NotFound) => (
				NOT_FOUND,
				Some(ProcessError::UnknownPending(
					context.message_id.clone().unwrap_or_default(),
				)),
			),
			Err(err) => (BAD_REQUEST, Some(err.into())),
		};

		if let Some(err) = rejection {
			state.advance(MdnState::Rejected).context(&context)?;
			responder.send_simple(status).await.context(&context)?;
			return Err(ExchangeError::new(context, err));
		}
		state.advance(MdnState::MicChecked).context(&context)?;
		responder.send_simple(status).await.context(&context)?;

		let disposition = mdn.disposition().context(&context)?;
		state.advance(MdnState::DispositionEvaluated).context(&context)?;

		let disposition_warning = match mdn::validate_disposition(&disposition) {
			Ok(()) => None,
			Err(err) if !err.is_fatal() => {
				tracing::warn!("{}: {}", context, err);
				Some(err)
			}
			Err(err) => {
				state.advance(MdnState::Rejected).context(&context)?;
				return Err(ExchangeError::new(context, err));
			}
		};
		state.advance(MdnState::Resolved).context(&context)?;

		tracing::info!(
			message_id = context.message_id.as_deref().unwrap_or_default(),
			sender = context.sender.as_deref().unwrap_or_default(),
			disposition = %disposition,
			"received asynchronous MDN"
		);

		Ok(ReceiveOutcome {
			kind: MessageKind::AsyncMdn,
			status,
			message_id: context.message_id,
			mic: mdn.mic().map(str::to_string),
			mic_match: Some(MicMatch::Matched),
			disposition_warning,
		})
	}
}

fn receipt_text(message: &Message) -> String {
	format!(
		"The message sent to {} on {} was received and processed.\n\
		 This is no guarantee that the content was read or understood.\n",
		message.partnership.receiver_id,
		message
			.headers
			.get(crate::headers::DATE)
			.unwrap_or("an unknown date")
	)
}
