use super::{mic_algorithm, ExchangeError, ProcessError, Session, WithContext};
use crate::{
	crypto::{self, SecureMode},
	headers::{
		AS2_FROM, AS2_TO, AS2_VERSION, CONTENT_LENGTH, CONTENT_TRANSFER_ENCODING, CONTENT_TYPE, DATE,
		DISPOSITION_NOTIFICATION_OPTIONS, DISPOSITION_NOTIFICATION_TO, MIME_VERSION,
		RECEIPT_DELIVERY_OPTION, SUBJECT,
	},
	mdn::{self, DispositionError, Mdn, MdnState},
	message::{http_date, Message},
	mime::{self, MimePart},
	net,
	partnership::quote_id,
	pending::PendingRecord,
};

/// Where an outbound message got to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendState {
	Build,
	Secure,
	ComputeMic,
	PersistPending,
	Transmit,
	SyncMdnReceived,
	AsyncMdnPending,
	VerifyMdnDisposition,
	Done,
	Failed,
}

#[derive(Debug)]
pub struct SendOutcome {
	pub message_id: String,
	pub mic: String,
	/// The synchronous MDN, if one was asked for
	pub mdn: Option<Mdn>,
	pub state: SendState,
	/// Set when the partner processed the message with a warning
	pub disposition_warning: Option<DispositionError>,
}

impl Session {
	/// A message from `sender` to `receiver` carrying `payload`, with the
	/// headers its partnership asks for.
	pub fn build_message(&self, sender: &str, receiver: &str, payload: MimePart) -> Result<Message, ExchangeError> {
		let mut message = Message::new();
		message.headers.set(AS2_FROM, quote_id(sender));
		message.headers.set(AS2_TO, quote_id(receiver));

		let context = message.context();
		message.partnership = self.registry.resolve(sender, receiver).context(&context)?;
		let partnership = &message.partnership;

		message.headers.set(AS2_VERSION, "1.2");
		message
			.headers
			.set(crate::headers::MESSAGE_ID, self.ids.generate(sender, receiver));
		message.headers.set(DATE, http_date());
		message
			.headers
			.set(SUBJECT, partnership.subject().unwrap_or("AS2 Message"));
		message.headers.set(MIME_VERSION, "1.0");

		if let Some(mdn_to) = partnership.mdn_to() {
			let mdn_to = mdn_to.to_string();
			let options = partnership.mdn_options().map(str::to_string);
			let receipt_url = partnership.receipt_url().map(str::to_string);

			message.headers.set(DISPOSITION_NOTIFICATION_TO, mdn_to);
			if let Some(options) = options {
				message.headers.set(DISPOSITION_NOTIFICATION_OPTIONS, options);
			}
			if let Some(url) = receipt_url {
				message.headers.set(RECEIPT_DELIVERY_OPTION, url);
			}
		}

		message.data = Some(payload);
		Ok(message)
	}

	/// Secures and transmits a built message and, for a synchronous MDN,
	/// reconciles the receipt that came back.
	pub async fn send(&self, message: Message) -> Result<SendOutcome, ExchangeError> {
		let context = message.context();
		let mut state = SendState::Build;

		match self.run_send(&message, &mut state).await {
			Ok(outcome) => {
				tracing::info!(
					message_id = outcome.message_id.as_str(),
					sender = context.sender.as_deref().unwrap_or_default(),
					receiver = context.receiver.as_deref().unwrap_or_default(),
					state = ?outcome.state,
					"sent message"
				);
				Ok(outcome)
			}
			Err(err) => {
				tracing::error!(failed_in = ?state, "{}: {}", context, err);
				advance(&mut state, SendState::Failed);
				Err(ExchangeError::new(context, err))
			}
		}
	}

	async fn run_send(&self, message: &Message, state: &mut SendState) -> Result<SendOutcome, ProcessError> {
		let message_id = message
			.message_id()
			.ok_or(ProcessError::MissingMessageId)?
			.to_string();
		if !message.partnership.is_resolved() {
			return Err(ProcessError::Unresolved);
		}
		let partnership = message.partnership.clone();
		let payload = message.data.clone().ok_or(ProcessError::MissingPayload)?;
		let url = partnership.as2_url().ok_or(ProcessError::NoUrl)?.to_string();

		advance(state, SendState::Secure);
		let mode = SecureMode::for_partnership(&partnership)?;
		let secured = crypto::secure(&payload, mode, &partnership, self.certs.as_ref())?;

		advance(state, SendState::ComputeMic);
		let algorithm = mic_algorithm(mode.sign_algorithm(), &message.disposition_options());
		let mic = crypto::compute_mic(&payload, algorithm, mode.sign_algorithm().is_some());

		let wants_mdn = message.requests_mdn();
		let is_async = wants_mdn && message.async_mdn_url().is_some();
		if is_async {
			advance(state, SendState::PersistPending);
			let path = self.pending.store_payload(&message_id, &payload.to_bytes())?;
			self.pending.put(
				&message_id,
				&PendingRecord {
					mic: mic.clone(),
					payload: path,
				},
			)?;
		}

		advance(state, SendState::Transmit);
		let mut headers = message.headers.clone();
		headers.remove(CONTENT_LENGTH);
		if let Some(content_type) = secured.content_type() {
			headers.set(CONTENT_TYPE, content_type);
		}

		let encoding = partnership.content_transfer_encoding().to_string();
		headers.set(CONTENT_TRANSFER_ENCODING, encoding.as_str());
		let body = if encoding.eq_ignore_ascii_case("base64") {
			mime::encode_base64_lines(&secured.content)
		} else {
			secured.content
		};

		let chunk_size = partnership.is_chunked().then_some(self.config.chunk_size);
		let response = match net::post(&url, headers, body, chunk_size, &self.config).await {
			Ok(response) if response.is_success() => response,
			Ok(response) => {
				self.forget_pending(is_async, &message_id);
				return Err(ProcessError::Rejected(response.code));
			}
			Err(err) => {
				self.forget_pending(is_async, &message_id);
				return Err(err.into());
			}
		};

		if is_async {
			advance(state, SendState::AsyncMdnPending);
			return Ok(SendOutcome {
				message_id,
				mic,
				mdn: None,
				state: *state,
				disposition_warning: None,
			});
		}

		if !wants_mdn {
			advance(state, SendState::Done);
			return Ok(SendOutcome {
				message_id,
				mic,
				mdn: None,
				state: *state,
				disposition_warning: None,
			});
		}

		advance(state, SendState::SyncMdnReceived);
		let mut mdn_state = MdnState::Received;
		let mut mdn = self.mdn.parse_incoming(response.headers, response.body)?;
		mdn_state.advance(MdnState::Parsed)?;
		if let Err(err) = self.update_partnership(&mut mdn.partnership) {
			tracing::warn!(message_id = message_id.as_str(), "{}", err);
		}
		self.store_mdn(&mdn);

		if mdn.original_message_id() != Some(message_id.as_str()) {
			tracing::warn!(
				message_id = message_id.as_str(),
				original_message_id = mdn.original_message_id().unwrap_or_default(),
				"MDN names a different original message"
			);
		}

		advance(state, SendState::VerifyMdnDisposition);
		let disposition = mdn.disposition()?;
		let disposition_warning = match mdn::validate_disposition(&disposition) {
			Ok(()) => None,
			Err(err) if !err.is_fatal() => {
				tracing::warn!(message_id = message_id.as_str(), "{}", err);
				Some(err)
			}
			Err(err) => {
				mdn_state.advance(MdnState::Rejected)?;
				return Err(err.into());
			}
		};
		mdn_state.advance(MdnState::DispositionEvaluated)?;

		if !mdn::mic_matches(&mic, mdn.mic().unwrap_or_default()) {
			tracing::warn!(
				message_id = message_id.as_str(),
				expected = mic.as_str(),
				reported = mdn.mic().unwrap_or_default(),
				"MIC in MDN does not match"
			);
			mdn_state.advance(MdnState::Rejected)?;
			return Err(ProcessError::MicMismatch);
		}
		mdn_state.advance(MdnState::MicChecked)?;
		mdn_state.advance(MdnState::Resolved)?;

		advance(state, SendState::Done);

		Ok(SendOutcome {
			message_id,
			mic,
			mdn: Some(mdn),
			state: *state,
			disposition_warning,
		})
	}

	// A message that never got through will not get an MDN either
	fn forget_pending(&self, is_async: bool, message_id: &str) {
		if !is_async {
			return;
		}

		if let Err(err) = self.pending.delete(message_id) {
			tracing::error!(message_id, "failed to remove pending record: {}", err);
		}
	}
}

fn advance(state: &mut SendState, next: SendState) {
	tracing::trace!(from = ?state, to = ?next, "send state");
	*state = next;
}
