mod disposition;

pub use disposition::{
	ActionMode, Disposition, DispositionError, Modifier, ParseDispositionError, SendingMode, Severity,
	Status,
};

use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

use crate::{
	cert::CertificateProvider,
	config::Config,
	crypto::{self, CryptoError, SignAlgorithm},
	headers::{
		Headers, AS2_FROM, AS2_TO, AS2_VERSION, CONTENT_TRANSFER_ENCODING, CONTENT_TYPE, DATE,
		MESSAGE_ID, MIME_VERSION, SUBJECT,
	},
	message::{http_date, IdGenerator, Message},
	mime::{self, MimeError, MimePart},
	partnership::{quote_id, unquote_id, Partnership, PartnershipError, PartnershipRegistry, PartnershipRole},
	pending::{PendingError, PendingStore, Take},
};

pub const REPORTING_UA: &str = "REPORTING_UA";
pub const ORIGINAL_RECIPIENT: &str = "ORIGINAL_RECIPIENT";
pub const FINAL_RECIPIENT: &str = "FINAL_RECIPIENT";
pub const ORIGINAL_MESSAGE_ID: &str = "ORIGINAL_MESSAGE_ID";
pub const DISPOSITION: &str = "DISPOSITION";
pub const MIC: &str = "MIC";

const REPORT_REPORTING_UA: &str = "Reporting-UA";
const REPORT_ORIGINAL_RECIPIENT: &str = "Original-Recipient";
const REPORT_FINAL_RECIPIENT: &str = "Final-Recipient";
const REPORT_ORIGINAL_MESSAGE_ID: &str = "Original-Message-ID";
const REPORT_DISPOSITION: &str = "Disposition";
const REPORT_MIC: &str = "Received-Content-MIC";

// Report field name and the attribute it is kept in
const REPORT_FIELDS: [(&str, &str); 6] = [
	(REPORT_REPORTING_UA, REPORTING_UA),
	(REPORT_ORIGINAL_RECIPIENT, ORIGINAL_RECIPIENT),
	(REPORT_FINAL_RECIPIENT, FINAL_RECIPIENT),
	(REPORT_ORIGINAL_MESSAGE_ID, ORIGINAL_MESSAGE_ID),
	(REPORT_DISPOSITION, DISPOSITION),
	(REPORT_MIC, MIC),
];

/// A message disposition notification. Its partnership is the original
/// message's partnership seen from the other side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mdn {
	pub headers: Headers,
	pub attributes: BTreeMap<String, String>,
	pub text: String,
	/// The rendered report as it travels over HTTP. Its Content-Type is
	/// also in `headers`.
	pub data: Option<MimePart>,
	pub partnership: Partnership,
}

impl Mdn {
	pub fn message_id(&self) -> Option<&str> {
		self.headers.get(MESSAGE_ID)
	}

	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes.get(key).map(String::as_str)
	}

	pub fn set_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
		self.attributes.insert(key.into(), value.into());
	}

	pub fn original_message_id(&self) -> Option<&str> {
		self.attribute(ORIGINAL_MESSAGE_ID)
			.map(str::trim)
			.filter(|id| !id.is_empty())
	}

	pub fn mic(&self) -> Option<&str> {
		self.attribute(MIC)
	}

	pub fn disposition(&self) -> Result<Disposition, MdnError> {
		Ok(self
			.attribute(DISPOSITION)
			.ok_or(MdnError::Missing(REPORT_DISPOSITION))?
			.parse()?)
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MicMatch {
	Matched,
	NotMatched,
	NotFound,
}

/// Where an MDN is in its processing
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MdnState {
	Received,
	Parsed,
	DispositionEvaluated,
	MicChecked,
	Resolved,
	Rejected,
}

impl MdnState {
	/// Moves to `next` if that is a legal step from here
	pub fn advance(&mut self, next: MdnState) -> Result<(), MdnError> {
		use MdnState::*;

		let legal = matches!(
			(*self, next),
			(Received, Parsed)
				| (Parsed, DispositionEvaluated)
				| (Parsed, MicChecked)
				| (DispositionEvaluated, MicChecked)
				| (MicChecked, DispositionEvaluated)
				| (DispositionEvaluated, Resolved)
				| (MicChecked, Resolved)
				| (Received | Parsed | DispositionEvaluated | MicChecked, Rejected)
		);

		if !legal {
			return Err(MdnError::InvalidTransition { from: *self, to: next });
		}

		tracing::trace!(from = ?self, to = ?next, "mdn state");
		*self = next;
		Ok(())
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, MdnState::Resolved | MdnState::Rejected)
	}
}

/// Builds, signs, parses and reconciles MDNs
pub struct MdnProcessor {
	config: Arc<Config>,
	ids: IdGenerator,
	registry: Arc<PartnershipRegistry>,
	certs: Arc<dyn CertificateProvider>,
}

impl MdnProcessor {
	pub fn new(config: Arc<Config>, registry: Arc<PartnershipRegistry>, certs: Arc<dyn CertificateProvider>) -> Self {
		Self {
			ids: IdGenerator::new(&config),
			config,
			registry,
			certs,
		}
	}

	/// The MDN answering `original`. It is rendered right away and signed if
	/// the original's Disposition-Notification-Options ask for that.
	pub fn generate(
		&self,
		original: &Message,
		disposition: &Disposition,
		mic: Option<&str>,
		text: &str,
	) -> Result<Mdn, MdnError> {
		let original_partnership = &original.partnership;
		let partnership = original_partnership.swapped();

		let mut headers = Headers::new();
		headers.set(AS2_VERSION, "1.2");
		headers.set(AS2_FROM, quote_id(&partnership.sender_id));
		headers.set(AS2_TO, quote_id(&partnership.receiver_id));
		headers.set(
			MESSAGE_ID,
			self.ids.generate(
				&original_partnership.receiver_id,
				&original_partnership.sender_id,
			),
		);
		headers.set(DATE, http_date());
		headers.set(SUBJECT, "Your Requested MDN Response");
		headers.set(MIME_VERSION, "1.0");

		let recipient = format!("rfc822; {}", original_partnership.receiver_id);

		let mut mdn = Mdn {
			headers,
			attributes: BTreeMap::new(),
			text: text.to_string(),
			data: None,
			partnership,
		};
		mdn.set_attribute(REPORTING_UA, self.config.reporting_ua.as_str());
		mdn.set_attribute(ORIGINAL_RECIPIENT, recipient.as_str());
		mdn.set_attribute(FINAL_RECIPIENT, recipient);
		mdn.set_attribute(ORIGINAL_MESSAGE_ID, original.message_id().unwrap_or_default());
		mdn.set_attribute(DISPOSITION, disposition.to_string());
		if let Some(mic) = mic {
			mdn.set_attribute(MIC, mic);
		}

		let options = original.disposition_options();
		let signing = if options.wants_signed_receipt() {
			Some(
				options
					.micalg
					.iter()
					.find_map(|name| name.parse::<SignAlgorithm>().ok())
					.unwrap_or(SignAlgorithm::Sha256),
			)
		} else {
			None
		};

		let data = self.render(&mdn, signing)?;
		if let Some(content_type) = data.content_type() {
			mdn.headers.set(CONTENT_TYPE, content_type);
		}
		mdn.data = Some(data);

		Ok(mdn)
	}

	/// `multipart/report` with a human readable part and the machine readable
	/// disposition notification, optionally wrapped in a signature.
	pub fn render(&self, mdn: &Mdn, signing: Option<SignAlgorithm>) -> Result<MimePart, MdnError> {
		let mut text = MimePart::new("text/plain; charset=us-ascii", crlf_text(&mdn.text));
		text.headers.set(CONTENT_TRANSFER_ENCODING, "7bit");

		let mut fields = Headers::new();
		for (field, attribute) in REPORT_FIELDS {
			if let Some(value) = mdn.attribute(attribute) {
				fields.set(field, value);
			}
		}

		let mut report = MimePart::new("message/disposition-notification", fields.to_string().into_bytes());
		report.headers.set(CONTENT_TRANSFER_ENCODING, "7bit");

		let boundary = mime::new_boundary();
		let multipart = MimePart::multipart(
			format!(
				"multipart/report; report-type=disposition-notification; boundary=\"{}\"",
				boundary
			),
			&boundary,
			&[text.to_bytes(), report.to_bytes()],
		);

		match signing {
			Some(algorithm) => {
				let key = self.certs.private_key(&mdn.partnership, PartnershipRole::Sender)?;
				Ok(crypto::sign(&multipart, algorithm, &key, true))
			}
			None => Ok(multipart),
		}
	}

	/// Reads an MDN that arrived over HTTP, either as the response to our
	/// message or as a request of its own.
	pub fn parse_incoming(&self, headers: Headers, body: Vec<u8>) -> Result<Mdn, MdnError> {
		let sender = headers
			.get(AS2_FROM)
			.map(unquote_id)
			.ok_or(MdnError::Missing(AS2_FROM))?;
		let receiver = headers
			.get(AS2_TO)
			.map(unquote_id)
			.ok_or(MdnError::Missing(AS2_TO))?;

		// MDNs travel against the direction the partnership was configured for
		let partnership = match self.registry.resolve(&sender, &receiver) {
			Ok(partnership) => partnership,
			Err(err) => self
				.registry
				.resolve(&receiver, &sender)
				.map(|partnership| partnership.swapped())
				.map_err(|_| err)?,
		};

		let mut part = MimePart::new(
			headers.get(CONTENT_TYPE).ok_or(MdnError::Missing(CONTENT_TYPE))?,
			body,
		);
		if let Some(cte) = headers.get(CONTENT_TRANSFER_ENCODING) {
			part.headers.set(CONTENT_TRANSFER_ENCODING, cte);
		}

		let report = if crypto::is_signed(&part) {
			let trust = partnership
				.trust_embedded_certificate()
				.unwrap_or(self.config.trust_embedded_certificate);
			let certificate = match self.certs.certificate(&partnership, PartnershipRole::Sender) {
				Ok(certificate) => Some(certificate),
				Err(_) if trust => None,
				Err(err) => return Err(CryptoError::from(err).into()),
			};

			crypto::verify(&part, certificate.as_ref(), trust)?.content
		} else {
			part.clone()
		};

		if !report.is_media_type("multipart/report") {
			return Err(MdnError::NotAReport(report.media_type()));
		}

		let mut text = String::new();
		let mut fields = None;
		for body_part in report.parts()? {
			if body_part.is_media_type("message/disposition-notification") {
				let content = body_part.decoded_content()?;
				let content = String::from_utf8_lossy(&content);
				fields = Some(
					content
						.parse::<Headers>()
						.map_err(MimeError::from)?,
				);
			} else if body_part.is_text() && text.is_empty() {
				text = String::from_utf8_lossy(&body_part.decoded_content()?).into_owned();
			}
		}
		let fields = fields.ok_or(MdnError::NoNotification)?;

		let mut mdn = Mdn {
			headers,
			attributes: BTreeMap::new(),
			text,
			data: Some(part),
			partnership,
		};

		for (field, attribute) in REPORT_FIELDS {
			if let Some(value) = fields.get(field) {
				mdn.set_attribute(attribute, value);
			}
		}

		Ok(mdn)
	}

	/// Matches an asynchronous MDN against the record left when the original
	/// was sent. A match removes the record and the stored payload.
	pub fn check_async_mic(&self, mdn: &Mdn, store: &dyn PendingStore) -> Result<MicMatch, MdnError> {
		check_async_mic(mdn, store)
	}
}

pub fn check_async_mic(mdn: &Mdn, store: &dyn PendingStore) -> Result<MicMatch, MdnError> {
	let message_id = mdn
		.original_message_id()
		.ok_or(MdnError::Missing(REPORT_ORIGINAL_MESSAGE_ID))?;
	let reported = mdn.mic().unwrap_or_default();

	let take = store.take_if_matches(message_id, &|record| mic_matches(&record.mic, reported))?;

	Ok(match take {
		Take::Taken(_) => MicMatch::Matched,
		Take::Kept(record) => {
			tracing::warn!(
				message_id,
				expected = record.mic.as_str(),
				reported,
				"MIC in MDN does not match"
			);
			MicMatch::NotMatched
		}
		Take::Absent => MicMatch::NotFound,
	})
}

pub fn validate_disposition(disposition: &Disposition) -> Result<(), DispositionError> {
	disposition.validate()
}

/// MICs are equal if they are equal once all whitespace is gone
pub fn mic_matches(expected: &str, reported: &str) -> bool {
	let strip = |mic: &str| mic.chars().filter(|c| !c.is_whitespace()).collect::<String>();
	!expected.trim().is_empty() && strip(expected) == strip(reported)
}

fn crlf_text(text: &str) -> Vec<u8> {
	let mut out = String::with_capacity(text.len() + 8);
	for line in text.lines() {
		out.push_str(line);
		out.push_str("\r\n");
	}
	out.into_bytes()
}

#[derive(Debug, Error)]
pub enum MdnError {
	#[error("MDN has no {0}")]
	Missing(&'static str),
	#[error("MDN body is {0}, not multipart/report")]
	NotAReport(String),
	#[error("report has no disposition notification part")]
	NoNotification,
	#[error("mdn cannot move from {from:?} to {to:?}")]
	InvalidTransition { from: MdnState, to: MdnState },
	#[error(transparent)]
	Disposition(#[from] ParseDispositionError),
	#[error(transparent)]
	Partnership(#[from] PartnershipError),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error(transparent)]
	Mime(#[from] MimeError),
	#[error(transparent)]
	Pending(#[from] PendingError),
}

impl From<crate::cert::CertError> for MdnError {
	fn from(err: crate::cert::CertError) -> Self {
		MdnError::Crypto(err.into())
	}
}

#[cfg(test)]
mod test {
	use std::path::PathBuf;

	use super::*;
	use crate::{
		cert::{KeyStore, PrivateKey},
		headers::{DISPOSITION_NOTIFICATION_OPTIONS, DISPOSITION_NOTIFICATION_TO},
		pending::{PendingDirectory, PendingRecord},
	};

	// Two processors that know each other: alice sends to bob
	fn processors() -> (MdnProcessor, MdnProcessor) {
		let alice_key = PrivateKey::from_seed("alice", &[1; 32]);
		let bob_key = PrivateKey::from_seed("bob", &[2; 32]);

		let alice_certs = KeyStore::new();
		alice_certs.insert_certificate(bob_key.certificate());
		let bob_certs = KeyStore::new();
		bob_certs.insert_certificate(alice_key.certificate());
		alice_certs.insert_private_key(alice_key);
		bob_certs.insert_private_key(bob_key);

		let alice_registry = PartnershipRegistry::new();
		alice_registry.insert(Partnership::new("alice-bob", "alice", "bob"));
		let bob_registry = PartnershipRegistry::new();
		bob_registry.insert(Partnership::new("alice-bob", "alice", "bob"));

		let config = Arc::new(Config::default());
		(
			MdnProcessor::new(config.clone(), Arc::new(alice_registry), Arc::new(alice_certs)),
			MdnProcessor::new(config, Arc::new(bob_registry), Arc::new(bob_certs)),
		)
	}

	fn original() -> Message {
		let mut message = Message::new();
		message.partnership = Partnership::new("alice-bob", "alice", "bob");
		message.headers.set(AS2_FROM, "alice");
		message.headers.set(AS2_TO, "bob");
		message.headers.set(DISPOSITION_NOTIFICATION_TO, "alice@example.com");
		message.set_message_id("<msg-1@alice_bob>");
		message
	}

	#[test]
	fn generated_mdn_is_swapped() {
		let (_, bob) = processors();
		let mdn = bob
			.generate(&original(), &Disposition::processed(), Some("abc, sha-256"), "thanks")
			.unwrap();

		assert_eq!(mdn.partnership.sender_id, "bob");
		assert_eq!(mdn.partnership.receiver_id, "alice");
		assert_eq!(mdn.headers.get(AS2_FROM), Some("bob"));
		assert_eq!(mdn.headers.get(AS2_TO), Some("alice"));
		assert!(mdn.message_id().unwrap().ends_with("@bob_alice>"));
		assert_eq!(mdn.original_message_id(), Some("<msg-1@alice_bob>"));
		assert_eq!(mdn.attribute(ORIGINAL_RECIPIENT), Some("rfc822; bob"));
		assert!(mdn
			.headers
			.get(CONTENT_TYPE)
			.unwrap()
			.starts_with("multipart/report"));
	}

	#[test]
	fn unsigned_round_trip() {
		let (alice, bob) = processors();
		let mdn = bob
			.generate(&original(), &Disposition::warning("duplicate-document"), Some("abc, sha-256"), "done")
			.unwrap();

		let body = mdn.data.clone().unwrap().content;
		let parsed = alice.parse_incoming(mdn.headers.clone(), body).unwrap();

		assert_eq!(parsed.partnership.sender_id, "bob");
		assert_eq!(parsed.mic(), Some("abc, sha-256"));
		assert_eq!(parsed.text, "done\r\n");
		assert_eq!(parsed.disposition().unwrap(), Disposition::warning("duplicate-document"));
		assert_eq!(parsed.attribute(REPORTING_UA), mdn.attribute(REPORTING_UA));
	}

	#[test]
	fn signed_round_trip() {
		let (alice, bob) = processors();
		let mut original = original();
		original.headers.set(
			DISPOSITION_NOTIFICATION_OPTIONS,
			"signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=optional, sha-512",
		);

		let mdn = bob
			.generate(&original, &Disposition::processed(), Some("abc, sha-512"), "ok")
			.unwrap();
		assert!(crypto::is_signed(mdn.data.as_ref().unwrap()));
		assert!(mdn.headers.get(CONTENT_TYPE).unwrap().contains("micalg=sha-512"));

		let body = mdn.data.clone().unwrap().content;
		let parsed = alice.parse_incoming(mdn.headers.clone(), body.clone()).unwrap();
		assert_eq!(parsed.disposition().unwrap(), Disposition::processed());

		// a bit flipped in the report breaks the signature
		let mut tampered = body;
		let at = mime::find(&tampered, b"processed", 0).unwrap();
		tampered[at] = b'P';
		assert!(matches!(
			alice.parse_incoming(mdn.headers.clone(), tampered),
			Err(MdnError::Crypto(_))
		));
	}

	#[test]
	fn unknown_partnership() {
		let (alice, _) = processors();
		let mut headers = Headers::new();
		headers.set(AS2_FROM, "carol");
		headers.set(AS2_TO, "alice");
		headers.set(CONTENT_TYPE, "multipart/report; boundary=x");

		assert!(matches!(
			alice.parse_incoming(headers, vec![]),
			Err(MdnError::Partnership(PartnershipError::NotFound { .. }))
		));
	}

	#[test]
	fn mic_comparison() {
		assert!(mic_matches("abc123, sha-256", "abc 123,sha-256"));
		assert!(mic_matches("XYZ==, sha-256", "XYZ== , sha-256"));
		assert!(!mic_matches("XYZ==, sha-256", "AAA==, sha-256"));
		assert!(!mic_matches("", ""));
	}

	fn async_mdn(mic: &str) -> Mdn {
		let mut mdn = Mdn::default();
		mdn.set_attribute(ORIGINAL_MESSAGE_ID, "msg-1");
		mdn.set_attribute(MIC, mic);
		mdn
	}

	#[test]
	fn async_mic_check() {
		let dir = tempfile::tempdir().unwrap();
		let store = PendingDirectory::open(dir.path().join("info"), dir.path().join("data")).unwrap();
		store
			.put(
				"msg-1",
				&PendingRecord {
					mic: "XYZ==, sha-256".into(),
					payload: PathBuf::from("/pending/payload-1"),
				},
			)
			.unwrap();

		assert_eq!(
			check_async_mic(&async_mdn("AAA==, sha-256"), &store).unwrap(),
			MicMatch::NotMatched
		);
		assert!(store.get("msg-1").unwrap().is_some());

		assert_eq!(
			check_async_mic(&async_mdn("XYZ== , sha-256"), &store).unwrap(),
			MicMatch::Matched
		);
		assert!(store.get("msg-1").unwrap().is_none());

		assert_eq!(
			check_async_mic(&async_mdn("XYZ==, sha-256"), &store).unwrap(),
			MicMatch::NotFound
		);
		assert!(matches!(
			check_async_mic(&Mdn::default(), &store),
			Err(MdnError::Missing(_))
		));
	}

	#[test]
	fn lifecycle() {
		let mut state = MdnState::Received;
		state.advance(MdnState::Parsed).unwrap();
		state.advance(MdnState::DispositionEvaluated).unwrap();
		state.advance(MdnState::MicChecked).unwrap();
		state.advance(MdnState::Resolved).unwrap();
		assert!(state.is_terminal());

		assert!(state.advance(MdnState::Rejected).is_err());

		let mut state = MdnState::Received;
		assert!(state.advance(MdnState::Resolved).is_err());
		state.advance(MdnState::Rejected).unwrap();
	}
}
