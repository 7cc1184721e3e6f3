mod receiver;
mod sender;

pub use receiver::{MessageKind, ReceiveOutcome};
pub use sender::{SendOutcome, SendState};

use std::sync::Arc;

use thiserror::Error;

use crate::{
	cert::{CertError, CertificateProvider},
	config::Config,
	crypto::{CryptoError, ParseAlgorithmError, SignAlgorithm},
	headers::Headers,
	http::{DumpDirectory, HttpError},
	mdn::{DispositionError, Mdn, MdnError, MdnProcessor},
	message::{DispositionOptions, IdGenerator, MessageContext},
	mime::MimeError,
	net::{self, ClientError},
	partnership::{
		Partnership, PartnershipError, PartnershipRegistry, PartnershipRole, RECEIVER_X509_ALIAS,
		SENDER_X509_ALIAS,
	},
	pending::{PendingError, PendingStore},
	store::{MessageStore, StoreError},
};

/// Everything an exchange needs, shared by all connections and sends.
pub struct Session {
	config: Arc<Config>,
	registry: Arc<PartnershipRegistry>,
	certs: Arc<dyn CertificateProvider>,
	pending: Arc<dyn PendingStore>,
	store: Option<Arc<dyn MessageStore>>,
	dump: Option<DumpDirectory>,
	mdn: MdnProcessor,
	ids: IdGenerator,
}

impl Session {
	pub fn new(
		config: Arc<Config>,
		registry: Arc<PartnershipRegistry>,
		certs: Arc<dyn CertificateProvider>,
		pending: Arc<dyn PendingStore>,
	) -> Self {
		Self {
			mdn: MdnProcessor::new(config.clone(), registry.clone(), certs.clone()),
			ids: IdGenerator::new(&config),
			dump: config.dump_dir.clone().map(DumpDirectory::new),
			store: None,
			config,
			registry,
			certs,
			pending,
		}
	}

	pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
		self.store = Some(store);
		self
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn registry(&self) -> &PartnershipRegistry {
		&self.registry
	}

	pub fn pending(&self) -> &dyn PendingStore {
		self.pending.as_ref()
	}

	pub fn mdn_processor(&self) -> &MdnProcessor {
		&self.mdn
	}

	/// Removes pending records whose MDN never came
	pub fn sweep_pending(&self) -> Result<Vec<String>, PendingError> {
		let swept = self.pending.sweep(self.config.pending_max_age)?;
		if !swept.is_empty() {
			tracing::info!(count = swept.len(), "swept pending records");
		}

		Ok(swept)
	}

	// Storing is optional; without a store this does nothing
	fn store_mdn(&self, mdn: &Mdn) {
		if let Some(store) = &self.store {
			if let Err(err) = store.store_mdn(mdn) {
				tracing::error!(
					message_id = mdn.message_id().unwrap_or_default(),
					"failed to store MDN: {}",
					err
				);
			}
		}
	}

	/// Pins the certificate aliases an MDN was handled with on its partnership
	/// and refreshes the MDN's copy from the registry, stored values winning.
	/// MDNs travel against the configured direction, so the record may be
	/// stored the other way round.
	fn update_partnership(&self, partnership: &mut Partnership) -> Result<(), PartnershipError> {
		for (role, key) in [
			(PartnershipRole::Sender, SENDER_X509_ALIAS),
			(PartnershipRole::Receiver, RECEIVER_X509_ALIAS),
		] {
			let alias = partnership.alias(role).to_string();
			partnership.set_attribute(key, alias);
		}

		match self.registry.update(partnership, false) {
			Err(PartnershipError::NotFound { .. }) => {
				let mut stored = partnership.swapped();
				self.registry.update(&mut stored, false)?;
				*partnership = stored.swapped();
				Ok(())
			}
			result => result,
		}
	}

	/// Posts an MDN to the URL the partner gave in Receipt-Delivery-Option
	pub async fn deliver_async_mdn(&self, url: &str, mdn: &Mdn) -> Result<(), ProcessError> {
		let data = mdn.data.as_ref().ok_or(ProcessError::MissingPayload)?;

		let mut headers: Headers = mdn.headers.clone();
		if let Some(content_type) = data.content_type() {
			headers.set(crate::headers::CONTENT_TYPE, content_type);
		}

		let chunk_size = mdn
			.partnership
			.is_chunked()
			.then_some(self.config.chunk_size);
		let response = net::post(url, headers, data.content.clone(), chunk_size, &self.config).await?;

		if !response.is_success() {
			return Err(ProcessError::Rejected(response.code));
		}

		tracing::info!(
			url,
			original_message_id = mdn.original_message_id().unwrap_or_default(),
			"delivered asynchronous MDN"
		);
		Ok(())
	}
}

/// The algorithm a MIC is computed with. Both sides pick it the same way: the
/// signing algorithm if the body was signed, else the first supported one the
/// sender asked for, else SHA-256.
pub fn mic_algorithm(signed_with: Option<SignAlgorithm>, options: &DispositionOptions) -> SignAlgorithm {
	signed_with
		.or_else(|| {
			options
				.micalg
				.iter()
				.find_map(|name| name.parse().ok())
		})
		.unwrap_or(SignAlgorithm::Sha256)
}

/// A failed exchange and the message it was about
#[derive(Debug, Error)]
#[error("{context}: {kind}")]
pub struct ExchangeError {
	pub context: MessageContext,
	#[source]
	pub kind: ProcessError,
}

impl ExchangeError {
	pub fn new<E: Into<ProcessError>>(context: MessageContext, kind: E) -> Self {
		Self {
			context,
			kind: kind.into(),
		}
	}
}

pub(crate) trait WithContext<T> {
	fn context(self, context: &MessageContext) -> Result<T, ExchangeError>;
}

impl<T, E: Into<ProcessError>> WithContext<T> for Result<T, E> {
	fn context(self, context: &MessageContext) -> Result<T, ExchangeError> {
		self.map_err(|err| ExchangeError::new(context.clone(), err))
	}
}

#[derive(Debug, Error)]
pub enum ProcessError {
	#[error("message has no Message-ID")]
	MissingMessageId,
	#[error("message has no content")]
	MissingPayload,
	#[error("message has no resolved partnership")]
	Unresolved,
	#[error("partnership has no AS2 URL")]
	NoUrl,
	#[error("partner answered with status {0}")]
	Rejected(u16),
	#[error("MIC in the MDN does not match the MIC of the message")]
	MicMismatch,
	#[error("no pending record for '{0}'")]
	UnknownPending(String),
	#[error(transparent)]
	Http(#[from] HttpError),
	#[error(transparent)]
	Client(#[from] ClientError),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error(transparent)]
	Cert(#[from] CertError),
	#[error(transparent)]
	Algorithm(#[from] ParseAlgorithmError),
	#[error(transparent)]
	Partnership(#[from] PartnershipError),
	#[error(transparent)]
	Mdn(#[from] MdnError),
	#[error(transparent)]
	Disposition(#[from] DispositionError),
	#[error(transparent)]
	Pending(#[from] PendingError),
	#[error(transparent)]
	Mime(#[from] MimeError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl ProcessError {
	/// The disposition modifier text a failure is reported with
	pub fn disposition_description(&self) -> &'static str {
		match self {
			ProcessError::Crypto(
				CryptoError::NotEncrypted | CryptoError::Cipher | CryptoError::KeyDerivation,
			) => "decryption-failed",
			ProcessError::Crypto(CryptoError::DigestMismatch) => "integrity-check-failed",
			ProcessError::Crypto(
				CryptoError::BadSignature | CryptoError::NoCertificate | CryptoError::Cert(_),
			)
			| ProcessError::Cert(_) => "authentication-failed",
			_ => "unexpected-processing-error",
		}
	}
}

#[cfg(test)]
mod test {
	use std::time::Duration;

	use tokio::{net::TcpListener, sync::watch};

	use super::*;
	use crate::{
		cert::{KeyStore, PrivateKey},
		mdn::Disposition,
		mime::MimePart,
		partnership::{
			Partnership, AS2_MDN_OPTIONS, AS2_MDN_TO, AS2_URL, CHUNKED, ENCRYPT, SIGN,
		},
		pending::PendingDirectory,
		store::DirectoryStore,
	};

	pub(super) struct Side {
		pub session: Arc<Session>,
		pub _dir: tempfile::TempDir,
	}

	pub(super) fn side(
		own: PrivateKey,
		partner: crate::cert::Certificate,
		partnerships: Vec<Partnership>,
		config: Config,
	) -> Side {
		let dir = tempfile::tempdir().unwrap();

		let certs = KeyStore::new();
		certs.insert_certificate(partner);
		certs.insert_private_key(own);

		let registry = PartnershipRegistry::new();
		for partnership in partnerships {
			registry.insert(partnership);
		}

		let pending = PendingDirectory::open(dir.path().join("pending"), dir.path().join("payloads")).unwrap();
		let store = DirectoryStore::open(dir.path().join("store")).unwrap();

		let session = Session::new(
			Arc::new(config),
			Arc::new(registry),
			Arc::new(certs),
			Arc::new(pending),
		)
		.with_store(Arc::new(store));

		Side {
			session: Arc::new(session),
			_dir: dir,
		}
	}

	async fn start(side: &Side) -> (String, watch::Sender<bool>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = format!("http://{}", listener.local_addr().unwrap());
		let (tx, rx) = watch::channel(false);

		tokio::spawn(net::listen(listener, side.session.clone(), rx));
		(address, tx)
	}

	fn keys() -> (PrivateKey, PrivateKey) {
		(
			PrivateKey::from_seed("alice", &[1; 32]),
			PrivateKey::from_seed("bob", &[2; 32]),
		)
	}

	fn policy(partnership: Partnership) -> Partnership {
		partnership
			.with_attribute(SIGN, "sha-256")
			.with_attribute(ENCRYPT, "chacha20-poly1305")
			.with_attribute(AS2_MDN_TO, "edi@alice.example")
			.with_attribute(
				AS2_MDN_OPTIONS,
				"signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=optional, sha-256",
			)
	}

	fn payload() -> MimePart {
		MimePart::new("application/edi-x12", b"ISA*00*          *00*~GS*PO~".to_vec())
	}

	#[tokio::test]
	async fn sync_mdn_over_tcp() {
		let (alice_key, bob_key) = keys();
		let (alice_cert, bob_cert) = (alice_key.certificate(), bob_key.certificate());

		let bob = side(
			bob_key,
			alice_cert,
			vec![policy(Partnership::new("alice-bob", "alice", "bob"))],
			Config::default(),
		);
		let (bob_url, _bob_shutdown) = start(&bob).await;

		let alice = side(
			alice_key,
			bob_cert,
			vec![policy(Partnership::new("alice-bob", "alice", "bob"))
				.with_attribute(AS2_URL, format!("{}/as2", bob_url))
				.with_attribute(CHUNKED, "true")],
			Config::default(),
		);

		let message = alice.session.build_message("alice", "bob", payload()).unwrap();
		let outcome = alice.session.send(message).await.unwrap();

		assert_eq!(outcome.state, SendState::Done);
		assert!(outcome.disposition_warning.is_none());

		let mdn = outcome.mdn.unwrap();
		assert_eq!(mdn.disposition().unwrap(), Disposition::processed());
		assert_eq!(mdn.original_message_id(), Some(outcome.message_id.as_str()));
		assert_eq!(mdn.partnership.sender_id, "bob");
		assert!(crypto_signed(&mdn));
	}

	fn crypto_signed(mdn: &Mdn) -> bool {
		crate::crypto::is_signed(mdn.data.as_ref().unwrap())
	}

	#[tokio::test]
	async fn async_mdn_over_tcp() {
		let (alice_key, bob_key) = keys();
		let (alice_cert, bob_cert) = (alice_key.certificate(), bob_key.certificate());

		let bob = side(
			bob_key,
			alice_cert,
			vec![Partnership::new("alice-bob", "alice", "bob").with_attribute(SIGN, "sha-384")],
			Config::default(),
		);
		let (bob_url, _bob_shutdown) = start(&bob).await;

		let alice_config = Config::default();
		let mdn_path = alice_config.async_mdn_path.clone();
		let alice = side(
			alice_key,
			bob_cert,
			vec![Partnership::new("alice-bob", "alice", "bob")
				.with_attribute(SIGN, "sha-384")
				.with_attribute(AS2_URL, bob_url.clone())
				.with_attribute(AS2_MDN_TO, "edi@alice.example")],
			alice_config,
		);
		let (alice_url, _alice_shutdown) = start(&alice).await;

		let mut message = alice.session.build_message("alice", "bob", payload()).unwrap();
		message.headers.set(
			crate::headers::RECEIPT_DELIVERY_OPTION,
			format!("{}{}", alice_url, mdn_path),
		);

		let outcome = alice.session.send(message).await.unwrap();
		assert_eq!(outcome.state, SendState::AsyncMdnPending);
		assert!(outcome.mdn.is_none());

		// the MDN arrives on its own connection and clears the record
		let mut cleared = false;
		for _ in 0..100 {
			if alice.session.pending().get(&outcome.message_id).unwrap().is_none() {
				cleared = true;
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert!(cleared);
	}

	#[tokio::test]
	async fn unknown_partnership_is_rejected() {
		let (alice_key, bob_key) = keys();
		let (alice_cert, bob_cert) = (alice_key.certificate(), bob_key.certificate());

		let bob = side(bob_key, alice_cert, vec![], Config::default());
		let (bob_url, _bob_shutdown) = start(&bob).await;

		let alice = side(
			alice_key,
			bob_cert,
			vec![Partnership::new("alice-bob", "alice", "bob").with_attribute(AS2_URL, bob_url)],
			Config::default(),
		);

		let message = alice.session.build_message("alice", "bob", payload()).unwrap();
		let err = alice.session.send(message).await.unwrap_err();

		assert!(matches!(err.kind, ProcessError::Rejected(400)));
		assert_eq!(err.context.receiver.as_deref(), Some("bob"));
	}

	#[test]
	fn mic_algorithm_choice() {
		let options = DispositionOptions::parse("signed-receipt-micalg=optional, md5, sha-512");

		assert_eq!(mic_algorithm(Some(SignAlgorithm::Sha224), &options), SignAlgorithm::Sha224);
		assert_eq!(mic_algorithm(None, &options), SignAlgorithm::Sha512);
		assert_eq!(
			mic_algorithm(None, &DispositionOptions::default()),
			SignAlgorithm::Sha256
		);
	}

	#[test]
	fn failure_descriptions() {
		assert_eq!(
			ProcessError::Crypto(CryptoError::Cipher).disposition_description(),
			"decryption-failed"
		);
		assert_eq!(
			ProcessError::Crypto(CryptoError::BadSignature).disposition_description(),
			"authentication-failed"
		);
		assert_eq!(
			ProcessError::MissingPayload.disposition_description(),
			"unexpected-processing-error"
		);
	}

	#[test]
	fn sweep_removes_stale_records() {
		let (alice_key, bob_key) = keys();
		let alice = side(
			alice_key,
			bob_key.certificate(),
			vec![],
			Config {
				pending_max_age: Duration::ZERO,
				..Config::default()
			},
		);

		let record = crate::pending::PendingRecord {
			mic: "XYZ==, sha-256".into(),
			payload: "/nonexistent".into(),
		};
		alice.session.pending().put("<old@alice_bob>", &record).unwrap();
		std::thread::sleep(Duration::from_millis(20));

		let swept = alice.session.sweep_pending().unwrap();
		assert_eq!(swept.len(), 1);
		assert!(alice.session.pending().get("<old@alice_bob>").unwrap().is_none());
	}
}
