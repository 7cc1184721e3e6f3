mod algorithm;
mod envelope;
mod sign;

pub use algorithm::{EncryptAlgorithm, ParseAlgorithmError, SignAlgorithm};
pub use envelope::{decrypt, encrypt, is_encrypted};
pub use sign::{canonicalize, is_signed, sign, verify, Verified};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::{
	cert::{CertError, CertificateProvider},
	mime::{MimeError, MimePart},
	partnership::{Partnership, PartnershipRole},
};

/// The detached signature block inside a `multipart/signed` body
pub const SIGNATURE_TYPE: &str = "application/x-as2-signature";
/// A body sealed for its recipient
pub const ENVELOPE_TYPE: &str = "application/x-as2-envelope";

/// What is done to an outbound body, decided by the partnership
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SecureMode {
	None,
	Sign(SignAlgorithm),
	Encrypt(EncryptAlgorithm),
	SignThenEncrypt(SignAlgorithm, EncryptAlgorithm),
}

impl SecureMode {
	pub fn for_partnership(partnership: &Partnership) -> Result<Self, ParseAlgorithmError> {
		Ok(match (partnership.sign_algorithm()?, partnership.encrypt_algorithm()?) {
			(None, None) => Self::None,
			(Some(sign), None) => Self::Sign(sign),
			(None, Some(encrypt)) => Self::Encrypt(encrypt),
			(Some(sign), Some(encrypt)) => Self::SignThenEncrypt(sign, encrypt),
		})
	}

	pub fn sign_algorithm(self) -> Option<SignAlgorithm> {
		match self {
			Self::Sign(sign) | Self::SignThenEncrypt(sign, _) => Some(sign),
			_ => None,
		}
	}

	pub fn encrypt_algorithm(self) -> Option<EncryptAlgorithm> {
		match self {
			Self::Encrypt(encrypt) | Self::SignThenEncrypt(_, encrypt) => Some(encrypt),
			_ => None,
		}
	}
}

/// Applies `mode` to an outbound body. Signing uses the sender's key and
/// encryption the receiver's certificate.
pub fn secure(
	part: &MimePart,
	mode: SecureMode,
	partnership: &Partnership,
	certs: &dyn CertificateProvider,
) -> Result<MimePart, CryptoError> {
	let mut part = part.clone();

	if let Some(algorithm) = mode.sign_algorithm() {
		let key = certs.private_key(partnership, PartnershipRole::Sender)?;
		part = sign(&part, algorithm, &key, true);
	}

	if let Some(algorithm) = mode.encrypt_algorithm() {
		let certificate = certs.certificate(partnership, PartnershipRole::Receiver)?;
		part = encrypt(&part, algorithm, &certificate)?;
	}

	Ok(part)
}

/// An inbound body with its protection removed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opened {
	pub content: MimePart,
	pub encrypted: bool,
	/// Present when the body was signed
	pub verified: Option<Verified>,
}

impl Opened {
	/// The bytes a MIC over this body covers, and whether they were signed
	pub fn mic_input(&self) -> (&[u8], bool) {
		match &self.verified {
			Some(verified) => (&verified.signed_bytes, true),
			None => (&self.content.content, false),
		}
	}
}

/// Decrypts and then verifies an inbound body, as far as it is protected.
/// `trust_embedded` is the global default for using a certificate carried in
/// the signature; the partnership may override it.
pub fn open(
	part: &MimePart,
	partnership: &Partnership,
	certs: &dyn CertificateProvider,
	trust_embedded: bool,
) -> Result<Opened, CryptoError> {
	let mut content = part.clone();

	refuse_cms(&content)?;
	let encrypted = is_encrypted(&content);
	if encrypted {
		let key = certs.private_key(partnership, PartnershipRole::Receiver)?;
		content = decrypt(&content, &key)?;
	}

	if encrypted {
		refuse_cms(&content)?;
	}

	let verified = if is_signed(&content) {
		let certificate = certs.certificate(partnership, PartnershipRole::Sender);
		let trust = partnership.trust_embedded_certificate().unwrap_or(trust_embedded);

		let certificate = match certificate {
			Ok(certificate) => Some(certificate),
			Err(err) if trust => {
				tracing::debug!("no stored certificate, relying on the embedded one: {}", err);
				None
			}
			Err(err) => return Err(err.into()),
		};

		let verified = verify(&content, certificate.as_ref(), trust)?;
		content = verified.content.clone();
		Some(verified)
	} else {
		None
	};

	if partnership.encrypt_algorithm().ok().flatten().is_some() && !encrypted {
		tracing::warn!(partnership = partnership.name.as_str(), "expected an encrypted body");
	}
	if partnership.sign_algorithm().ok().flatten().is_some() && verified.is_none() {
		tracing::warn!(partnership = partnership.name.as_str(), "expected a signed body");
	}

	Ok(Opened {
		content,
		encrypted,
		verified,
	})
}

// S/MIME bodies carry CMS structures, which are not read here
fn refuse_cms(part: &MimePart) -> Result<(), CryptoError> {
	let media = part.media_type();
	if media == "application/pkcs7-mime" || media == "application/x-pkcs7-mime" {
		return Err(CryptoError::Unsupported(media));
	}

	Ok(())
}

/// `<base64 digest>, <algorithm id>`. Signed bodies are digested in the form
/// they were signed in, unsigned ones over their raw content.
pub fn compute_mic(part: &MimePart, algorithm: SignAlgorithm, was_signed: bool) -> String {
	if was_signed {
		mic_over(&canonicalize(part), algorithm)
	} else {
		mic_over(&part.content, algorithm)
	}
}

pub fn mic_over(bytes: &[u8], algorithm: SignAlgorithm) -> String {
	format!("{}, {}", STANDARD.encode(algorithm.digest(bytes)), algorithm.id())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
	#[error("entity is not multipart/signed")]
	NotSigned,
	#[error("entity is not enveloped data")]
	NotEncrypted,
	#[error("required field {0} is missing")]
	Missing(&'static str),
	#[error("malformed structure: {0}")]
	Malformed(&'static str),
	#[error("content digest does not match the signed digest")]
	DigestMismatch,
	#[error("signature does not verify")]
	BadSignature,
	#[error("no certificate available to verify the signature")]
	NoCertificate,
	#[error("cipher operation failed")]
	Cipher,
	#[error("key derivation failed")]
	KeyDerivation,
	#[error("unsupported protection format {0}")]
	Unsupported(String),
	#[error(transparent)]
	Algorithm(#[from] ParseAlgorithmError),
	#[error(transparent)]
	Cert(#[from] CertError),
	#[error(transparent)]
	Mime(#[from] MimeError),
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::{
		cert::{KeyStore, PrivateKey},
		partnership::{ENCRYPT, SIGN, VERIFY_USE_CERT_IN_BODY_PART},
	};

	fn keys() -> (KeyStore, KeyStore) {
		let alice = PrivateKey::from_seed("alice", &[1; 32]);
		let bob = PrivateKey::from_seed("bob", &[2; 32]);

		let alice_store = KeyStore::new();
		alice_store.insert_certificate(bob.certificate());
		let bob_store = KeyStore::new();
		bob_store.insert_certificate(alice.certificate());

		alice_store.insert_private_key(alice);
		bob_store.insert_private_key(bob);

		(alice_store, bob_store)
	}

	fn partnership() -> Partnership {
		Partnership::new("p", "alice", "bob")
			.with_attribute(SIGN, "sha-256")
			.with_attribute(ENCRYPT, "aes256-gcm")
	}

	#[test]
	fn mode_from_partnership() {
		assert_eq!(
			SecureMode::for_partnership(&partnership()),
			Ok(SecureMode::SignThenEncrypt(
				SignAlgorithm::Sha256,
				EncryptAlgorithm::Aes256Gcm
			))
		);
		assert_eq!(
			SecureMode::for_partnership(&Partnership::new("p", "a", "b")),
			Ok(SecureMode::None)
		);
	}

	#[test]
	fn sign_then_encrypt_round_trip() {
		let (alice, bob) = keys();
		let payload = MimePart::new("application/xml", b"<order/>".to_vec());
		let mode = SecureMode::for_partnership(&partnership()).unwrap();

		let secured = secure(&payload, mode, &partnership(), &alice).unwrap();
		assert!(is_encrypted(&secured));

		let opened = open(&secured, &partnership(), &bob, false).unwrap();
		assert!(opened.encrypted);
		assert_eq!(opened.content, payload);

		let (bytes, signed) = opened.mic_input();
		assert!(signed);
		assert_eq!(
			mic_over(bytes, SignAlgorithm::Sha256),
			compute_mic(&payload, SignAlgorithm::Sha256, true)
		);
	}

	#[test]
	fn unprotected_body() {
		let (_, bob) = keys();
		let payload = MimePart::new("application/xml", b"<order/>".to_vec());

		let opened = open(&payload, &Partnership::new("p", "alice", "bob"), &bob, false).unwrap();
		assert!(!opened.encrypted);
		assert!(opened.verified.is_none());
		assert_eq!(
			mic_over(opened.mic_input().0, SignAlgorithm::Sha256),
			compute_mic(&payload, SignAlgorithm::Sha256, false)
		);
	}

	#[test]
	fn embedded_certificate_override() {
		let (alice, _) = keys();
		let empty = KeyStore::new();
		empty.insert_private_key(PrivateKey::from_seed("bob", &[2; 32]));

		let payload = MimePart::new("text/plain", b"hi".to_vec());
		let signing = Partnership::new("p", "alice", "bob").with_attribute(SIGN, "sha-384");
		let secured = secure(
			&payload,
			SecureMode::Sign(SignAlgorithm::Sha384),
			&signing,
			&alice,
		)
		.unwrap();

		assert_eq!(
			open(&secured, &signing, &empty, false),
			Err(CryptoError::Cert(CertError::UnknownAlias("alice".into())))
		);

		let trusting = signing.with_attribute(VERIFY_USE_CERT_IN_BODY_PART, "true");
		let opened = open(&secured, &trusting, &empty, false).unwrap();
		assert!(opened.verified.unwrap().used_embedded_certificate);
	}

	#[test]
	fn cms_body_is_refused() {
		let (_, bob) = keys();
		let cms = MimePart::new("application/pkcs7-mime; smime-type=enveloped-data", b"0\x80".to_vec());

		assert_eq!(
			open(&cms, &partnership(), &bob, false),
			Err(CryptoError::Unsupported("application/pkcs7-mime".into()))
		);
	}

	#[test]
	fn mic_format() {
		let payload = MimePart::new("text/plain", b"abc".to_vec());

		assert_eq!(
			compute_mic(&payload, SignAlgorithm::Sha256, false),
			"ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=, sha-256"
		);
	}
}
