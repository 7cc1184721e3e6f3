use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Nonce, Payload};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{CryptoError, EncryptAlgorithm, ENVELOPE_TYPE};
use crate::{
	cert::{Certificate, PrivateKey},
	headers::{Headers, CONTENT_DISPOSITION, CONTENT_TRANSFER_ENCODING},
	mime::MimePart,
};

const CONTENT_ENCRYPTION_ALGORITHM: &str = "Content-Encryption-Algorithm";
const RECIPIENT: &str = "Recipient";
const EPHEMERAL_KEY: &str = "Ephemeral-Key";
const KEY_NONCE: &str = "Key-Nonce";
const WRAPPED_KEY: &str = "Wrapped-Key";
const CONTENT_NONCE: &str = "Content-Nonce";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub fn is_encrypted(part: &MimePart) -> bool {
	part.is_media_type(ENVELOPE_TYPE)
}

/// Envelopes `part` for the holder of `recipient`. The content is sealed with
/// a fresh content key, which is itself sealed with a key agreed between a
/// throwaway X25519 key and the recipient's agreement key.
pub fn encrypt(part: &MimePart, algorithm: EncryptAlgorithm, recipient: &Certificate) -> Result<MimePart, CryptoError> {
	let ephemeral = EphemeralSecret::random_from_rng(OsRng);
	let ephemeral_public = PublicKey::from(&ephemeral);
	let shared = ephemeral.diffie_hellman(&recipient.agreement_key);

	let wrapping_key = derive_wrapping_key(
		algorithm,
		shared.as_bytes(),
		&ephemeral_public,
		&recipient.agreement_key,
	)?;

	let mut content_key = [0; KEY_LEN];
	let mut key_nonce = [0; NONCE_LEN];
	let mut content_nonce = [0; NONCE_LEN];
	OsRng.fill_bytes(&mut content_key);
	OsRng.fill_bytes(&mut key_nonce);
	OsRng.fill_bytes(&mut content_nonce);

	let aad = algorithm.id().as_bytes();
	let wrapped_key = seal(algorithm, &wrapping_key, &key_nonce, aad, &content_key)?;
	let ciphertext = seal(algorithm, &content_key, &content_nonce, aad, &part.to_bytes())?;

	let mut envelope = Headers::new();
	envelope.set(CONTENT_ENCRYPTION_ALGORITHM, algorithm.id());
	envelope.set(RECIPIENT, recipient.alias.as_str());
	envelope.set(EPHEMERAL_KEY, STANDARD.encode(ephemeral_public.as_bytes()));
	envelope.set(KEY_NONCE, STANDARD.encode(key_nonce));
	envelope.set(WRAPPED_KEY, STANDARD.encode(wrapped_key));
	envelope.set(CONTENT_NONCE, STANDARD.encode(content_nonce));

	let envelope = MimePart {
		headers: envelope,
		content: ciphertext,
	};
	let mut enveloped = MimePart::new(ENVELOPE_TYPE, envelope.to_bytes());
	enveloped.headers.set(CONTENT_TRANSFER_ENCODING, "binary");
	enveloped
		.headers
		.set(CONTENT_DISPOSITION, "attachment; filename=as2.env");

	Ok(enveloped)
}

pub fn decrypt(part: &MimePart, key: &PrivateKey) -> Result<MimePart, CryptoError> {
	if !is_encrypted(part) {
		return Err(CryptoError::NotEncrypted);
	}

	let envelope = MimePart::parse(&part.decoded_content()?)?;
	let fields = &envelope.headers;

	let algorithm: EncryptAlgorithm = fields
		.get(CONTENT_ENCRYPTION_ALGORITHM)
		.ok_or(CryptoError::Missing(CONTENT_ENCRYPTION_ALGORITHM))?
		.parse()?;

	if let Some(recipient) = fields.get(RECIPIENT) {
		if recipient != key.alias {
			tracing::debug!(
				recipient,
				alias = key.alias.as_str(),
				"envelope recipient differs from key alias"
			);
		}
	}

	let ephemeral_public = PublicKey::from(fixed::<KEY_LEN>(fields, EPHEMERAL_KEY)?);
	let key_nonce = fixed::<NONCE_LEN>(fields, KEY_NONCE)?;
	let content_nonce = fixed::<NONCE_LEN>(fields, CONTENT_NONCE)?;
	let wrapped_key = field(fields, WRAPPED_KEY)?;

	let own_public = PublicKey::from(&key.agreement_secret);
	let shared = key.agreement_secret.diffie_hellman(&ephemeral_public);
	let wrapping_key = derive_wrapping_key(algorithm, shared.as_bytes(), &ephemeral_public, &own_public)?;

	let aad = algorithm.id().as_bytes();
	let content_key = open(algorithm, &wrapping_key, &key_nonce, aad, &wrapped_key)?;
	if content_key.len() != KEY_LEN {
		return Err(CryptoError::Malformed("content key has the wrong length"));
	}

	let plaintext = open(algorithm, &content_key, &content_nonce, aad, &envelope.content)?;

	Ok(MimePart::parse(&plaintext)?)
}

fn derive_wrapping_key(
	algorithm: EncryptAlgorithm,
	shared: &[u8],
	ephemeral: &PublicKey,
	recipient: &PublicKey,
) -> Result<[u8; KEY_LEN], CryptoError> {
	let mut salt = ephemeral.as_bytes().to_vec();
	salt.extend_from_slice(recipient.as_bytes());

	let info = format!("as2 key wrap {}", algorithm.id());
	let mut key = [0; KEY_LEN];
	Hkdf::<Sha256>::new(Some(&salt), shared)
		.expand(info.as_bytes(), &mut key)
		.map_err(|_| CryptoError::KeyDerivation)?;

	Ok(key)
}

fn seal(algorithm: EncryptAlgorithm, key: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
	match algorithm {
		EncryptAlgorithm::ChaCha20Poly1305 => seal_with::<chacha20poly1305::ChaCha20Poly1305>(key, nonce, aad, msg),
		EncryptAlgorithm::Aes256Gcm => seal_with::<aes_gcm::Aes256Gcm>(key, nonce, aad, msg),
	}
}

fn open(algorithm: EncryptAlgorithm, key: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
	match algorithm {
		EncryptAlgorithm::ChaCha20Poly1305 => open_with::<chacha20poly1305::ChaCha20Poly1305>(key, nonce, aad, msg),
		EncryptAlgorithm::Aes256Gcm => open_with::<aes_gcm::Aes256Gcm>(key, nonce, aad, msg),
	}
}

fn seal_with<C: Aead + KeyInit>(key: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
	C::new_from_slice(key)
		.map_err(|_| CryptoError::Cipher)?
		.encrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
		.map_err(|_| CryptoError::Cipher)
}

fn open_with<C: Aead + KeyInit>(key: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, CryptoError> {
	C::new_from_slice(key)
		.map_err(|_| CryptoError::Cipher)?
		.decrypt(Nonce::<C>::from_slice(nonce), Payload { msg, aad })
		.map_err(|_| CryptoError::Cipher)
}

fn field(fields: &Headers, name: &'static str) -> Result<Vec<u8>, CryptoError> {
	let value = fields.get(name).ok_or(CryptoError::Missing(name))?;
	STANDARD
		.decode(value.trim())
		.map_err(|_| CryptoError::Malformed("envelope field is not base64"))
}

fn fixed<const N: usize>(fields: &Headers, name: &'static str) -> Result<[u8; N], CryptoError> {
	field(fields, name)?
		.try_into()
		.map_err(|_| CryptoError::Malformed("envelope field has the wrong length"))
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::mime;

	fn payload() -> MimePart {
		MimePart::new("application/edi-x12", b"ISA*00*          *00*~".to_vec())
	}

	#[test]
	fn round_trip_each_cipher() {
		let key = PrivateKey::from_seed("bob", &[5; 32]);

		for algorithm in EncryptAlgorithm::ALL {
			let enveloped = encrypt(&payload(), algorithm, &key.certificate()).unwrap();

			assert!(is_encrypted(&enveloped));
			assert_eq!(enveloped.transfer_encoding(), Some("binary"));
			assert_eq!(decrypt(&enveloped, &key).unwrap(), payload());
		}
	}

	#[test]
	fn base64_transfer_encoding() {
		let key = PrivateKey::from_seed("bob", &[5; 32]);
		let mut enveloped = encrypt(&payload(), EncryptAlgorithm::Aes256Gcm, &key.certificate()).unwrap();

		enveloped.content = mime::encode_base64_lines(&enveloped.content);
		enveloped.headers.set(CONTENT_TRANSFER_ENCODING, "base64");

		assert_eq!(decrypt(&enveloped, &key).unwrap(), payload());
	}

	#[test]
	fn wrong_key() {
		let bob = PrivateKey::from_seed("bob", &[5; 32]);
		let eve = PrivateKey::from_seed("bob", &[6; 32]);
		let enveloped = encrypt(&payload(), EncryptAlgorithm::ChaCha20Poly1305, &bob.certificate()).unwrap();

		assert_eq!(decrypt(&enveloped, &eve), Err(CryptoError::Cipher));
	}

	#[test]
	fn tampered_ciphertext() {
		let key = PrivateKey::from_seed("bob", &[5; 32]);
		let mut enveloped = encrypt(&payload(), EncryptAlgorithm::ChaCha20Poly1305, &key.certificate()).unwrap();

		let last = enveloped.content.len() - 1;
		enveloped.content[last] ^= 1;

		assert_eq!(decrypt(&enveloped, &key), Err(CryptoError::Cipher));
	}

	#[test]
	fn not_enveloped() {
		let key = PrivateKey::from_seed("bob", &[5; 32]);

		assert!(!is_encrypted(&payload()));
		assert_eq!(decrypt(&payload(), &key), Err(CryptoError::NotEncrypted));

		let cms = MimePart::new("application/pkcs7-mime; smime-type=enveloped-data", vec![]);
		assert!(!is_encrypted(&cms));
	}
}
