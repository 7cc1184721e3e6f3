use std::{collections::HashMap, fmt::Display, str::FromStr, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::partnership::{Partnership, PartnershipRole};

/// The public half of a trading identity: a key that checks its signatures
/// and a key that content can be enveloped for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
	pub alias: String,
	pub verifying_key: VerifyingKey,
	pub agreement_key: PublicKey,
}

impl Certificate {
	/// `alias;<base64 verifying key>;<base64 agreement key>`
	pub fn encode(&self) -> String {
		format!(
			"{};{};{}",
			self.alias,
			STANDARD.encode(self.verifying_key.as_bytes()),
			STANDARD.encode(self.agreement_key.as_bytes())
		)
	}
}

impl Display for Certificate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.encode())
	}
}

impl FromStr for Certificate {
	type Err = CertError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut fields = s.trim().splitn(3, ';');

		let alias = fields.next().unwrap_or_default().trim();
		let verifying = fields.next().ok_or_else(|| malformed("missing verifying key"))?;
		let agreement = fields.next().ok_or_else(|| malformed("missing agreement key"))?;

		if alias.is_empty() {
			return Err(malformed("empty alias"));
		}

		let verifying_key = VerifyingKey::from_bytes(&key_bytes(verifying)?)
			.map_err(|_| malformed("verifying key is not a curve point"))?;

		Ok(Self {
			alias: alias.to_string(),
			verifying_key,
			agreement_key: PublicKey::from(key_bytes(agreement)?),
		})
	}
}

/// The private half of a trading identity
pub struct PrivateKey {
	pub alias: String,
	pub signing_key: SigningKey,
	pub agreement_secret: StaticSecret,
}

impl PrivateKey {
	pub fn generate<S: Into<String>>(alias: S) -> Self {
		Self {
			alias: alias.into(),
			signing_key: SigningKey::generate(&mut OsRng),
			agreement_secret: StaticSecret::random_from_rng(OsRng),
		}
	}

	/// Both keys are derived from one 32 byte seed so configuration only has
	/// to carry a single value per identity.
	pub fn from_seed<S: Into<String>>(alias: S, seed: &[u8; 32]) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(b"as2 agreement key\0");
		hasher.update(seed);
		let agreement: [u8; 32] = hasher.finalize().into();

		Self {
			alias: alias.into(),
			signing_key: SigningKey::from_bytes(seed),
			agreement_secret: StaticSecret::from(agreement),
		}
	}

	pub fn from_base64_seed<S: Into<String>>(alias: S, seed: &str) -> Result<Self, CertError> {
		Ok(Self::from_seed(alias, &key_bytes(seed)?))
	}

	pub fn certificate(&self) -> Certificate {
		Certificate {
			alias: self.alias.clone(),
			verifying_key: self.signing_key.verifying_key(),
			agreement_key: PublicKey::from(&self.agreement_secret),
		}
	}
}

impl std::fmt::Debug for PrivateKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PrivateKey")
			.field("alias", &self.alias)
			.finish_non_exhaustive()
	}
}

/// Supplies key material for one side of a partnership
pub trait CertificateProvider: Send + Sync {
	fn certificate(&self, partnership: &Partnership, role: PartnershipRole) -> Result<Certificate, CertError>;

	fn private_key(&self, partnership: &Partnership, role: PartnershipRole) -> Result<Arc<PrivateKey>, CertError>;
}

struct Entry {
	certificate: Certificate,
	key: Option<Arc<PrivateKey>>,
}

/// In memory certificates and keys, looked up by alias
#[derive(Default)]
pub struct KeyStore {
	entries: RwLock<HashMap<String, Entry>>,
}

impl KeyStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a partner's certificate. A private key already stored under the
	/// alias is dropped if it doesn't belong to the new certificate.
	pub fn insert_certificate(&self, certificate: Certificate) {
		let mut entries = self.entries.write();

		let key = entries
			.remove(&certificate.alias)
			.and_then(|entry| entry.key)
			.filter(|key| key.certificate() == certificate);

		entries.insert(certificate.alias.clone(), Entry { certificate, key });
	}

	pub fn insert_private_key(&self, key: PrivateKey) {
		let certificate = key.certificate();

		self.entries.write().insert(
			key.alias.clone(),
			Entry {
				certificate,
				key: Some(Arc::new(key)),
			},
		);
	}

	pub fn aliases(&self) -> Vec<String> {
		let mut aliases: Vec<String> = self.entries.read().keys().cloned().collect();
		aliases.sort();
		aliases
	}

	pub fn certificate_by_alias(&self, alias: &str) -> Result<Certificate, CertError> {
		self.entries
			.read()
			.get(alias)
			.map(|entry| entry.certificate.clone())
			.ok_or_else(|| CertError::UnknownAlias(alias.to_string()))
	}

	pub fn private_key_by_alias(&self, alias: &str) -> Result<Arc<PrivateKey>, CertError> {
		let entries = self.entries.read();
		let entry = entries
			.get(alias)
			.ok_or_else(|| CertError::UnknownAlias(alias.to_string()))?;

		entry
			.key
			.clone()
			.ok_or_else(|| CertError::NoPrivateKey(alias.to_string()))
	}
}

impl CertificateProvider for KeyStore {
	fn certificate(&self, partnership: &Partnership, role: PartnershipRole) -> Result<Certificate, CertError> {
		self.certificate_by_alias(partnership.alias(role))
	}

	fn private_key(&self, partnership: &Partnership, role: PartnershipRole) -> Result<Arc<PrivateKey>, CertError> {
		self.private_key_by_alias(partnership.alias(role))
	}
}

fn key_bytes(encoded: &str) -> Result<[u8; 32], CertError> {
	let bytes = STANDARD
		.decode(encoded.trim())
		.map_err(|_| malformed("key is not base64"))?;

	bytes
		.try_into()
		.map_err(|_| malformed("key is not 32 bytes long"))
}

fn malformed(reason: &str) -> CertError {
	CertError::Malformed(reason.to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertError {
	#[error("no certificate for alias '{0}'")]
	UnknownAlias(String),
	#[error("no private key for alias '{0}'")]
	NoPrivateKey(String),
	#[error("malformed certificate: {0}")]
	Malformed(String),
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::partnership::SENDER_X509_ALIAS;

	#[test]
	fn certificate_text_form() {
		let key = PrivateKey::generate("alice");
		let certificate = key.certificate();

		let parsed: Certificate = certificate.encode().parse().unwrap();
		assert_eq!(parsed, certificate);

		assert!("alice;AAAA".parse::<Certificate>().is_err());
		assert!(";a;b".parse::<Certificate>().is_err());
	}

	#[test]
	fn seeds_are_deterministic() {
		let seed = [9; 32];
		let first = PrivateKey::from_seed("a", &seed).certificate();
		let second = PrivateKey::from_base64_seed("a", &STANDARD.encode(seed))
			.unwrap()
			.certificate();

		assert_eq!(first, second);
		assert_ne!(first, PrivateKey::from_seed("a", &[8; 32]).certificate());
	}

	#[test]
	fn provider_lookup_by_role() {
		let store = KeyStore::new();
		store.insert_private_key(PrivateKey::from_seed("alice-key", &[1; 32]));
		store.insert_certificate(PrivateKey::from_seed("bob", &[2; 32]).certificate());

		let partnership =
			Partnership::new("p", "alice", "bob").with_attribute(SENDER_X509_ALIAS, "alice-key");

		assert_eq!(
			store
				.private_key(&partnership, PartnershipRole::Sender)
				.unwrap()
				.alias,
			"alice-key"
		);
		assert_eq!(
			store
				.certificate(&partnership, PartnershipRole::Receiver)
				.unwrap()
				.alias,
			"bob"
		);
		assert_eq!(
			store
				.private_key(&partnership, PartnershipRole::Receiver)
				.unwrap_err(),
			CertError::NoPrivateKey("bob".into())
		);
		assert_eq!(store.aliases(), vec!["alice-key", "bob"]);
	}

	#[test]
	fn certificate_keeps_matching_key() {
		let store = KeyStore::new();
		let key = PrivateKey::from_seed("me", &[3; 32]);
		let certificate = key.certificate();
		store.insert_private_key(key);

		store.insert_certificate(certificate);
		assert!(store.private_key_by_alias("me").is_ok());

		store.insert_certificate(PrivateKey::from_seed("me", &[4; 32]).certificate());
		assert!(store.private_key_by_alias("me").is_err());
	}
}
