use std::collections::BTreeMap;

use dashmap::DashMap;
use thiserror::Error;

use crate::{
	crypto::{EncryptAlgorithm, ParseAlgorithmError, SignAlgorithm},
	headers::{AS2_FROM, AS2_TO},
	message::Message,
};

pub const SIGN: &str = "sign";
pub const ENCRYPT: &str = "encrypt";
pub const CONTENT_TRANSFER_ENCODING: &str = "content_transfer_encoding";
pub const CONTENT_TRANSFER_ENCODING_RECEIVE: &str = "content_transfer_encoding_receive";
pub const AS2_URL: &str = "as2_url";
pub const AS2_MDN_TO: &str = "as2_mdn_to";
pub const AS2_MDN_OPTIONS: &str = "as2_mdn_options";
pub const AS2_RECEIPT_OPTION: &str = "as2_receipt_option";
pub const SENDER_X509_ALIAS: &str = "sender_x509_alias";
pub const RECEIVER_X509_ALIAS: &str = "receiver_x509_alias";
pub const VERIFY_USE_CERT_IN_BODY_PART: &str = "verify_use_cert_in_body_part";
pub const SUBJECT: &str = "subject";
pub const CHUNKED: &str = "chunked";

/// The relationship between one sending and one receiving AS2 identity, with
/// the policy that applies to messages travelling between them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partnership {
	pub name: String,
	pub sender_id: String,
	pub receiver_id: String,
	pub attributes: BTreeMap<String, String>,
}

/// Which side of a partnership some key material belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartnershipRole {
	Sender,
	Receiver,
}

impl Partnership {
	pub fn new<N, S, R>(name: N, sender_id: S, receiver_id: R) -> Self
	where
		N: Into<String>,
		S: Into<String>,
		R: Into<String>,
	{
		Self {
			name: name.into(),
			sender_id: sender_id.into(),
			receiver_id: receiver_id.into(),
			attributes: BTreeMap::new(),
		}
	}

	pub fn with_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
		self.set_attribute(key, value);
		self
	}

	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes
			.get(key)
			.map(|value| value.trim())
			.filter(|value| !value.is_empty())
	}

	pub fn set_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
		self.attributes.insert(key.into(), value.into());
	}

	/// Both identities are known. Nothing goes on the wire before this holds.
	pub fn is_resolved(&self) -> bool {
		!self.sender_id.is_empty() && !self.receiver_id.is_empty()
	}

	pub fn key(&self) -> (String, String) {
		(self.sender_id.clone(), self.receiver_id.clone())
	}

	pub fn sign_algorithm(&self) -> Result<Option<SignAlgorithm>, ParseAlgorithmError> {
		self.attribute(SIGN).map(str::parse).transpose()
	}

	pub fn encrypt_algorithm(&self) -> Result<Option<EncryptAlgorithm>, ParseAlgorithmError> {
		self.attribute(ENCRYPT).map(str::parse).transpose()
	}

	pub fn alias(&self, role: PartnershipRole) -> &str {
		match role {
			PartnershipRole::Sender => self.attribute(SENDER_X509_ALIAS).unwrap_or(&self.sender_id),
			PartnershipRole::Receiver => self.attribute(RECEIVER_X509_ALIAS).unwrap_or(&self.receiver_id),
		}
	}

	/// The per-partnership override of the embedded certificate policy. None
	/// means the global setting applies.
	pub fn trust_embedded_certificate(&self) -> Option<bool> {
		match self.attribute(VERIFY_USE_CERT_IN_BODY_PART)?.to_ascii_lowercase().as_str() {
			"true" | "yes" | "1" => Some(true),
			"false" | "no" | "0" => Some(false),
			_ => None,
		}
	}

	pub fn as2_url(&self) -> Option<&str> {
		self.attribute(AS2_URL)
	}

	pub fn mdn_to(&self) -> Option<&str> {
		self.attribute(AS2_MDN_TO)
	}

	pub fn mdn_options(&self) -> Option<&str> {
		self.attribute(AS2_MDN_OPTIONS)
	}

	/// Where the partner should post an asynchronous MDN
	pub fn receipt_url(&self) -> Option<&str> {
		self.attribute(AS2_RECEIPT_OPTION)
	}

	pub fn subject(&self) -> Option<&str> {
		self.attribute(SUBJECT)
	}

	pub fn content_transfer_encoding(&self) -> &str {
		self.attribute(CONTENT_TRANSFER_ENCODING).unwrap_or("binary")
	}

	/// Encoding to assume for inbound bodies that don't declare one
	pub fn content_transfer_encoding_receive(&self) -> Option<&str> {
		self.attribute(CONTENT_TRANSFER_ENCODING_RECEIVE)
	}

	pub fn is_chunked(&self) -> bool {
		self.attribute(CHUNKED)
			.map_or(false, |value| value.eq_ignore_ascii_case("true"))
	}

	/// The partnership seen from the other side: identities and certificate
	/// aliases trade places, the remaining policy is kept.
	pub fn swapped(&self) -> Self {
		let mut swapped = Self {
			name: self.name.clone(),
			sender_id: self.receiver_id.clone(),
			receiver_id: self.sender_id.clone(),
			attributes: self.attributes.clone(),
		};

		swapped.attributes.remove(SENDER_X509_ALIAS);
		swapped.attributes.remove(RECEIVER_X509_ALIAS);
		if let Some(alias) = self.attributes.get(SENDER_X509_ALIAS) {
			swapped.set_attribute(RECEIVER_X509_ALIAS, alias.clone());
		}
		if let Some(alias) = self.attributes.get(RECEIVER_X509_ALIAS) {
			swapped.set_attribute(SENDER_X509_ALIAS, alias.clone());
		}

		swapped
	}
}

/// Every known partnership, keyed by `(sender, receiver)`. Lookups of one key
/// never wait on writes to another.
#[derive(Debug, Default)]
pub struct PartnershipRegistry {
	partnerships: DashMap<(String, String), Partnership>,
}

impl PartnershipRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, partnership: Partnership) -> Option<Partnership> {
		self.partnerships.insert(partnership.key(), partnership)
	}

	pub fn len(&self) -> usize {
		self.partnerships.len()
	}

	pub fn is_empty(&self) -> bool {
		self.partnerships.is_empty()
	}

	pub fn resolve(&self, sender: &str, receiver: &str) -> Result<Partnership, PartnershipError> {
		self.partnerships
			.get(&(sender.to_string(), receiver.to_string()))
			.map(|entry| entry.value().clone())
			.ok_or_else(|| PartnershipError::NotFound {
				sender: sender.to_string(),
				receiver: receiver.to_string(),
			})
	}

	/// Looks up the partnership named by a message's AS2-From and AS2-To
	/// headers and attaches it to the message.
	pub fn resolve_message(&self, message: &mut Message) -> Result<(), PartnershipError> {
		let sender = message
			.as2_from()
			.ok_or(PartnershipError::MissingHeader(AS2_FROM))?;
		let receiver = message.as2_to().ok_or(PartnershipError::MissingHeader(AS2_TO))?;

		message.partnership = self.resolve(&sender, &receiver)?;
		Ok(())
	}

	/// Merges what is known about `partnership` into the stored record, then
	/// refreshes `partnership` from it. Stored values win unless `overwrite`.
	pub fn update(&self, partnership: &mut Partnership, overwrite: bool) -> Result<(), PartnershipError> {
		let mut stored = self
			.partnerships
			.get_mut(&partnership.key())
			.ok_or_else(|| PartnershipError::NotFound {
				sender: partnership.sender_id.clone(),
				receiver: partnership.receiver_id.clone(),
			})?;

		for (key, value) in &partnership.attributes {
			if overwrite || !stored.attributes.contains_key(key) {
				stored.attributes.insert(key.clone(), value.clone());
			}
		}

		*partnership = stored.value().clone();
		Ok(())
	}
}

/// AS2 identities may be quoted on the wire when they contain spaces.
pub fn unquote_id(id: &str) -> String {
	let id = id.trim();

	match id.strip_prefix('"').and_then(|id| id.strip_suffix('"')) {
		Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
		None => id.to_string(),
	}
}

/// Quotes an identity for a header if it needs it
pub fn quote_id(id: &str) -> String {
	if id.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
		format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\""))
	} else {
		id.to_string()
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartnershipError {
	#[error("no partnership from '{sender}' to '{receiver}'")]
	NotFound { sender: String, receiver: String },
	#[error("message has no {0} header")]
	MissingHeader(&'static str),
}

#[cfg(test)]
mod test {
	use super::*;

	fn partnership() -> Partnership {
		Partnership::new("alice-bob", "alice", "bob")
			.with_attribute(SIGN, "sha-256")
			.with_attribute(SENDER_X509_ALIAS, "alice-key")
	}

	#[test]
	fn resolve_known_and_unknown() {
		let registry = PartnershipRegistry::new();
		registry.insert(partnership());

		assert_eq!(registry.resolve("alice", "bob").unwrap().name, "alice-bob");
		assert_eq!(
			registry.resolve("bob", "alice"),
			Err(PartnershipError::NotFound {
				sender: "bob".into(),
				receiver: "alice".into()
			})
		);
	}

	#[test]
	fn update_keeps_stored_values() {
		let registry = PartnershipRegistry::new();
		registry.insert(partnership());

		let mut inferred = Partnership::new("", "alice", "bob")
			.with_attribute(SIGN, "sha-512")
			.with_attribute(RECEIVER_X509_ALIAS, "bob-key");
		registry.update(&mut inferred, false).unwrap();

		assert_eq!(inferred.name, "alice-bob");
		assert_eq!(inferred.attribute(SIGN), Some("sha-256"));
		assert_eq!(inferred.attribute(RECEIVER_X509_ALIAS), Some("bob-key"));

		let stored = registry.resolve("alice", "bob").unwrap();
		assert_eq!(stored.attribute(RECEIVER_X509_ALIAS), Some("bob-key"));
	}

	#[test]
	fn update_with_overwrite() {
		let registry = PartnershipRegistry::new();
		registry.insert(partnership());

		let mut inferred = Partnership::new("", "alice", "bob").with_attribute(SIGN, "sha-512");
		registry.update(&mut inferred, true).unwrap();

		assert_eq!(
			registry.resolve("alice", "bob").unwrap().attribute(SIGN),
			Some("sha-512")
		);
		assert_eq!(inferred.attribute(SENDER_X509_ALIAS), Some("alice-key"));
	}

	#[test]
	fn update_unknown() {
		let registry = PartnershipRegistry::new();
		let mut inferred = Partnership::new("", "x", "y");

		assert!(registry.update(&mut inferred, false).is_err());
	}

	#[test]
	fn swap_moves_aliases() {
		let swapped = partnership().with_attribute(RECEIVER_X509_ALIAS, "bob-key").swapped();

		assert_eq!(swapped.sender_id, "bob");
		assert_eq!(swapped.receiver_id, "alice");
		assert_eq!(swapped.alias(PartnershipRole::Sender), "bob-key");
		assert_eq!(swapped.alias(PartnershipRole::Receiver), "alice-key");
		assert_eq!(swapped.attribute(SIGN), Some("sha-256"));
	}

	#[test]
	fn alias_defaults_to_id() {
		let partnership = Partnership::new("p", "alice", "bob");

		assert_eq!(partnership.alias(PartnershipRole::Sender), "alice");
		assert_eq!(partnership.alias(PartnershipRole::Receiver), "bob");
	}

	#[test]
	fn typed_attributes() {
		let partnership = partnership()
			.with_attribute(VERIFY_USE_CERT_IN_BODY_PART, "True")
			.with_attribute(ENCRYPT, "unknown-cipher")
			.with_attribute(CHUNKED, "true");

		assert_eq!(partnership.sign_algorithm().unwrap(), Some(SignAlgorithm::Sha256));
		assert!(partnership.encrypt_algorithm().is_err());
		assert_eq!(partnership.trust_embedded_certificate(), Some(true));
		assert!(partnership.is_chunked());
		assert_eq!(partnership.content_transfer_encoding(), "binary");
		assert_eq!(Partnership::default().trust_embedded_certificate(), None);
	}

	#[test]
	fn quoted_ids() {
		assert_eq!(unquote_id(" \"my company\" "), "my company");
		assert_eq!(unquote_id("plain"), "plain");
		assert_eq!(quote_id("my company"), "\"my company\"");
		assert_eq!(unquote_id(&quote_id("a \"b\"")), "a \"b\"");
		assert_eq!(quote_id("plain"), "plain");
	}
}
