use std::{fmt::Display, str::FromStr};

use sha2::Digest;
use thiserror::Error;

/// Digest algorithms for signatures and MICs
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SignAlgorithm {
	Sha224,
	Sha256,
	Sha384,
	Sha512,
}

/// Content ciphers for enveloped data
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncryptAlgorithm {
	ChaCha20Poly1305,
	Aes256Gcm,
}

struct SignInfo {
	id: &'static str,
	legacy_id: &'static str,
	oid: &'static str,
	signature_name: &'static str,
}

struct EncryptInfo {
	id: &'static str,
	aliases: &'static [&'static str],
	oid: &'static str,
}

impl SignAlgorithm {
	pub const ALL: [SignAlgorithm; 4] = [Self::Sha224, Self::Sha256, Self::Sha384, Self::Sha512];

	fn info(self) -> SignInfo {
		match self {
			Self::Sha224 => SignInfo {
				id: "sha-224",
				legacy_id: "sha224",
				oid: "2.16.840.1.101.3.4.2.4",
				signature_name: "SHA224withEd25519",
			},
			Self::Sha256 => SignInfo {
				id: "sha-256",
				legacy_id: "sha256",
				oid: "2.16.840.1.101.3.4.2.1",
				signature_name: "SHA256withEd25519",
			},
			Self::Sha384 => SignInfo {
				id: "sha-384",
				legacy_id: "sha384",
				oid: "2.16.840.1.101.3.4.2.2",
				signature_name: "SHA384withEd25519",
			},
			Self::Sha512 => SignInfo {
				id: "sha-512",
				legacy_id: "sha512",
				oid: "2.16.840.1.101.3.4.2.3",
				signature_name: "SHA512withEd25519",
			},
		}
	}

	/// The `micalg` name, as used in MICs and Content-Type parameters
	pub fn id(self) -> &'static str {
		self.info().id
	}

	pub fn oid(self) -> &'static str {
		self.info().oid
	}

	pub fn signature_name(self) -> &'static str {
		self.info().signature_name
	}

	pub fn digest(self, data: &[u8]) -> Vec<u8> {
		match self {
			Self::Sha224 => sha2::Sha224::digest(data).to_vec(),
			Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
			Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
			Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
		}
	}
}

impl FromStr for SignAlgorithm {
	type Err = ParseAlgorithmError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let name = s.trim().to_ascii_lowercase();

		Self::ALL
			.into_iter()
			.find(|algorithm| {
				let info = algorithm.info();
				name == info.id || name == info.legacy_id
			})
			.ok_or(ParseAlgorithmError(name))
	}
}

impl Display for SignAlgorithm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.id())
	}
}

impl EncryptAlgorithm {
	pub const ALL: [EncryptAlgorithm; 2] = [Self::ChaCha20Poly1305, Self::Aes256Gcm];

	fn info(self) -> EncryptInfo {
		match self {
			Self::ChaCha20Poly1305 => EncryptInfo {
				id: "chacha20-poly1305",
				aliases: &["chacha20poly1305"],
				oid: "1.2.840.113549.1.9.16.3.18",
			},
			Self::Aes256Gcm => EncryptInfo {
				id: "aes256-gcm",
				aliases: &["aes-256-gcm", "aes256gcm"],
				oid: "2.16.840.1.101.3.4.1.46",
			},
		}
	}

	pub fn id(self) -> &'static str {
		self.info().id
	}

	pub fn oid(self) -> &'static str {
		self.info().oid
	}
}

impl FromStr for EncryptAlgorithm {
	type Err = ParseAlgorithmError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let name = s.trim().to_ascii_lowercase();

		Self::ALL
			.into_iter()
			.find(|algorithm| {
				let info = algorithm.info();
				name == info.id || info.aliases.contains(&name.as_str())
			})
			.ok_or(ParseAlgorithmError(name))
	}
}

impl Display for EncryptAlgorithm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.id())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported algorithm '{0}'")]
pub struct ParseAlgorithmError(pub String);

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parse_sign_algorithms() {
		assert_eq!("sha-256".parse(), Ok(SignAlgorithm::Sha256));
		assert_eq!(" SHA512 ".parse(), Ok(SignAlgorithm::Sha512));
		assert_eq!("sha-224".parse(), Ok(SignAlgorithm::Sha224));
		assert_eq!(
			"md5".parse::<SignAlgorithm>(),
			Err(ParseAlgorithmError("md5".into()))
		);

		for algorithm in SignAlgorithm::ALL {
			assert_eq!(algorithm.to_string().parse(), Ok(algorithm));
		}
	}

	#[test]
	fn digest_lengths() {
		assert_eq!(SignAlgorithm::Sha224.digest(b"x").len(), 28);
		assert_eq!(SignAlgorithm::Sha256.digest(b"x").len(), 32);
		assert_eq!(SignAlgorithm::Sha384.digest(b"x").len(), 48);
		assert_eq!(SignAlgorithm::Sha512.digest(b"x").len(), 64);
	}

	#[test]
	fn parse_encrypt_algorithms() {
		assert_eq!("AES-256-GCM".parse(), Ok(EncryptAlgorithm::Aes256Gcm));
		assert_eq!(
			"chacha20-poly1305".parse(),
			Ok(EncryptAlgorithm::ChaCha20Poly1305)
		);
		assert!("3des".parse::<EncryptAlgorithm>().is_err());
		assert_eq!(EncryptAlgorithm::Aes256Gcm.oid(), "2.16.840.1.101.3.4.1.46");
	}
}
