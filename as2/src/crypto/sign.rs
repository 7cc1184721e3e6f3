use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer as _};

use super::{CryptoError, SignAlgorithm, SIGNATURE_TYPE};
use crate::{
	cert::{Certificate, PrivateKey},
	headers::{Headers, CONTENT_DISPOSITION, CONTENT_TRANSFER_ENCODING},
	mime::{self, MimePart},
};

const DIGEST_ALGORITHM: &str = "Digest-Algorithm";
const MESSAGE_DIGEST: &str = "Message-Digest";
const SIGNER: &str = "Signer";
const SIGNATURE: &str = "Signature";
const CERTIFICATE: &str = "Certificate";

/// What `verify` found in a signed entity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
	pub content: MimePart,
	/// The exact bytes the signature covers
	pub signed_bytes: Vec<u8>,
	pub algorithm: SignAlgorithm,
	pub used_embedded_certificate: bool,
}

/// The bytes a signature is computed over: headers, blank line and content,
/// with bare line feeds in text content turned into CRLF.
pub fn canonicalize(part: &MimePart) -> Vec<u8> {
	if !part.is_text() || part.transfer_encoding().map_or(false, |cte| cte.eq_ignore_ascii_case("base64")) {
		return part.to_bytes();
	}

	let mut canonical = part.clone();
	canonical.content = crlf_line_endings(&part.content);
	canonical.to_bytes()
}

fn crlf_line_endings(content: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(content.len() + content.len() / 32);
	let mut previous = 0;

	for &byte in content {
		if byte == b'\n' && previous != b'\r' {
			out.push(b'\r');
		}
		out.push(byte);
		previous = byte;
	}

	out
}

pub fn is_signed(part: &MimePart) -> bool {
	part.is_media_type("multipart/signed")
}

/// Wraps `part` in a `multipart/signed` entity with a detached signature.
pub fn sign(part: &MimePart, algorithm: SignAlgorithm, key: &PrivateKey, embed_certificate: bool) -> MimePart {
	let canonical = canonicalize(part);
	let digest = algorithm.digest(&canonical);
	let signature = key.signing_key.sign(&signed_data(algorithm, &digest));

	let mut block = Headers::new();
	block.set(DIGEST_ALGORITHM, algorithm.id());
	block.set(MESSAGE_DIGEST, STANDARD.encode(&digest));
	block.set(SIGNER, key.alias.as_str());
	block.set(SIGNATURE, STANDARD.encode(signature.to_bytes()));
	if embed_certificate {
		block.set(CERTIFICATE, key.certificate().encode());
	}

	let mut signature_part = MimePart::new(
		SIGNATURE_TYPE,
		mime::encode_base64_lines(block.to_string().as_bytes()),
	);
	signature_part.headers.set(CONTENT_TRANSFER_ENCODING, "base64");
	signature_part
		.headers
		.set(CONTENT_DISPOSITION, "attachment; filename=as2.sig");

	let boundary = mime::new_boundary();
	let content_type = format!(
		"multipart/signed; protocol=\"{}\"; micalg={}; boundary=\"{}\"",
		SIGNATURE_TYPE,
		algorithm.id(),
		boundary
	);

	MimePart::multipart(content_type, &boundary, &[canonical, signature_part.to_bytes()])
}

/// Checks a `multipart/signed` entity. The signature is checked against the
/// embedded certificate when `trust_embedded` is set and one is present,
/// otherwise against `certificate`.
pub fn verify(part: &MimePart, certificate: Option<&Certificate>, trust_embedded: bool) -> Result<Verified, CryptoError> {
	if !is_signed(part) {
		return Err(CryptoError::NotSigned);
	}

	if let Some(protocol) = part.content_type().and_then(|ct| mime::parameter(ct, "protocol")) {
		if !protocol.trim().eq_ignore_ascii_case(SIGNATURE_TYPE) {
			return Err(CryptoError::Unsupported(protocol));
		}
	}

	let raw = part.raw_parts()?;
	let (signed_bytes, signature_bytes) = match raw.as_slice() {
		[signed, signature, ..] => (*signed, *signature),
		_ => return Err(CryptoError::Malformed("signed entity needs two body parts")),
	};

	let content = MimePart::parse(signed_bytes)?;
	let signature_part = MimePart::parse(signature_bytes)?;
	let block = signature_part.decoded_content()?;
	let block: Headers = std::str::from_utf8(&block)
		.map_err(|_| CryptoError::Malformed("signature block is not text"))?
		.parse()
		.map_err(|_| CryptoError::Malformed("signature block is not a header block"))?;

	let algorithm: SignAlgorithm = match block.get(DIGEST_ALGORITHM) {
		Some(name) => name.parse()?,
		None => part
			.content_type()
			.and_then(|ct| mime::parameter(ct, "micalg"))
			.ok_or(CryptoError::Missing(DIGEST_ALGORITHM))?
			.parse()?,
	};

	let digest = algorithm.digest(signed_bytes);
	let claimed = decode_field(&block, MESSAGE_DIGEST)?;
	if claimed != digest {
		return Err(CryptoError::DigestMismatch);
	}

	let signature = Signature::from_slice(&decode_field(&block, SIGNATURE)?)
		.map_err(|_| CryptoError::Malformed("signature has the wrong length"))?;

	let embedded = match block.get(CERTIFICATE) {
		Some(encoded) if trust_embedded => Some(encoded.parse::<Certificate>()?),
		_ => None,
	};

	let (verifier, used_embedded_certificate) = match (&embedded, certificate) {
		(Some(embedded), _) => (embedded, true),
		(None, Some(certificate)) => (certificate, false),
		(None, None) => return Err(CryptoError::NoCertificate),
	};

	verifier
		.verifying_key
		.verify_strict(&signed_data(algorithm, &digest), &signature)
		.map_err(|_| CryptoError::BadSignature)?;

	Ok(Verified {
		content,
		signed_bytes: signed_bytes.to_vec(),
		algorithm,
		used_embedded_certificate,
	})
}

// Binds the algorithm into what gets signed so a digest can't be replayed
// under another algorithm name.
fn signed_data(algorithm: SignAlgorithm, digest: &[u8]) -> Vec<u8> {
	let mut data = b"as2-signature\0".to_vec();
	data.extend_from_slice(algorithm.id().as_bytes());
	data.push(0);
	data.extend_from_slice(digest);
	data
}

fn decode_field(block: &Headers, name: &'static str) -> Result<Vec<u8>, CryptoError> {
	let value = block.get(name).ok_or(CryptoError::Missing(name))?;
	STANDARD
		.decode(value.trim())
		.map_err(|_| CryptoError::Malformed("field is not base64"))
}
