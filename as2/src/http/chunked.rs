use tokio::io::{AsyncRead, AsyncReadExt};

use super::{request::read_sized, HttpError};

/// Reads a chunked body. Each chunk starts with its hex length on a line of
/// its own; anything on that line that is not a hex digit is skipped, so chunk
/// extensions are tolerated. A zero length chunk ends the body. The chunks
/// together may not exceed `limit` bytes.
pub async fn decode_chunked<R: AsyncRead + Unpin>(reader: &mut R, limit: usize) -> Result<Vec<u8>, HttpError> {
	let mut body = vec![];

	loop {
		let mut length: usize = 0;

		loop {
			let byte = reader.read_u8().await?;
			let digit = match byte {
				b'\n' => break,
				b'0'..=b'9' => byte - b'0',
				b'a'..=b'f' => byte - b'a' + 10,
				b'A'..=b'F' => byte - b'A' + 10,
				_ => continue,
			};

			length = length
				.checked_mul(16)
				.and_then(|length| length.checked_add(digit as usize))
				.ok_or_else(|| HttpError::protocol("chunk length overflows"))?;
		}

		if length == 0 {
			break;
		}

		let remaining = limit.saturating_sub(body.len());
		if length > remaining {
			return Err(HttpError::protocol(format!(
				"chunked body exceeds the {} byte limit",
				limit
			)));
		}
		body.extend_from_slice(&read_sized(reader, length, remaining).await?);

		// CRLF after the chunk data
		while reader.read_u8().await? != b'\n' {}
	}

	Ok(body)
}

pub fn encode_chunked(data: &[u8], chunk_size: usize) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len() + 32);

	for chunk in data.chunks(chunk_size.max(1)) {
		out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
		out.extend_from_slice(chunk);
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(b"0\r\n\r\n");

	out
}

#[cfg(test)]
mod test {
	use super::*;

	const LIMIT: usize = 1 << 20;

	#[tokio::test]
	async fn round_trip() {
		let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();

		for size in [1, 7, 16, 1000, 5000, 9000] {
			let encoded = encode_chunked(&data, size);
			let decoded = decode_chunked(&mut &encoded[..], LIMIT).await.unwrap();

			assert_eq!(decoded, data, "chunk size {}", size);
		}
	}

	#[tokio::test]
	async fn empty_body() {
		let encoded = encode_chunked(b"", 10);
		assert_eq!(encoded, b"0\r\n\r\n");

		assert!(decode_chunked(&mut &encoded[..], LIMIT).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn extensions_and_case() {
		let raw = b"A;name=x\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n";
		// hex letters inside the extension count as digits, giving 0xaae
		let decoded = decode_chunked(&mut &raw[..], LIMIT).await;
		assert!(decoded.is_err());

		let raw = b"A\r\n0123456789\r\n3\r\nabc\r\n0\r\n\r\n";
		let decoded = decode_chunked(&mut &raw[..], LIMIT).await.unwrap();
		assert_eq!(decoded, b"0123456789abc");
	}

	#[tokio::test]
	async fn truncated_chunk() {
		let raw = b"10\r\nshort";
		assert!(matches!(
			decode_chunked(&mut &raw[..], LIMIT).await,
			Err(HttpError::Io(_))
		));
	}

	#[tokio::test]
	async fn oversized_chunks() {
		let raw = b"ffffffffffffffff\r\nabc\r\n0\r\n\r\n";
		assert!(matches!(
			decode_chunked(&mut &raw[..], LIMIT).await,
			Err(HttpError::Protocol(_))
		));

		// each chunk fits, the total does not
		let encoded = encode_chunked(&[7; 100], 40);
		assert!(matches!(
			decode_chunked(&mut &encoded[..], 90).await,
			Err(HttpError::Protocol(_))
		));
		assert_eq!(decode_chunked(&mut &encoded[..], 100).await.unwrap().len(), 100);
	}
}
