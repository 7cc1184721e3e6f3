use std::{collections::BTreeMap, fmt::Display};

use rand::{rngs::OsRng, thread_rng, Rng};
use time::{format_description::well_known::Rfc2822, macros::format_description, OffsetDateTime};

use crate::{
	config::Config,
	headers::{
		Headers, AS2_FROM, AS2_TO, DISPOSITION_NOTIFICATION_OPTIONS, DISPOSITION_NOTIFICATION_TO,
		MESSAGE_ID, RECEIPT_DELIVERY_OPTION,
	},
	mdn::Mdn,
	mime::MimePart,
	partnership::{unquote_id, Partnership},
};

pub const HTTP_REQUEST_TYPE: &str = "HTTP_REQUEST_TYPE";
pub const HTTP_REQUEST_URL: &str = "HTTP_REQUEST_URL";
pub const HTTP_REQUEST_VERSION: &str = "HTTP_REQUEST_VERSION";
pub const HTTP_ORIGINAL_CONTENT_TRANSFER_ENCODING: &str = "HTTP_ORIGINAL_CONTENT_TRANSFER_ENCODING";
pub const HTTP_ORIGINAL_CONTENT_LENGTH: &str = "HTTP_ORIGINAL_CONTENT_LENGTH";

/// An AS2 message, inbound or outbound.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
	pub headers: Headers,
	/// Bookkeeping that never goes on the wire
	pub attributes: BTreeMap<String, String>,
	pub data: Option<MimePart>,
	pub partnership: Partnership,
	pub mdn: Option<Mdn>,
}

impl Message {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn message_id(&self) -> Option<&str> {
		self.headers
			.get(MESSAGE_ID)
			.map(str::trim)
			.filter(|id| !id.is_empty())
	}

	pub fn set_message_id<S: Into<String>>(&mut self, id: S) {
		self.headers.set(MESSAGE_ID, id);
	}

	pub fn as2_from(&self) -> Option<String> {
		self.headers.get(AS2_FROM).map(unquote_id)
	}

	pub fn as2_to(&self) -> Option<String> {
		self.headers.get(AS2_TO).map(unquote_id)
	}

	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes.get(key).map(String::as_str)
	}

	pub fn set_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
		self.attributes.insert(key.into(), value.into());
	}

	/// The partner asked for a receipt of any kind
	pub fn requests_mdn(&self) -> bool {
		self.headers.contains(DISPOSITION_NOTIFICATION_TO)
	}

	/// Where the receipt should be posted, if it is asynchronous
	pub fn async_mdn_url(&self) -> Option<&str> {
		self.headers
			.get(RECEIPT_DELIVERY_OPTION)
			.map(str::trim)
			.filter(|url| !url.is_empty())
	}

	pub fn disposition_options(&self) -> DispositionOptions {
		self.headers
			.get(DISPOSITION_NOTIFICATION_OPTIONS)
			.map(DispositionOptions::parse)
			.unwrap_or_default()
	}

	pub fn context(&self) -> MessageContext {
		MessageContext {
			message_id: self.message_id().map(str::to_string),
			sender: self.partnership_id(true),
			receiver: self.partnership_id(false),
		}
	}

	fn partnership_id(&self, sender: bool) -> Option<String> {
		let (resolved, header) = if sender {
			(&self.partnership.sender_id, self.as2_from())
		} else {
			(&self.partnership.receiver_id, self.as2_to())
		};

		if resolved.is_empty() {
			header
		} else {
			Some(resolved.clone())
		}
	}
}

/// Which message an error or log line is about
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageContext {
	pub message_id: Option<String>,
	pub sender: Option<String>,
	pub receiver: Option<String>,
}

impl Display for MessageContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let unknown = "(unknown)";

		write!(
			f,
			"message {} from {} to {}",
			self.message_id.as_deref().unwrap_or(unknown),
			self.sender.as_deref().unwrap_or(unknown),
			self.receiver.as_deref().unwrap_or(unknown)
		)
	}
}

/// The parsed Disposition-Notification-Options header, for example
/// `signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=optional, sha-256`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispositionOptions {
	pub protocol: Option<String>,
	pub protocol_required: bool,
	pub micalg: Vec<String>,
	pub micalg_required: bool,
}

impl DispositionOptions {
	pub fn parse(value: &str) -> Self {
		let mut options = Self::default();

		for option in value.split(';') {
			let (name, rest) = match option.split_once('=') {
				Some(pair) => pair,
				None => continue,
			};

			let mut values = rest.split(',').map(|value| value.trim().to_ascii_lowercase());
			let required = values.next().map_or(false, |importance| importance == "required");
			let values: Vec<String> = values.filter(|value| !value.is_empty()).collect();

			match name.trim().to_ascii_lowercase().as_str() {
				"signed-receipt-protocol" => {
					options.protocol = values.into_iter().next();
					options.protocol_required = required;
				}
				"signed-receipt-micalg" => {
					options.micalg = values;
					options.micalg_required = required;
				}
				_ => (),
			}
		}

		options
	}

	pub fn wants_signed_receipt(&self) -> bool {
		self.protocol.is_some()
	}
}

/// Makes message ids of the form `<product-ddMMyyyyHHmmssZ-NNNN@left_right>`
#[derive(Clone, Debug)]
pub struct IdGenerator {
	product: String,
	secure_random: bool,
}

impl IdGenerator {
	pub fn new(config: &Config) -> Self {
		Self {
			product: config.product_name.clone(),
			secure_random: config.secure_random,
		}
	}

	pub fn generate(&self, left: &str, right: &str) -> String {
		let format = format_description!(
			"[day][month][year][hour][minute][second][offset_hour sign:mandatory][offset_minute]"
		);
		let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
		let stamp = now.format(&format).unwrap_or_default();

		let number: u16 = if self.secure_random {
			OsRng.gen_range(0..10000)
		} else {
			thread_rng().gen_range(0..10000)
		};

		format!(
			"<{}-{}-{:04}@{}_{}>",
			self.product,
			stamp,
			number,
			id_part(left),
			id_part(right)
		)
	}
}

// Ids go between angle brackets in a header value
fn id_part(id: &str) -> String {
	id.chars()
		.map(|c| match c {
			'<' | '>' | '@' | ' ' | '\t' | '"' => '_',
			c => c,
		})
		.collect()
}

/// The current time for a Date header
pub fn http_date() -> String {
	OffsetDateTime::now_utc().format(&Rfc2822).unwrap_or_default()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn id_format() {
		for secure_random in [true, false] {
			let config = Config {
				product_name: "prod".into(),
				secure_random,
				..Config::default()
			};
			let id = IdGenerator::new(&config).generate("bob", "alice");

			assert!(id.starts_with("<prod-"), "{}", id);
			assert!(id.ends_with("@bob_alice>"), "{}", id);

			let inner = &id[1..id.len() - 1];
			let (left, _) = inner.split_once('@').unwrap();
			let fields: Vec<&str> = left.split('-').collect();
			let random = fields.last().unwrap();
			assert_eq!(random.len(), 4);
			assert!(random.chars().all(|c| c.is_ascii_digit()));

			// ddMMyyyyHHmmss followed by a signed offset
			let stamp = left.strip_prefix("prod-").unwrap();
			assert!(stamp[..14].chars().all(|c| c.is_ascii_digit()), "{}", stamp);
			assert!(stamp[14..].starts_with('+') || stamp[14..].starts_with('-'));
		}
	}

	#[test]
	fn id_parts_are_cleaned() {
		let id = IdGenerator::new(&Config::default()).generate("my company", "x@y");
		assert!(id.ends_with("@my_company_x_y>"));
	}

	#[test]
	fn disposition_options() {
		let options = DispositionOptions::parse(
			"signed-receipt-protocol=optional, pkcs7-signature; signed-receipt-micalg=required, SHA-256, sha1",
		);

		assert_eq!(options.protocol.as_deref(), Some("pkcs7-signature"));
		assert!(!options.protocol_required);
		assert_eq!(options.micalg, vec!["sha-256", "sha1"]);
		assert!(options.micalg_required);
		assert!(options.wants_signed_receipt());

		assert!(!DispositionOptions::parse("").wants_signed_receipt());
	}

	#[test]
	fn headers_and_context() {
		let mut message = Message::new();
		message.headers.set(AS2_FROM, "\"alice co\"");
		message.headers.set(AS2_TO, "bob");
		message.headers.set(RECEIPT_DELIVERY_OPTION, "  ");
		message.set_message_id("<m1@x>");

		assert_eq!(message.as2_from().as_deref(), Some("alice co"));
		assert_eq!(message.async_mdn_url(), None);
		assert!(!message.requests_mdn());
		assert_eq!(
			message.context().to_string(),
			"message <m1@x> from alice co to bob"
		);

		message.partnership = Partnership::new("p", "alice", "bob");
		assert_eq!(message.context().sender.as_deref(), Some("alice"));
	}
}
