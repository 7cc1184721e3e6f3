use std::{path::PathBuf, time::Duration};

/// Settings shared by everything in a running exchange. Built once at startup
/// and handed to the components that need it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
	/// Leading part of every generated message id
	pub product_name: String,
	/// Value of the Reporting-UA field in generated MDNs
	pub reporting_ua: String,
	/// Draw message id randomness from the operating system instead of the
	/// thread local generator.
	pub secure_random: bool,
	/// Whether a certificate embedded in a signed body may be used to verify
	/// it. Partnerships can override this.
	pub trust_embedded_certificate: bool,
	/// Where inbound requests are dumped verbatim, if anywhere
	pub dump_dir: Option<PathBuf>,
	/// Request path that asynchronous MDNs are posted to
	pub async_mdn_path: String,
	/// Pending records older than this are removed by a sweep
	pub pending_max_age: Duration,
	/// Chunk size for outbound requests on chunked partnerships
	pub chunk_size: usize,
	/// Largest body accepted from a peer, declared or chunked
	pub max_body_size: usize,
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			product_name: "as2-rs".into(),
			reporting_ua: format!("as2-rs/{}", env!("CARGO_PKG_VERSION")),
			secure_random: true,
			trust_embedded_certificate: false,
			dump_dir: None,
			async_mdn_path: "/mdn".into(),
			pending_max_age: Duration::from_secs(60 * 60 * 24 * 7),
			chunk_size: 8192,
			max_body_size: 64 * 1024 * 1024,
			connect_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(60),
		}
	}
}

impl Config {
	pub fn is_async_mdn_path(&self, path: &str) -> bool {
		let path = path.split('?').next().unwrap_or_default();
		path.trim_end_matches('/') == self.async_mdn_path.trim_end_matches('/')
	}
}
