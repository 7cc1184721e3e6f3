use std::{
	collections::BTreeMap,
	net::{IpAddr, SocketAddr},
	path::{Path, PathBuf},
	time::Duration,
};

use as2::{
	cert::{CertError, Certificate, KeyStore, PrivateKey},
	Partnership, PartnershipRegistry,
};
use getopts::Options;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONFIG: &str = "/etc/as2d/as2d.toml";

/// The TOML file as written
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
	pub server: ServerSection,
	pub exchange: ExchangeSection,
	pub directories: DirectorySection,
	#[serde(rename = "key")]
	pub keys: Vec<KeySection>,
	#[serde(rename = "partnership")]
	pub partnerships: Vec<PartnershipSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
	pub listen_address: Option<String>,
	pub port: Option<u16>,
	/// A tracing filter directive, overridden by RUST_LOG
	pub log: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeSection {
	pub product_name: Option<String>,
	pub reporting_ua: Option<String>,
	pub secure_random: Option<bool>,
	pub trust_embedded_certificate: Option<bool>,
	pub async_mdn_path: Option<String>,
	pub pending_max_age_secs: Option<u64>,
	pub sweep_interval_secs: Option<u64>,
	pub chunk_size: Option<usize>,
	pub max_body_size: Option<usize>,
	pub connect_timeout_secs: Option<u64>,
	pub read_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectorySection {
	pub pending: Option<PathBuf>,
	pub payloads: Option<PathBuf>,
	pub store: Option<PathBuf>,
	pub dump: Option<PathBuf>,
}

/// Either our own key, from a base64 seed, or a partner's certificate
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeySection {
	pub alias: String,
	pub seed: Option<String>,
	pub certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartnershipSection {
	pub name: String,
	pub sender: String,
	pub receiver: String,
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
}

impl FileConfig {
	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(text)?)
	}

	pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
			path: path.as_ref().to_path_buf(),
			source: err,
		})?;
		Self::parse(&text)
	}

	/// The library configuration, defaults filled in
	pub fn exchange(&self) -> as2::Config {
		let section = &self.exchange;
		let default = as2::Config::default();

		as2::Config {
			product_name: section.product_name.clone().unwrap_or(default.product_name),
			reporting_ua: section.reporting_ua.clone().unwrap_or(default.reporting_ua),
			secure_random: section.secure_random.unwrap_or(default.secure_random),
			trust_embedded_certificate: section
				.trust_embedded_certificate
				.unwrap_or(default.trust_embedded_certificate),
			dump_dir: self.directories.dump.clone(),
			async_mdn_path: section.async_mdn_path.clone().unwrap_or(default.async_mdn_path),
			pending_max_age: section
				.pending_max_age_secs
				.map(Duration::from_secs)
				.unwrap_or(default.pending_max_age),
			chunk_size: section.chunk_size.unwrap_or(default.chunk_size),
			max_body_size: section.max_body_size.unwrap_or(default.max_body_size),
			connect_timeout: section
				.connect_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.connect_timeout),
			read_timeout: section
				.read_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.read_timeout),
		}
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.exchange.sweep_interval_secs.unwrap_or(60 * 60))
	}

	pub fn key_store(&self) -> Result<KeyStore, ConfigError> {
		let store = KeyStore::new();

		for key in &self.keys {
			match (&key.seed, &key.certificate) {
				(Some(seed), None) => {
					store.insert_private_key(PrivateKey::from_base64_seed(key.alias.as_str(), seed)?)
				}
				(None, Some(certificate)) => {
					let mut certificate: Certificate = certificate.parse()?;
					certificate.alias = key.alias.clone();
					store.insert_certificate(certificate);
				}
				_ => return Err(ConfigError::Key(key.alias.clone())),
			}
		}

		Ok(store)
	}

	pub fn registry(&self) -> PartnershipRegistry {
		let registry = PartnershipRegistry::new();

		for section in &self.partnerships {
			let mut partnership = Partnership::new(
				section.name.as_str(),
				section.sender.as_str(),
				section.receiver.as_str(),
			);
			for (key, value) in &section.attributes {
				partnership.set_attribute(key.as_str(), value.as_str());
			}

			if let Some(replaced) = registry.insert(partnership) {
				tracing::warn!(
					partnership = replaced.name.as_str(),
					"partnership replaced by a later one for the same sender and receiver"
				);
			}
		}

		registry
	}
}

/// What the daemon was asked to do on the command line
pub enum Mode {
	Serve,
	Send { file: PathBuf, from: String, to: String },
}

pub struct BinConfig {
	pub address: IpAddr,
	pub port: u16,
	pub log: String,
	pub mode: Mode,
	pub file: FileConfig,
}

impl BinConfig {
	fn print_usage<S: AsRef<str>>(prgm: S, opts: &Options) {
		let brief = format!("Usage: {} [options]", prgm.as_ref());
		println!("{}", opts.usage(&brief));
	}

	pub fn socket_address(&self) -> SocketAddr {
		SocketAddr::new(self.address, self.port)
	}

	fn options() -> Options {
		let mut opts = Options::new();
		opts.optflag("h", "help", "Print this help message");
		opts.optopt(
			"l",
			"listen-address",
			"The IP address as2d will listen for incoming connections on\nDefault: 127.0.0.1",
			"IP_ADDR",
		);
		opts.optopt("p", "port", "The port as2d will listen on\nDefault: 4080", "PORT");
		opts.optopt(
			"c",
			"config",
			"An alternate location to read the config from\nDefault: /etc/as2d/as2d.toml",
			"PATH",
		);
		opts.optopt(
			"s",
			"send",
			"Send FILE to a partner and exit instead of listening",
			"FILE",
		);
		opts.optopt("", "from", "Our AS2 id when sending", "AS2_ID");
		opts.optopt("", "to", "The partner's AS2 id when sending", "AS2_ID");
		opts
	}

	/// Reads the command line and the config file. `None` means there is
	/// nothing to run, either because help was printed or because of an
	/// error that was already reported.
	pub fn get() -> Option<Self> {
		let args: Vec<String> = std::env::args().collect();
		let program = args.first().cloned().unwrap_or_else(|| "as2d".into());

		match Self::from_args(args.get(1..).unwrap_or_default()) {
			Ok(Some(config)) => Some(config),
			Ok(None) => {
				Self::print_usage(program, &Self::options());
				None
			}
			Err(err) => {
				eprintln!("{}", err);
				None
			}
		}
	}

	/// `Ok(None)` when help was asked for
	pub fn from_args(args: &[String]) -> Result<Option<Self>, ConfigError> {
		let matches = Self::options().parse(args)?;
		if matches.opt_present("help") {
			return Ok(None);
		}

		let file = match matches.opt_str("config") {
			Some(path) => FileConfig::from_file(path)?,
			None if Path::new(DEFAULT_CONFIG).exists() => FileConfig::from_file(DEFAULT_CONFIG)?,
			None => FileConfig::default(),
		};

		// Options on the command line take priority over the file
		let find_value = |cli_key: &str| -> Option<String> {
			matches.opt_str(cli_key).or_else(|| match cli_key {
				"listen-address" => file.server.listen_address.clone(),
				"port" => file.server.port.map(|port| port.to_string()),
				_ => None,
			})
		};

		let address_string = find_value("listen-address").unwrap_or_else(|| "127.0.0.1".into());
		let address = address_string
			.parse()
			.map_err(|_| ConfigError::Value("IP address", address_string))?;

		let port_string = find_value("port").unwrap_or_else(|| "4080".into());
		let port = port_string
			.parse()
			.map_err(|_| ConfigError::Value("port", port_string))?;

		let mode = match matches.opt_str("send") {
			Some(file) => Mode::Send {
				file: file.into(),
				from: matches.opt_str("from").ok_or(ConfigError::Missing("--from"))?,
				to: matches.opt_str("to").ok_or(ConfigError::Missing("--to"))?,
			},
			None => Mode::Serve,
		};

		let log = file.server.log.clone().unwrap_or_else(|| "info".into());

		Ok(Some(Self {
			address,
			port,
			log,
			mode,
			file,
		}))
	}
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read '{path}'")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config file: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("{0}")]
	Options(#[from] getopts::Fail),
	#[error("failed to parse '{1}' as a {0}")]
	Value(&'static str, String),
	#[error("{0} is required when sending")]
	Missing(&'static str),
	#[error("key '{0}' needs exactly one of seed or certificate")]
	Key(String),
	#[error(transparent)]
	Cert(#[from] CertError),
}
