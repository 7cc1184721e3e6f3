pub mod cert;
pub mod config;
pub mod crypto;
pub mod exchange;
pub mod headers;
pub mod http;
pub mod mdn;
pub mod message;
pub mod mime;
pub mod net;
pub mod partnership;
pub mod pending;
pub mod store;

pub use config::Config;
pub use headers::Headers;
pub use message::Message;
pub use mime::MimePart;
pub use partnership::{Partnership, PartnershipRegistry};
