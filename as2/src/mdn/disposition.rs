use std::{fmt::Display, str::FromStr};

use pest::Parser;
use pest_derive::*;
use thiserror::Error;

#[derive(Parser)]
#[grammar = "mdn/disposition.pest"]
struct DispositionParser;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionMode {
	Automatic,
	Manual,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendingMode {
	Automatic,
	Manual,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
	Processed,
	Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modifier {
	Error,
	Warning,
	Other(String),
}

/// The Disposition field of an MDN, e.g.
/// `automatic-action/MDN-sent-automatically; processed/error: decryption-failed`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disposition {
	pub action_mode: ActionMode,
	pub sending_mode: SendingMode,
	pub status: Status,
	pub modifier: Option<Modifier>,
	pub description: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
	Warning,
	Fatal,
}

impl Display for Severity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Severity::Warning => write!(f, "warning"),
			Severity::Fatal => write!(f, "fatal"),
		}
	}
}

impl Disposition {
	fn automatic(status: Status, modifier: Option<Modifier>, description: Option<String>) -> Self {
		Self {
			action_mode: ActionMode::Automatic,
			sending_mode: SendingMode::Automatic,
			status,
			modifier,
			description,
		}
	}

	pub fn processed() -> Self {
		Self::automatic(Status::Processed, None, None)
	}

	pub fn error<S: Into<String>>(description: S) -> Self {
		Self::automatic(Status::Processed, Some(Modifier::Error), Some(description.into()))
	}

	pub fn warning<S: Into<String>>(description: S) -> Self {
		Self::automatic(Status::Processed, Some(Modifier::Warning), Some(description.into()))
	}

	pub fn failed<S: Into<String>>(description: S) -> Self {
		Self::automatic(
			Status::Failed,
			Some(Modifier::Other("failure".into())),
			Some(description.into()),
		)
	}

	/// Ok for a clean `processed`. A warning modifier is not fatal and the
	/// caller may carry on after logging it; everything else is.
	pub fn validate(&self) -> Result<(), DispositionError> {
		let severity = match (&self.status, &self.modifier) {
			(Status::Failed, _) => Severity::Fatal,
			(Status::Processed, None) => return Ok(()),
			(Status::Processed, Some(Modifier::Warning)) => Severity::Warning,
			(Status::Processed, Some(_)) => Severity::Fatal,
		};

		Err(DispositionError {
			severity,
			disposition: self.to_string(),
		})
	}
}

impl FromStr for Disposition {
	type Err = ParseDispositionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let invalid = || ParseDispositionError::Invalid(s.to_string());

		let disposition = DispositionParser::parse(Rule::disposition, s)
			.map_err(|_| invalid())?
			.next()
			.ok_or_else(invalid)?;

		let mut action_mode = None;
		let mut sending_mode = None;
		let mut status = None;
		let mut modifier = None;
		let mut description = None;

		for pair in disposition.into_inner() {
			let text = pair.as_str().trim();

			match pair.as_rule() {
				Rule::action_mode => {
					action_mode = Some(match text.to_ascii_lowercase().as_str() {
						"automatic-action" => ActionMode::Automatic,
						"manual-action" => ActionMode::Manual,
						_ => return Err(ParseDispositionError::Field("action mode", text.into())),
					})
				}
				Rule::sending_mode => {
					sending_mode = Some(match text.to_ascii_lowercase().as_str() {
						"mdn-sent-automatically" => SendingMode::Automatic,
						"mdn-sent-manually" => SendingMode::Manual,
						_ => return Err(ParseDispositionError::Field("sending mode", text.into())),
					})
				}
				Rule::status => {
					status = Some(match text.to_ascii_lowercase().as_str() {
						"processed" => Status::Processed,
						"failed" => Status::Failed,
						_ => return Err(ParseDispositionError::Field("status", text.into())),
					})
				}
				Rule::modifier => {
					modifier = Some(match text.to_ascii_lowercase().as_str() {
						"error" => Modifier::Error,
						"warning" => Modifier::Warning,
						_ => Modifier::Other(text.to_string()),
					})
				}
				Rule::description => {
					if !text.is_empty() {
						description = Some(text.to_string());
					}
				}
				_ => (),
			}
		}

		Ok(Self {
			action_mode: action_mode.ok_or_else(invalid)?,
			sending_mode: sending_mode.ok_or_else(invalid)?,
			status: status.ok_or_else(invalid)?,
			modifier,
			description,
		})
	}
}

impl Display for Disposition {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let action = match self.action_mode {
			ActionMode::Automatic => "automatic-action",
			ActionMode::Manual => "manual-action",
		};
		let sending = match self.sending_mode {
			SendingMode::Automatic => "MDN-sent-automatically",
			SendingMode::Manual => "MDN-sent-manually",
		};
		let status = match self.status {
			Status::Processed => "processed",
			Status::Failed => "failed",
		};

		write!(f, "{}/{}; {}", action, sending, status)?;

		if let Some(modifier) = &self.modifier {
			match modifier {
				Modifier::Error => write!(f, "/error")?,
				Modifier::Warning => write!(f, "/warning")?,
				Modifier::Other(other) => write!(f, "/{}", other)?,
			}

			if let Some(description) = &self.description {
				write!(f, ": {}", description)?;
			}
		}

		Ok(())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("disposition '{disposition}' is {severity}")]
pub struct DispositionError {
	pub severity: Severity,
	pub disposition: String,
}

impl DispositionError {
	pub fn is_fatal(&self) -> bool {
		self.severity == Severity::Fatal
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDispositionError {
	#[error("'{0}' is not a disposition")]
	Invalid(String),
	#[error("unknown {0} '{1}'")]
	Field(&'static str, String),
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parse_processed() {
		let disposition: Disposition = "automatic-action/MDN-sent-automatically; processed"
			.parse()
			.unwrap();

		assert_eq!(disposition, Disposition::processed());
		assert_eq!(disposition.validate(), Ok(()));
	}

	#[test]
	fn parse_with_modifier() {
		let disposition: Disposition =
			"Automatic-Action / mdn-sent-automatically ;processed/Error: decryption-failed: bad key"
				.parse()
				.unwrap();

		assert_eq!(disposition.modifier, Some(Modifier::Error));
		assert_eq!(
			disposition.description.as_deref(),
			Some("decryption-failed: bad key")
		);
	}

	#[test]
	fn display_parses_back() {
		for disposition in [
			Disposition::processed(),
			Disposition::error("integrity-check-failed"),
			Disposition::warning("duplicate-document"),
			Disposition::failed("unsupported format"),
		] {
			assert_eq!(disposition.to_string().parse(), Ok(disposition));
		}

		assert_eq!(
			Disposition::error("authentication-failed").to_string(),
			"automatic-action/MDN-sent-automatically; processed/error: authentication-failed"
		);
	}

	#[test]
	fn severity() {
		let warning = Disposition::warning("w").validate().unwrap_err();
		assert_eq!(warning.severity, Severity::Warning);
		assert!(!warning.is_fatal());

		assert!(Disposition::error("e").validate().unwrap_err().is_fatal());
		assert!(Disposition::failed("f").validate().unwrap_err().is_fatal());

		let mut failed_warning = Disposition::warning("w");
		failed_warning.status = Status::Failed;
		assert!(failed_warning.validate().unwrap_err().is_fatal());

		let mut other = Disposition::processed();
		other.modifier = Some(Modifier::Other("x-custom".into()));
		assert!(other.validate().unwrap_err().is_fatal());
	}

	#[test]
	fn invalid() {
		assert!("processed".parse::<Disposition>().is_err());
		assert!("automatic-action; processed".parse::<Disposition>().is_err());
		assert_eq!(
			"sideways-action/MDN-sent-automatically; processed".parse::<Disposition>(),
			Err(ParseDispositionError::Field(
				"action mode",
				"sideways-action".into()
			))
		);
	}
}
