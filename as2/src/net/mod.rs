use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;
use tokio::{
	io::{AsyncWriteExt, BufReader},
	net::{TcpListener, TcpStream},
	sync::watch,
	time::{error::Elapsed, timeout},
};
use url::Url;

use crate::{
	config::Config,
	exchange::Session,
	headers::Headers,
	http::{read_response, HttpError, Request, Responder, Response},
};

/// Waits for new connections and hands each to its own task until the
/// shutdown channel fires.
pub async fn listen(listener: TcpListener, session: Arc<Session>, mut rx: watch::Receiver<bool>) {
	loop {
		let (stream, client) = tokio::select! {
			_ = rx.changed() => break,
			accepted = listener.accept() => match accepted {
				Ok(accepted) => accepted,
				Err(err) => {
					tracing::warn!("failed to accept a connection: {}", err);
					continue;
				}
			}
		};

		tracing::debug!(%client, "connection");
		tokio::spawn(serve(stream, client, session.clone()));
	}

	tracing::info!("listener stopped");
}

// One request, one response, then the connection is closed. An exchange that
// has started is allowed to finish even during shutdown.
async fn serve(stream: TcpStream, client: SocketAddr, session: Arc<Session>) {
	let (read, write) = stream.into_split();
	let mut reader = BufReader::new(read);
	let mut responder = Responder::new(write);

	match session.receive(&mut reader, &mut responder).await {
		Ok(outcome) => tracing::info!(
			%client,
			status = outcome.status,
			message_id = outcome.message_id.as_deref().unwrap_or_default(),
			"exchange complete"
		),
		Err(err) => tracing::warn!(
			%client,
			status = responder.sent().unwrap_or_default(),
			"exchange failed: {}",
			err
		),
	}

	let mut write = responder.into_inner();
	if let Err(err) = write.shutdown().await {
		tracing::trace!(%client, "shutdown: {}", err);
	}
}

/// Posts `body` to an `http` URL and reads the response.
pub async fn post(
	url: &str,
	mut headers: Headers,
	body: Vec<u8>,
	chunk_size: Option<usize>,
	config: &Config,
) -> Result<Response, ClientError> {
	let url = Url::parse(url)?;
	if url.scheme() != "http" {
		return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
	}

	let host = url.host_str().ok_or(ClientError::NoHost)?.to_string();
	let port = url.port_or_known_default().unwrap_or(80);

	let mut path = url.path().to_string();
	if let Some(query) = url.query() {
		path.push('?');
		path.push_str(query);
	}

	headers.set("Host", format!("{}:{}", host, port));
	headers.set("Connection", "close");
	headers.set("User-Agent", config.reporting_ua.as_str());

	let request = Request::new("POST", path, headers, body);

	let stream = timeout(config.connect_timeout, TcpStream::connect((host.as_str(), port))).await??;
	let (read, mut write) = stream.into_split();

	timeout(config.read_timeout, write.write_all(&request.as_bytes(chunk_size))).await??;

	let mut reader = BufReader::new(read);
	let response = timeout(config.read_timeout, read_response(&mut reader, config.max_body_size)).await??;

	tracing::debug!(url = url.as_str(), status = response.code, "posted");
	Ok(response)
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("invalid URL")]
	InvalidUrl(#[from] url::ParseError),
	#[error("unsupported URL scheme '{0}'")]
	UnsupportedScheme(String),
	#[error("URL has no host")]
	NoHost,
	#[error("timed out talking to the partner")]
	Timeout(#[from] Elapsed),
	#[error("there was an error connecting to the partner")]
	Connection(#[from] std::io::Error),
	#[error(transparent)]
	Http(#[from] HttpError),
}
