mod config;

use std::{path::Path, sync::Arc};

use as2::{
	exchange::Session,
	pending::PendingDirectory,
	store::DirectoryStore,
	MimePart,
};
use config::{BinConfig, Mode};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
	let binconf = match BinConfig::get() {
		Some(conf) => conf,
		None => return,
	};

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&binconf.log));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let session = match build_session(&binconf) {
		Ok(session) => Arc::new(session),
		Err(err) => {
			tracing::error!("{}", err);
			std::process::exit(1);
		}
	};

	match &binconf.mode {
		Mode::Send { file, from, to } => {
			if let Err(err) = send_file(&session, file, from, to).await {
				tracing::error!("{}", err);
				std::process::exit(1);
			}
		}
		Mode::Serve => serve(&binconf, session).await,
	}
}

fn build_session(binconf: &BinConfig) -> Result<Session, Box<dyn std::error::Error>> {
	let file = &binconf.file;
	let config = Arc::new(file.exchange());

	let certs = file.key_store()?;
	let registry = file.registry();
	tracing::info!(
		keys = certs.aliases().len(),
		partnerships = registry.len(),
		"loaded configuration"
	);

	let pending_dir = file
		.directories
		.pending
		.clone()
		.unwrap_or_else(|| "pending".into());
	let payload_dir = file
		.directories
		.payloads
		.clone()
		.unwrap_or_else(|| pending_dir.join("payloads"));
	let pending = PendingDirectory::open(pending_dir, payload_dir)?;

	let session = Session::new(config, Arc::new(registry), Arc::new(certs), Arc::new(pending));

	Ok(match &file.directories.store {
		Some(root) => session.with_store(Arc::new(DirectoryStore::open(root)?)),
		None => session,
	})
}

async fn send_file(session: &Session, file: &Path, from: &str, to: &str) -> Result<(), Box<dyn std::error::Error>> {
	let content = tokio::fs::read(file).await?;
	let payload = MimePart::new("application/octet-stream", content);

	let message = session.build_message(from, to, payload)?;
	let outcome = session.send(message).await?;

	println!("{} {:?} {}", outcome.message_id, outcome.state, outcome.mic);
	if let Some(warning) = outcome.disposition_warning {
		println!("warning: {}", warning);
	}

	Ok(())
}

async fn serve(binconf: &BinConfig, session: Arc<Session>) {
	let listener = match TcpListener::bind(binconf.socket_address()).await {
		Ok(listener) => listener,
		Err(err) => {
			tracing::error!(address = %binconf.socket_address(), "failed to listen: {}", err);
			std::process::exit(1);
		}
	};
	tracing::info!(address = %binconf.socket_address(), "listening");

	let (tx, rx) = watch::channel(false);

	let listen_task = tokio::spawn(as2::net::listen(listener, session.clone(), rx.clone()));
	let sweep_task = tokio::spawn(sweep(session, binconf.file.sweep_interval(), rx));
	let signal_listener = tokio::spawn(async {
		use tokio::signal::unix::{signal, SignalKind};

		let (mut hangup, mut terminate, mut quit) = match (
			signal(SignalKind::hangup()),
			signal(SignalKind::terminate()),
			signal(SignalKind::quit()),
		) {
			(Ok(hangup), Ok(terminate), Ok(quit)) => (hangup, terminate, quit),
			_ => {
				tracing::warn!("failed to install signal handlers, only ctrl-c stops the daemon");
				let _ = tokio::signal::ctrl_c().await;
				return;
			}
		};

		tokio::select! {
			_ = tokio::signal::ctrl_c() => (),
			_ = hangup.recv() => (),
			_ = terminate.recv() => (),
			_ = quit.recv() => (),
		};
	});

	#[allow(unused_must_use)]
	{
		signal_listener.await;
		tracing::info!("received shutdown signal, beginning graceful shutdown");
		tx.send(true);
		tokio::join!(listen_task, sweep_task);
	}
}

// Pending records whose MDN never arrived are dropped once they are too old
async fn sweep(session: Arc<Session>, every: std::time::Duration, mut rx: watch::Receiver<bool>) {
	let mut interval = tokio::time::interval(every);

	loop {
		tokio::select! {
			_ = rx.changed() => break,
			_ = interval.tick() => {
				if let Err(err) = session.sweep_pending() {
					tracing::error!("pending sweep failed: {}", err);
				}
			}
		}
	}
}
