use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
mod state;

use spanview_protocol::messages::TouchEvent;
use spanview_protocol::types::{APP_VERSION, EncodedFrame};
use spanview_session::discovery::{bind_responder, run_responder, ResponderInfo};
use spanview_session::transport::{configure_stream, SessionStream};
use spanview_session::{accept_session, tls, SessionEvent};

use config::HostConfig;
use state::{EncoderCommand, HostState};

#[derive(Parser)]
#[command(name = "spanview-host", about = "spanview extended-display host service")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port for session connections, overrides config
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP port for discovery, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    bind: Option<String>,

    /// Advertised server name, overrides config
    #[arg(long)]
    name: Option<String>,

    /// Disable TLS for WiFi sessions
    #[arg(long)]
    no_tls: bool,

    /// Require the pairing code at handshake time
    #[arg(long)]
    require_pairing: bool,

    /// Directory for the certificate and key, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spanview=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path.display()))?;
        toml::from_str(&content)?
    } else {
        HostConfig::default()
    };

    if let Some(port) = args.tcp_port {
        config.session.listen_tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.session.listen_udp_port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(name) = args.name {
        config.server_name = name;
    }
    if args.no_tls {
        config.session.tls_enabled = false;
    }
    if args.require_pairing {
        config.session.require_pairing_code = true;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }

    info!(version = APP_VERSION, "spanview host starting");
    info!(
        bind = %config.bind,
        tcp_port = config.session.listen_tcp_port,
        udp_port = config.session.listen_udp_port,
        tls = config.session.tls_enabled,
        require_pairing = config.session.require_pairing_code,
        server_name = %config.server_name,
    );

    // The certificate is the identity even when TLS is off: the pairing
    // code is derived from it.
    let identity = tls::load_or_generate(&config.data_dir())?;
    let pairing_code = identity.pairing_code();
    info!(fingerprint = %identity.fingerprint(), "session certificate ready");
    info!("pairing code: {pairing_code}");

    let tls_acceptor = if config.session.tls_enabled {
        Some(TlsAcceptor::from(tls::server_config(identity)?))
    } else {
        None
    };
    let expected_pairing =
        config.session.require_pairing_code.then(|| pairing_code.clone());

    let state = Arc::new(HostState::new());
    let cancel = CancellationToken::new();

    // Seams to the out-of-process pipelines: encoded frames come in from
    // the capture/encoder side, touch events and encoder commands go out
    // to the injection and encoder sides.
    let (frame_tx, mut frame_rx) = mpsc::channel::<EncodedFrame>(8);
    let (touch_tx, mut touch_rx) = mpsc::channel::<TouchEvent>(256);
    let (encoder_tx, mut encoder_rx) = mpsc::channel::<EncoderCommand>(32);
    let _frame_tx = frame_tx; // held so the pump below outlives an idle encoder

    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                state.broadcast_frame(frame);
            }
        });
    }
    tokio::spawn(async move {
        // Input injection is external; surface what would be injected.
        while let Some(touch) = touch_rx.recv().await {
            debug!(action = ?touch.action, x = touch.x, y = touch.y, "touch event received");
        }
    });
    tokio::spawn(async move {
        while let Some(command) = encoder_rx.recv().await {
            debug!(?command, "encoder command");
        }
    });

    // Discovery responder.
    let bind_ip: Ipv4Addr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let responder_socket = bind_responder(bind_ip, config.session.listen_udp_port)
        .with_context(|| {
            format!("failed to bind discovery on {}:{}", config.bind, config.session.listen_udp_port)
        })?;
    let responder_info = ResponderInfo {
        server_id: state.server_id.clone(),
        server_name: config.server_name.clone(),
        tcp_port: config.session.listen_tcp_port,
        server_version: APP_VERSION.to_string(),
    };
    tokio::spawn(run_responder(responder_socket, responder_info, cancel.clone()));

    // Session listener.
    let listener =
        TcpListener::bind((config.bind.as_str(), config.session.listen_tcp_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind TCP on {}:{}",
                    config.bind, config.session.listen_tcp_port
                )
            })?;
    info!("host ready, accepting connections");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        error!("TCP accept error: {e}");
                        continue;
                    }
                };

                let tls_acceptor = tls_acceptor.clone();
                let state = state.clone();
                let session_config = config.session.clone();
                let expected_pairing = expected_pairing.clone();
                let touch_tx = touch_tx.clone();
                let encoder_tx = encoder_tx.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    info!(peer = %peer_addr, "new connection");
                    handle_connection(
                        tcp_stream,
                        tls_acceptor,
                        state,
                        session_config,
                        expected_pairing,
                        touch_tx,
                        encoder_tx,
                        cancel,
                    )
                    .await;
                });
            }
        }
    }

    cancel.cancel();
    state.shutdown_all().await;
    info!("host stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    tcp_stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    state: Arc<HostState>,
    session_config: spanview_session::SessionConfig,
    expected_pairing: Option<String>,
    touch_tx: mpsc::Sender<TouchEvent>,
    encoder_tx: mpsc::Sender<EncoderCommand>,
    cancel: CancellationToken,
) {
    if let Err(e) = configure_stream(&tcp_stream) {
        warn!("failed to configure socket: {e}");
    }

    let stream = match &tls_acceptor {
        Some(acceptor) => match acceptor.accept(tcp_stream).await {
            Ok(tls_stream) => SessionStream::ServerTls(Box::new(tls_stream)),
            Err(e) => {
                warn!("TLS handshake failed: {e}");
                return;
            }
        },
        None => SessionStream::Plain(tcp_stream),
    };

    let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(256);
    let accepted =
        match accept_session(stream, session_config, expected_pairing, events_tx).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("session not established: {e}");
                return;
            }
        };

    let handle = Arc::new(accepted.handle);
    state.register(handle.clone());
    drive_session(handle.clone(), events_rx, touch_tx, encoder_tx, cancel).await;
    state.remove(handle.session_id());
}

/// Pump one session's events into the host-wide channels until it closes.
async fn drive_session(
    handle: Arc<spanview_session::SessionHandle>,
    mut events: mpsc::Receiver<SessionEvent>,
    touch_tx: mpsc::Sender<TouchEvent>,
    encoder_tx: mpsc::Sender<EncoderCommand>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                handle.disconnect().await;
                break;
            }
            event = events.recv() => {
                match event {
                    None => break,
                    Some(SessionEvent::Touch(touch)) => {
                        if touch_tx.send(touch).await.is_err() {
                            debug!("touch sink gone, dropping event");
                        }
                    }
                    Some(SessionEvent::KeyFrameRequested(reason)) => {
                        info!(?reason, "key frame requested");
                        let _ = encoder_tx.send(EncoderCommand::KeyFrame).await;
                    }
                    Some(SessionEvent::BitrateTarget(target_bps)) => {
                        let _ = encoder_tx.send(EncoderCommand::TargetBitrate(target_bps)).await;
                    }
                    Some(SessionEvent::Closed { error }) => {
                        match error {
                            Some(error) => warn!(session_id = handle.session_id(), %error, "session closed"),
                            None => info!(session_id = handle.session_id(), "session closed"),
                        }
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }
    handle.join().await;
}
