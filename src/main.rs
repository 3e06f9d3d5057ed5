use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camhub::config::AppConfig;
use camhub::events::EventBus;
use camhub::playback::control::{ControlApiClient, StreamReregistration};
use camhub::playback::flv::FlvConnection;
use camhub::playback::hls::HlsConnection;
use camhub::playback::mjpeg::MjpegConnection;
use camhub::playback::webrtc::WebRtcConnection;
use camhub::playback::{
    control::stream_key, ConnectionState, PlaybackProtocol, PlaybackSession, ReconnectPolicy,
    Reregister,
};
use camhub::proxy::RelayProxy;
use camhub::state::AppState;
use camhub::stream::StreamManager;
use camhub::utils::bind_tcp_listener;
use camhub::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// camhub command line arguments
#[derive(Parser, Debug)]
#[command(name = "camhub")]
#[command(version, about = "Multi-camera streaming hub", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the streaming hub server
    Serve(ServeArgs),
    /// Watch one camera headlessly through a playback protocol
    Watch(WatchArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Server base URL
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Camera identifier
    #[arg(long, value_name = "ID")]
    camera: String,

    /// Playback protocol (mjpeg, hls, flv, webrtc)
    #[arg(long, value_name = "PROTOCOL", default_value = "webrtc")]
    protocol: String,

    /// Camera RTSP source; enables registration and the re-registration
    /// escalation path
    #[arg(long, value_name = "URL")]
    rtsp_url: Option<String>,

    /// Direct camera snapshot URL (mjpeg only)
    #[arg(long, value_name = "URL")]
    snapshot_url: Option<String>,

    /// Relay HTTP-FLV egress base (flv only; overrides config)
    #[arg(long, value_name = "URL")]
    flv_url: Option<String>,

    /// Stream password sent on the WHEP path
    #[arg(long, value_name = "PASSWORD")]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let config = AppConfig::load(args.config.as_deref())?;

    match args.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(serve_args) => serve(config, serve_args).await,
        Command::Watch(watch_args) => watch(config, watch_args).await,
    }
}

async fn serve(mut config: AppConfig, args: ServeArgs) -> anyhow::Result<()> {
    tracing::info!("Starting camhub v{}", env!("CARGO_PKG_VERSION"));

    // Apply CLI argument overrides (only if explicitly specified)
    if let Some(address) = args.address {
        config.server.bind_address = address;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }

    let events = Arc::new(EventBus::new());
    let streams = StreamManager::new(&config, events.clone());
    let proxy = RelayProxy::new(&config.relay)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    tracing::info!(
        "Relay: hls={} whep={} ingest={}",
        config.relay.hls_url,
        config.relay.whep_url,
        config.relay.ingest_url
    );

    let ip: IpAddr = config
        .server
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.server.bind_address))?;
    let addr = SocketAddr::new(ip, config.server.http_port);

    let state = AppState::new(config, streams, proxy, events, shutdown_tx.clone());
    let app = web::create_router(state.clone());

    let listener = bind_tcp_listener(addr)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tracing::info!("Starting HTTP server on http://{}", addr);

    let shutdown_signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_signal_tx.send(());
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    state.streams.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn watch(config: AppConfig, args: WatchArgs) -> anyhow::Result<()> {
    let protocol: PlaybackProtocol = args.protocol.parse()?;
    let stream_id = stream_key(&args.camera);
    let server = args.server.trim_end_matches('/').to_string();

    let client = ControlApiClient::new(&server)?;

    // Register the stream up front when we know its source; the same pair
    // feeds the re-registration escalation path.
    let reregistrar: Option<Arc<dyn Reregister>> = match &args.rtsp_url {
        Some(rtsp_url) => {
            client.add(&stream_id, rtsp_url).await?;
            tracing::info!(stream = %stream_id, "Stream registered");
            Some(Arc::new(StreamReregistration::new(
                client.clone(),
                stream_id.clone(),
                rtsp_url.clone(),
            )))
        }
        None => None,
    };

    let policy = ReconnectPolicy::for_protocol(protocol);
    let password = args
        .password
        .or_else(|| config.server.whep_secret().map(|s| s.to_string()));

    let session = match protocol {
        PlaybackProtocol::Mjpeg => {
            let snapshot_url = args
                .snapshot_url
                .ok_or_else(|| anyhow::anyhow!("--snapshot-url is required for mjpeg"))?;
            // Not relay-mediated: no re-registration.
            PlaybackSession::spawn(
                args.camera.clone(),
                MjpegConnection::new(&snapshot_url)?,
                policy,
                None,
            )
        }
        PlaybackProtocol::Hls => {
            let manifest_url = format!("{server}/hls/{stream_id}/index.m3u8");
            PlaybackSession::spawn(
                args.camera.clone(),
                HlsConnection::new(&manifest_url)?,
                policy,
                reregistrar,
            )
        }
        PlaybackProtocol::Flv => {
            let base = args
                .flv_url
                .unwrap_or_else(|| config.relay.flv_url.clone());
            let flv_url = format!("{}/{stream_id}.flv", base.trim_end_matches('/'));
            PlaybackSession::spawn(
                args.camera.clone(),
                FlvConnection::new(&flv_url)?,
                policy,
                reregistrar,
            )
        }
        PlaybackProtocol::WebRtc => {
            let whep_url = format!("{server}/whep/{stream_id}");
            PlaybackSession::spawn(
                args.camera.clone(),
                WebRtcConnection::new(&whep_url, password)?,
                policy,
                reregistrar,
            )
        }
    };

    tracing::info!(
        camera = %args.camera,
        protocol = %protocol,
        "Watching; press Ctrl+C to stop"
    );

    let mut status_rx = session.subscribe();
    let mut last = session.status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow().clone();
                if status == last {
                    continue;
                }
                match status.state {
                    ConnectionState::Error if status.exhausted => {
                        tracing::warn!(
                            camera = %args.camera,
                            attempts = status.retry_count,
                            "Retries exhausted; restart the camera or press Ctrl+C"
                        );
                    }
                    ConnectionState::Error => {
                        tracing::warn!(
                            camera = %args.camera,
                            attempt = status.retry_count,
                            "Connecting / retrying"
                        );
                    }
                    state => {
                        tracing::info!(camera = %args.camera, state = %state, "Playback state");
                    }
                }
                last = status;
            }
        }
    }

    session.destroy().await;
    tracing::info!(camera = %args.camera, "Watch stopped");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camhub=error,tower_http=error",
        LogLevel::Warn => "camhub=warn,tower_http=warn",
        LogLevel::Info => "camhub=info,tower_http=info",
        LogLevel::Debug => "camhub=debug,tower_http=debug",
        LogLevel::Trace => "camhub=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
