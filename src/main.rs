//! voicelink binary: argument parsing, signal handling, statistics loop

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicelink::audio::device::log_available_devices;
use voicelink::config::{SessionConfig, TransportMode};
use voicelink::constants::DEFAULT_PORT;
use voicelink::session::Session;

/// Peer-to-peer voice calls over UDP
///
/// Two invocation styles:
///
///   voicelink <REMOTE_IP> <LOCAL_PORT> <REMOTE_PORT>   (P2P, recommended)
///   voicelink --server [PORT] | --client IP [PORT]     (classic)
///
/// Run the P2P form on both machines with the ports swapped:
///
///   machine A: voicelink 192.168.1.200 8888 9999
///   machine B: voicelink 192.168.1.100 9999 8888
#[derive(Parser, Debug)]
#[command(name = "voicelink", version, about, verbatim_doc_comment)]
struct Cli {
    /// Remote peer IP address (P2P mode)
    remote_ip: Option<IpAddr>,

    /// Local listening port (P2P mode)
    local_port: Option<u16>,

    /// Remote peer port (P2P mode)
    remote_port: Option<u16>,

    /// Run as server, listening on PORT
    #[arg(
        short = 's',
        long = "server",
        value_name = "PORT",
        num_args = 0..=1,
        default_missing_value = "8888",
        conflicts_with = "remote_ip"
    )]
    server: Option<u16>,

    /// Run as client: IP with an optional PORT
    #[arg(
        short = 'c',
        long = "client",
        value_names = ["IP", "PORT"],
        num_args = 1..=2,
        conflicts_with_all = ["remote_ip", "server"]
    )]
    client: Option<Vec<String>>,

    /// Audio device name
    #[arg(short = 'd', long = "device", default_value = "default")]
    device: String,
}

impl Cli {
    fn mode(&self) -> anyhow::Result<TransportMode> {
        if let Some(remote_ip) = self.remote_ip {
            let (Some(local_port), Some(remote_port)) = (self.local_port, self.remote_port) else {
                bail!("P2P mode needs <REMOTE_IP> <LOCAL_PORT> <REMOTE_PORT>");
            };
            return Ok(TransportMode::Peer {
                remote_ip,
                local_port,
                remote_port,
            });
        }

        if let Some(port) = self.server {
            return Ok(TransportMode::Listener { local_port: port });
        }

        if let Some(client) = &self.client {
            let ip: IpAddr = client[0]
                .parse()
                .with_context(|| format!("invalid IP address: {}", client[0]))?;
            let port: u16 = match client.get(1) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid port: {raw}"))?,
                None => DEFAULT_PORT,
            };
            // Client mode uses the same port on both ends.
            return Ok(TransportMode::Peer {
                remote_ip: ip,
                local_port: port,
                remote_port: port,
            });
        }

        bail!("select a mode: P2P positional arguments, --server or --client (see --help)");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mode = cli.mode()?;
    tracing::info!("starting voicelink");

    log_available_devices();

    if let TransportMode::Peer { remote_ip, .. } = &mode {
        probe_reachability(*remote_ip);
    }

    let mut config = SessionConfig::new(mode.clone());
    config.device = cli.device.clone();

    let mut session = Session::new(config).context("session setup failed")?;
    session.start().context("session start failed")?;

    match &mode {
        TransportMode::Peer {
            remote_ip,
            local_port,
            remote_port,
        } => {
            tracing::info!(
                listen = local_port,
                target = %format!("{remote_ip}:{remote_port}"),
                "P2P call ready; both sides pair automatically once talking"
            );
        }
        TransportMode::Listener { local_port } => {
            tracing::info!(port = local_port, "waiting for a caller");
        }
        TransportMode::Initiator { remote } => {
            tracing::info!(%remote, "calling");
        }
    }
    tracing::info!("voice call active, press Ctrl+C to hang up");

    let running = session.running_flag();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let mut ticks = 0u32;
    let mut device_failed = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, hanging up");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("termination requested, hanging up");
                break;
            }
            // Short sleeps keep shutdown responsive between stats reports.
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(err) = session.device_error() {
                    tracing::error!("audio device failed: {err}");
                    device_failed = true;
                    break;
                }
                ticks += 1;
                if ticks >= 50 {
                    ticks = 0;
                    log_stats(&session);
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    session.stop();

    if device_failed {
        bail!("call ended by audio device failure");
    }
    tracing::info!("call ended");
    Ok(())
}

fn log_stats(session: &Session) {
    let stats = session.stats();
    tracing::info!(
        tx_queued = stats.tx_queued,
        rx_queued = stats.rx_queued,
        dropped = stats.tx_dropped + stats.rx_dropped,
        "buffers"
    );
    tracing::info!(
        sent = stats.transport.sent,
        received = stats.transport.received,
        failed = stats.transport.failed_sends,
        malformed = stats.transport.malformed,
        "network"
    );
    tracing::info!(
        captured = stats.periods_captured,
        overruns = stats.capture_overruns,
        played = stats.periods_played,
        underruns = stats.playback_underruns,
        silence = stats.silence_periods,
        "audio"
    );
    tracing::info!(
        bitrate = stats.preprocess.current_bitrate,
        gain = stats.preprocess.current_gain,
        speech = stats.preprocess.speech_detected,
        encoded = stats.codec.encoded_frames,
        decoded = stats.codec.decoded_frames,
        "pipeline"
    );
}

/// Informational reachability probe; the call proceeds either way
fn probe_reachability(ip: IpAddr) {
    let status = std::process::Command::new("ping")
        .args(["-c", "1", "-W", "2", &ip.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    match status {
        Ok(code) if code.success() => tracing::info!(%ip, "peer reachable"),
        _ => tracing::warn!(%ip, "peer not answering ping, possibly a firewall"),
    }
}
