//! millctl — interactive mill control over a bounce-server relay.
//!
//! ```text
//! millctl                     Connect with defaults
//! millctl --config <path>     Use custom config TOML
//! millctl --host <addr>       Override the relay host
//! millctl --gen-config        Dump default config and exit
//! ```

mod config;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use millctl_core::{
    Axis, ClientOptions, ControlClient, DEFAULT_PING_INTERVAL, ReconnectPolicy,
    ReconnectStatus, ReconnectSupervisor, VideoClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::CliConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "millctl", about = "Remote mill control client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "millctl.toml")]
    config: PathBuf,

    /// Relay host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Relay port (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Tunnel through an HTTP proxy (overrides config).
    #[arg(long)]
    proxy: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&CliConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = CliConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.relay.host = host;
    }
    if let Some(port) = cli.port {
        config.relay.port = port;
    }
    if cli.proxy {
        config.proxy.enabled = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("millctl v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Build the control client ─────────────────────────────

    let mut options = ClientOptions::new(config.relay.host.clone(), config.relay.port, None)
        .with_auth_token(Some(config.relay.auth_token.clone()))
        .with_tls(config.relay.use_tls)
        .with_proxy(config.proxy.enabled)
        .with_connect_timeout(Duration::from_millis(config.relay.timeout_ms))
        .with_name("control");
    if config.proxy.enabled && config.proxy.internal_port != 0 {
        options = options.with_internal_port(config.proxy.internal_port);
    }
    let control = ControlClient::with_options(options.clone(), DEFAULT_PING_INTERVAL);

    let supervisor = config.reconnect.auto.then(|| {
        ReconnectSupervisor::spawn(
            control.connection(),
            ReconnectPolicy {
                base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
            },
        )
    });

    // ── 2. Optionally open the video channel ────────────────────

    let video = config.video.enabled.then(|| {
        let video = VideoClient::with_options(options.clone().with_name("video"));
        if let Some(mut frames) = video.take_frames() {
            // Drain frames so the stream keeps flowing; a real viewer
            // would decode these.
            tokio::spawn(async move { while frames.recv().await.is_some() {} });
        }
        video
    });

    // ── 3. Connect ──────────────────────────────────────────────

    if let Err(e) = control.connect().await {
        error!("control connect failed: {e}");
    }
    if let Some(video) = &video {
        if let Err(e) = video.connect().await {
            error!("video connect failed: {e}");
        }
    }

    // ── 4. Command loop ─────────────────────────────────────────

    println!("commands: stop | jog <+n|-n> | speed <1-24> | axis <x|y|z|a>");
    println!("          status | rate | connect | disconnect | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };

        let outcome = match (cmd, parts.next()) {
            ("stop", _) => control.stop_mill().await,
            ("jog", Some(arg)) => match arg.parse::<i32>() {
                Ok(step) => control.jog_mill(step).await,
                Err(_) => {
                    println!("jog wants a signed integer, e.g. `jog -1`");
                    continue;
                }
            },
            ("speed", Some(arg)) => match arg.parse::<u8>() {
                Ok(speed) => control.set_speed(speed).await,
                Err(_) => {
                    println!("speed wants a number 1-24");
                    continue;
                }
            },
            ("axis", Some(arg)) => match arg.parse::<Axis>() {
                Ok(axis) => control.set_axis(axis).await,
                Err(e) => {
                    println!("{e}");
                    continue;
                }
            },
            ("status", _) => {
                print_status(&control, supervisor.as_ref());
                continue;
            }
            ("rate", _) => {
                match &video {
                    Some(video) => println!(
                        "video: {} bit/s ({} bytes total)",
                        video.bitrate_bps(),
                        video.bytes_received()
                    ),
                    None => println!("video channel not enabled"),
                }
                continue;
            }
            ("connect", _) => control.connect().await,
            ("disconnect", _) => {
                if let Some(supervisor) = &supervisor {
                    supervisor.cancel_episode();
                }
                control.disconnect().await
            }
            ("quit", _) | ("exit", _) => break,
            _ => {
                println!("unknown command: {cmd}");
                continue;
            }
        };

        if let Err(e) = outcome {
            println!("error: {e}");
        }
    }

    // ── 5. Shutdown ─────────────────────────────────────────────

    if let Some(supervisor) = &supervisor {
        supervisor.shutdown();
    }
    if let Some(video) = &video {
        let _ = video.disconnect().await;
    }
    let _ = control.disconnect().await;
    info!("bye");
    Ok(())
}

fn print_status(control: &ControlClient, supervisor: Option<&ReconnectSupervisor>) {
    let ready = control.is_connection_ready();
    let accessible = control.is_mill_accessible();
    let state = control.mill_state();
    println!(
        "connection: {} | mill: {}",
        if ready { "ready" } else { "down" },
        if accessible { "responding" } else { "silent" }
    );
    println!(
        "axis: {} | speed: {}",
        state
            .axis
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".into()),
        state
            .speed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    if let Some(supervisor) = supervisor {
        if let ReconnectStatus::Trying {
            try_count,
            next_delay,
        } = supervisor.status()
        {
            println!("reconnecting: attempt {try_count}, next delay {next_delay:?}");
        }
    }
}
