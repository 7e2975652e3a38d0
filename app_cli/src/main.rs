//! visd: streams sound analysis of played audio to visualization clients

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use network::{ServerConfig, VisualizationServer};
use settings_manager::{ConfigManager, Settings};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vis_core::AudioFormat;

mod player;

use player::{PcmSource, Player, Tone};

/// How long to wait for the producer thread on shutdown
const PRODUCER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// visd - sound visualization server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    /// Config file [default: <config dir>/visd/config.toml]
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[clap(long)]
    bind: Option<String>,

    /// Port to listen on
    #[clap(short, long)]
    port: Option<u16>,

    /// Most clients served at once (0 for no limit)
    #[clap(long)]
    max_clients: Option<usize>,

    /// Raw interleaved PCM to play, or '-' for stdin
    #[clap(short, long, conflicts_with = "tone")]
    input: Option<PathBuf>,

    /// Play a sine tone of this frequency in Hz
    #[clap(short, long)]
    tone: Option<f32>,

    /// Format of the played audio, as rate:bits:channels
    #[clap(short, long)]
    format: Option<AudioFormat>,
}

/// Command-line flags take precedence over the config file
fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(bind) = &args.bind {
        settings.bind_to_address = bind.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        settings.max_clients = max_clients;
    }
    if let Some(format) = args.format {
        settings.audio_format = format;
    }
}

fn open_source(args: &Args, format: AudioFormat) -> Result<Option<PcmSource>> {
    if let Some(frequency) = args.tone {
        if frequency.is_nan() || frequency <= 0.0 {
            return Err(anyhow!("Tone frequency must be positive, got {}", frequency));
        }
        return Ok(Some(PcmSource::Tone(Tone::new(frequency, format.sample_rate))));
    }

    match &args.input {
        None => Ok(None),
        Some(path) if path.as_os_str() == "-" => Ok(Some(PcmSource::Reader(Box::new(io::stdin())))),
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("Failed to open PCM input {:?}", path))?;
            Ok(Some(PcmSource::Reader(Box::new(BufReader::new(file)))))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging based on debug flag
    if args.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
        debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("Starting visd");

    let config = match &args.config {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(),
    };
    let mut config = config.map_err(|e| anyhow!("Failed to load config: {}", e))?;
    apply_overrides(config.settings_mut(), &args);
    let settings = config.settings().clone();

    let params = settings.analysis_parameters()?;
    let addr = settings.listen_address()?;
    let source = open_source(&args, settings.audio_format)?;

    let server = VisualizationServer::bind(
        addr,
        params,
        ServerConfig {
            max_clients: settings.max_clients,
            reap_interval: settings.reap_interval(),
        },
    )
    .await?;
    let handle = server
        .handle()
        .context("Visualization server handed out no handle")?;
    let server_task = tokio::spawn(server.run());

    let stop = Arc::new(AtomicBool::new(false));
    let producer = match source {
        Some(source) => {
            info!("Playing {} into the visualization output", settings.audio_format);
            let player = Player::new(
                handle.clone(),
                settings.audio_format,
                settings.cache_duration(),
                Arc::clone(&stop),
            );
            Some(player.spawn(source)?)
        }
        None => {
            info!("No audio source given; clients will wait for audio");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");

    stop.store(true, Ordering::Release);
    if let Some(producer) = producer {
        // Joined off the runtime thread: closing the output needs the server
        let joined = tokio::time::timeout(
            PRODUCER_JOIN_TIMEOUT,
            tokio::task::spawn_blocking(move || producer.join()),
        )
        .await;
        match joined {
            Ok(Ok(Ok(Ok(())))) => debug!("PCM producer finished"),
            Ok(Ok(Ok(Err(e)))) => warn!("PCM producer failed: {}", e),
            Ok(Ok(Err(_))) => error!("PCM producer panicked"),
            Ok(Err(e)) => error!("Failed to join PCM producer: {}", e),
            Err(_) => warn!("PCM producer still blocked on input; not waiting for it"),
        }
    }

    handle.shutdown().await?;
    server_task.await??;

    info!("Exiting visd");
    Ok(())
}
