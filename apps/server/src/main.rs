//! DabCast Server - DAB+ streaming server and MPD cast bridge.
//!
//! This binary wires the two subsystems into one process: the DAB tuner
//! side (radio controller, scanner, HTTP streaming) and the MPD-to-cast
//! mirror. Either side may be disabled by flag or by a missing
//! prerequisite (no tuner hardware, unreadable MPD config); the process
//! only refuses to start when both are unavailable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dabcast_core::cast::{CastFinder, CastSessionConnector, ImageCache, MpdCaster, MpdConfig};
use dabcast_core::device::TunerDevice;
use dabcast_core::radio::{DabScanner, RadioController};
use dabcast_core::{bind_server, AppState, AudioCodec, NetworkContext};
use tokio::signal;

/// Where the web UI and the cast receiver page are installed.
const DEFAULT_WEB_ROOT: &str = "/usr/share/dabcast";

/// MPD Cast Device Agent.
#[derive(Parser, Debug)]
#[command(name = "dabcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Communication port to use.
    #[arg(short, long, default_value_t = 8864, env = "DABCAST_PORT")]
    port: u16,

    /// MPD config file to use.
    #[arg(short, long, default_value = "/etc/mpd.conf", env = "DABCAST_MPD_CONF")]
    conf: PathBuf,

    /// Disable DAB server functionality.
    #[arg(long)]
    disable_dabserver: bool,

    /// Disable MPD Cast functionality.
    #[arg(long)]
    disable_mpdcast: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    log::info!("DabCast Server v{}", env!("CARGO_PKG_VERSION"));

    let network = NetworkContext::auto_detect(args.port)
        .context("Could not retrieve local IP address")?;

    let dab = prepare_dab(&args);
    let cast = prepare_cast(&args, &network);

    if dab.is_none() && cast.is_none() {
        bail!("Both MpdCast and DAB processing failed to initialize. Exiting.");
    }

    let (radio, scanner, device) = match dab {
        Some((radio, scanner, device)) => (Some(radio), Some(scanner), Some(device)),
        None => (None, None, None),
    };
    let (caster, image_cache) = match cast {
        Some((caster, image_cache)) => (Some(caster), Some(image_cache)),
        None => (None, None),
    };

    let codec = AudioCodec::for_decode_setting(true);
    let state = AppState::new(
        radio.clone(),
        scanner.clone(),
        image_cache,
        network,
        codec,
        PathBuf::from(DEFAULT_WEB_ROOT),
    );

    // A port that cannot be bound is a bootstrap failure; after this point
    // every subsystem failure is drained individually instead.
    let server = bind_server(state.clone())
        .await
        .context("Could not set up web server")?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            log::error!("Server error: {}", e);
        }
    });

    if let Some(caster) = &caster {
        caster.start();
    }

    log::info!("Successfully initialized DabCast");
    shutdown_signal().await;
    log::info!("Stopping DabCast as requested");

    // Wind down: refuse new audio clients, stop the cast mirror, then the
    // radio and scanner, close the device, and abort the HTTP server last.
    state.begin_shutdown();
    if let Some(caster) = &caster {
        caster.stop().await;
    }
    if let Some(radio) = &radio {
        radio.stop().await;
    }
    if let Some(scanner) = &scanner {
        scanner.stop().await;
    }
    drop(device);
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Internal components log at info when verbose; the chatty dependencies
/// stay one level quieter either way.
fn init_logging(verbose: bool) {
    let (internal, external) = if verbose {
        (log::LevelFilter::Info, log::LevelFilter::Warn)
    } else {
        (log::LevelFilter::Warn, log::LevelFilter::Error)
    };
    env_logger::Builder::new()
        .filter_level(internal)
        .filter_module("mdns_sd", external)
        .filter_module("rust_cast", external)
        .filter_module("tower_http", external)
        .filter_module("reqwest", external)
        .format_timestamp_millis()
        .init();
}

type DabParts = (
    Arc<RadioController>,
    Arc<DabScanner>,
    Arc<dyn TunerDevice>,
);

fn prepare_dab(args: &Args) -> Option<DabParts> {
    if args.disable_dabserver {
        log::warn!("Disabling DAB server functionality");
        return None;
    }
    let Some(device) = open_tuner() else {
        log::warn!("No DAB device available. DAB server will be disabled.");
        return None;
    };
    let radio = RadioController::new(Arc::clone(&device));
    let scanner = DabScanner::new(Arc::clone(&device));
    Some((radio, scanner, device))
}

#[cfg(feature = "welle")]
fn open_tuner() -> Option<Arc<dyn TunerDevice>> {
    dabcast_core::device::WelleDevice::open("auto", -1, true)
        .map(|device| device as Arc<dyn TunerDevice>)
}

#[cfg(not(feature = "welle"))]
fn open_tuner() -> Option<Arc<dyn TunerDevice>> {
    log::warn!("Built without DAB driver support (welle feature disabled)");
    None
}

fn prepare_cast(args: &Args, network: &NetworkContext) -> Option<(Arc<MpdCaster>, Arc<ImageCache>)> {
    if args.disable_mpdcast {
        log::warn!("Disabling MPD cast functionality");
        return None;
    }
    let config = match MpdConfig::load(&args.conf) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Failed to read MPD Cast configuration. Disabling.");
            log::warn!("{}", e);
            return None;
        }
    };

    let image_cache = Arc::new(ImageCache::new(network.clone()));
    let finder = Arc::new(CastFinder::new(&config.device_name));
    let connector = Arc::new(CastSessionConnector::new(
        network.url_builder().cast_receiver_url(),
    ));
    let caster = MpdCaster::new(
        config,
        network.clone(),
        Arc::clone(&image_cache),
        finder,
        connector,
    );
    Some((caster, image_cache))
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
