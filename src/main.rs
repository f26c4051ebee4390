//! daqplay - audio playback through NI-DAQ analog outputs
//!
//! Runs the control server (default), or one of the offline tools:
//! metadata extraction, library scanning, and multi-track composition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use dp_daq::{DaqDriver, DeviceRegistry};
use dp_playback::Transport;
use dp_server::ControlServer;

const EXIT_OK: i32 = 0;
const EXIT_FILE_NOT_FOUND: i32 = 3;
const EXIT_UNSUPPORTED: i32 = 4;

#[derive(Parser)]
#[command(name = "daqplay", version, about = "Play audio files through NI-DAQ analog outputs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control server
    Serve {
        /// Control socket port
        #[arg(long, default_value_t = dp_core::DEFAULT_CONTROL_PORT)]
        port: u16,
    },
    /// Extract audio metadata and emit it as JSON
    Metadata {
        path: PathBuf,
        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compose a multi-track FLAC from a YAML playlist
    Compose {
        playlist: PathBuf,
        output: PathBuf,
    },
    /// Scan directories for audio files
    Scan {
        paths: Vec<String>,
        /// Directory recursion depth
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match cli.command {
        None => serve(dp_core::DEFAULT_CONTROL_PORT).await,
        Some(Command::Serve { port }) => serve(port).await,
        Some(Command::Metadata { path, output }) => run_metadata(&path, output.as_deref()),
        Some(Command::Compose { playlist, output }) => run_compose(&playlist, &output),
        Some(Command::Scan { paths, depth }) => run_scan(&paths, depth),
    };
    std::process::exit(code);
}

fn build_driver() -> Arc<dyn DaqDriver> {
    #[cfg(feature = "nidaqmx")]
    {
        Arc::new(dp_daq::nidaqmx::NidaqmxDriver::new())
    }
    #[cfg(not(feature = "nidaqmx"))]
    {
        log::warn!("Built without the nidaqmx feature; using the simulated device");
        Arc::new(dp_daq::SimDriver::new())
    }
}

async fn serve(port: u16) -> i32 {
    let registry = Arc::new(DeviceRegistry::new(build_driver()));
    if let Some(version) = registry.driver_version() {
        log::info!("DAQ driver: {}", version);
    }
    let transport = Arc::new(Transport::new(registry));

    let server = match ControlServer::bind(Arc::clone(&transport), port).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to bind control port {}: {}", port, e);
            return 1;
        }
    };

    let state = server.state();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
            let _ = state.shutdown.send(());
        }
    });

    match server.run().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Server error: {}", e);
            1
        }
    }
}

fn run_metadata(path: &Path, output: Option<&Path>) -> i32 {
    if !path.exists() {
        eprintln!("File not found: {}", path.display());
        return EXIT_FILE_NOT_FOUND;
    }

    let asset = match dp_library::extract_metadata(path) {
        Ok(asset) => asset,
        Err(e) => {
            eprintln!("Failed to extract metadata: {}", e);
            return EXIT_UNSUPPORTED;
        }
    };

    let json = match serde_json::to_string_pretty(&asset) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Failed to serialize metadata: {}", e);
            return 1;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, json) {
                eprintln!("Failed to write {}: {}", path.display(), e);
                return 1;
            }
        }
        None => println!("{}", json),
    }
    EXIT_OK
}

fn run_compose(playlist: &Path, output: &Path) -> i32 {
    if !playlist.exists() {
        eprintln!("Playlist not found: {}", playlist.display());
        return EXIT_FILE_NOT_FOUND;
    }

    match dp_library::compose_playlist(playlist, output) {
        Ok(info) => {
            println!(
                "Composed {} ({} chapters, {:.1}s @ {} Hz)",
                info.path.display(),
                info.chapters.len(),
                info.total_samples as f64 / f64::from(info.sample_rate_hz.max(1)),
                info.sample_rate_hz
            );
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Composition failed: {}", e);
            1
        }
    }
}

fn run_scan(paths: &[String], depth: usize) -> i32 {
    let found = dp_library::discover(paths, Some(depth));
    match serde_json::to_string_pretty(&found) {
        Ok(json) => {
            println!("{}", json);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Failed to serialize scan result: {}", e);
            1
        }
    }
}
