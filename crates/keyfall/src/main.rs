use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyfall::{
    telemetry, web, AppState, CommandConverter, EngineSettings, EngineStatus, JobEngine,
    MidiStore,
};
use keyfallconf::{ConfigSources, KeyfallConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// Keyfall piano-roll backend
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of ./keyfall.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Write the bundled C-major sample file and exit
    CreateSample {
        /// Defaults to <midi_dir>/<sample_name>.mid
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = KeyfallConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.bind.http_port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, sources).await,
        Command::CreateSample { output } => create_sample(&config, output),
        Command::ShowConfig => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml());
            Ok(())
        }
    }
}

fn create_sample(config: &KeyfallConfig, output: Option<PathBuf>) -> Result<()> {
    let path = output.unwrap_or_else(|| {
        config
            .paths
            .midi_dir
            .join(format!("{}.mid", config.upload.sample_name))
    });

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, midi_notes::sample_file())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote sample MIDI file to {}", path.display());
    Ok(())
}

async fn serve(config: KeyfallConfig, sources: ConfigSources) -> Result<()> {
    let telemetry = telemetry::init(&config.telemetry).context("Failed to initialize telemetry")?;

    for file in &sources.files {
        tracing::info!("📄 Loaded config: {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        tracing::info!("   Env overrides: {}", sources.env_overrides.join(", "));
    }

    // --- Directories ---
    tracing::info!("📦 Preparing file store...");
    let store = MidiStore::from_config(&config.paths);
    store
        .ensure_dirs()
        .await
        .context("Failed to create MIDI and upload directories")?;
    tokio::fs::create_dir_all(&config.paths.scratch_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create scratch directory {}",
                config.paths.scratch_dir.display()
            )
        })?;
    store
        .ensure_sample(&config.upload.sample_name)
        .await
        .context("Failed to write sample MIDI file")?;
    tracing::info!("   MIDI files: {}", store.midi_dir().display());
    tracing::info!("   Uploads: {}", store.upload_dir().display());
    tracing::info!("   Scratch: {}", config.paths.scratch_dir.display());

    // --- Job Engine ---
    tracing::info!("⚙️  Initializing conversion engine...");
    let converter = Arc::new(CommandConverter::from_config(&config));
    let engine = JobEngine::new(
        converter,
        store.clone(),
        EngineSettings::from_config(&config),
    );
    match config.converter.timeout_secs {
        Some(secs) => tracing::info!(
            "   Converter: {} (timeout {}s)",
            config.converter.command,
            secs
        ),
        None => tracing::info!("   Converter: {} (no timeout)", config.converter.command),
    }

    let app = web::router(AppState::new(
        engine.clone(),
        store,
        config.upload.clone(),
    ));

    let addr = config.bind.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("🎹 Keyfall listening on http://{}", addr);
    tracing::info!("   Health: GET http://{}/api/health", addr);
    tracing::info!("   Files: GET http://{}/api/midi-files", addr);
    tracing::info!("   Upload: POST http://{}/api/upload", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let EngineStatus::Busy { job } = engine.status() {
        tracing::warn!(
            job.id = %job.id,
            job.original_filename = %job.original_filename,
            "Shutting down with a conversion still running"
        );
    }

    telemetry.shutdown();
    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to setup SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down gracefully..."),
    }
}
