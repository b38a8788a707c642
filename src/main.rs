use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use talkback::app::{build_session, run_chat, run_speak, run_turn};
use talkback::cli::{Cli, Commands};
use talkback::config::Config;
use talkback::diagnostics::check_dependencies;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    #[cfg(feature = "cpal-audio")]
    talkback::audio::capture::suppress_audio_warnings();

    let config = apply_cli_overrides(load_config(cli.config.as_deref())?, &cli);

    match cli.command {
        None | Some(Commands::Chat) => {
            let session = build_session(&config, tokio::runtime::Handle::current())?;
            run_chat(session, cli.quiet).await?;
        }
        Some(Commands::Turn {
            file,
            format,
            output,
        }) => {
            let session = build_session(&config, tokio::runtime::Handle::current())?;
            run_turn(session, file, format, output, cli.quiet).await?;
        }
        Some(Commands::Speak { text, output }) => {
            let session = build_session(&config, tokio::runtime::Handle::current())?;
            run_speak(session, text, output, cli.quiet).await?;
        }
        Some(Commands::Devices) => {
            list_audio_devices()?;
        }
        Some(Commands::Check) => {
            check_dependencies(&config);
        }
    }

    Ok(())
}

/// Log level from -q/-v, unless RUST_LOG says otherwise.
fn init_logging(quiet: bool, verbose: u8) {
    let filter = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "warn,talkback=debug",
        (false, _) => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/talkback/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// Command-line flags win over the file and the environment.
fn apply_cli_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(language) = &cli.language {
        config.transcription.language = language.clone();
    }
    if let Some(device) = &cli.device {
        config.audio.device = Some(device.clone());
    }
    if cli.no_playback {
        config.audio.playback = false;
    }
    if let Some(max_ms) = cli.max_recording {
        config.segmenter.max_recording_ms = max_ms;
    }
    config
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = talkback::audio::capture::list_devices()?;

    if devices.is_empty() {
        eprintln!("{}", "No audio input devices found".red());
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

#[cfg(not(feature = "cpal-audio"))]
fn list_audio_devices() -> Result<()> {
    eprintln!("{}", "Built without audio device support (feature cpal-audio)".red());
    std::process::exit(1);
}
