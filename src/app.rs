//! Voice conversation application entry points.
//!
//! Builds the session from configuration once at startup and runs the
//! `chat`, `turn` and `speak` commands on top of it.

use crate::audio::frame::NormalizedAudio;
use crate::audio::ingest::AudioIngestNormalizer;
use crate::audio::playback::PlaybackSink;
use crate::audio::wav::write_wav_file;
use crate::config::Config;
use crate::conversation::orchestrator::{
    ConversationOrchestrator, OrchestratorConfig, PlaybackStatus, TurnOutcome,
};
use crate::error::{Result, TalkbackError};
use crate::gateway::command::CommandSynthesizer;
use crate::gateway::openai::{OpenAiReplier, OpenAiSpeech, OpenAiTranscriber};
use crate::gateway::synthesis::{SpeechSynthesizer, SynthesisGateway};
use crate::session::{SessionSettings, TurnResult, VoiceSession};
use crossbeam_channel::RecvTimeoutError;
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::runtime::Handle;

/// Synthesis tiers in order: the given primary voice, espeak-ng, `say`.
///
/// Local engines that are not installed are left out of the chain.
pub fn build_synthesizer(
    config: &Config,
    primary: Option<Arc<dyn SynthesisGateway>>,
) -> SpeechSynthesizer {
    let settings = &config.synthesis;
    let mut synthesizer = SpeechSynthesizer::new(config.audio.sample_rate)
        .with_max_chars(settings.max_chars)
        .with_speed(settings.speed);

    if let Some(primary) = primary {
        synthesizer.push_tier(primary, Duration::from_secs(settings.primary_timeout_secs));
    }

    let local_tiers = [
        (
            CommandSynthesizer::espeak(&settings.espeak_program, &settings.espeak_voice),
            settings.secondary_timeout_secs,
        ),
        (
            CommandSynthesizer::say(&settings.say_program),
            settings.tertiary_timeout_secs,
        ),
    ];
    for (engine, timeout_secs) in local_tiers {
        if engine.is_available() {
            let timeout = Duration::from_secs(timeout_secs);
            synthesizer.push_tier(Arc::new(engine.with_timeout(timeout)), timeout);
        } else {
            tracing::debug!(program = engine.program(), "synthesis engine not installed");
        }
    }

    tracing::debug!(tiers = ?synthesizer.tier_names(), "synthesis chain");
    synthesizer
}

#[cfg(feature = "cpal-audio")]
fn open_playback() -> Option<Arc<dyn PlaybackSink>> {
    match crate::audio::playback::CpalPlaybackSink::new() {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            tracing::warn!(error = %e, "no output device, replies will be text-only");
            None
        }
    }
}

#[cfg(not(feature = "cpal-audio"))]
fn open_playback() -> Option<Arc<dyn PlaybackSink>> {
    None
}

#[cfg(feature = "cpal-audio")]
fn attach_input(session: VoiceSession, config: &Config) -> VoiceSession {
    use crate::audio::capture::CpalAudioSource;
    use crate::audio::source::AudioDeviceSource;

    let device = config.audio.device.clone();
    let rate = config.audio.sample_rate;
    let frame_len = config.audio.frame_samples();
    session.with_source_factory(Box::new(move || {
        let source = CpalAudioSource::new(device.as_deref(), rate, frame_len)?;
        Ok(Box::new(source) as Box<dyn AudioDeviceSource>)
    }))
}

#[cfg(not(feature = "cpal-audio"))]
fn attach_input(session: VoiceSession, _config: &Config) -> VoiceSession {
    session
}

/// Wires every collaborator from `config`.
///
/// Fails on invalid configuration or a missing API credential; these are
/// the only errors that stop the program at startup.
pub fn build_session(config: &Config, handle: Handle) -> Result<VoiceSession> {
    config.validate()?;
    let api_key = Config::require_api_key()?;

    let transcriber =
        OpenAiTranscriber::new(&config.transcription, api_key.clone(), handle.clone())?;
    let replier = OpenAiReplier::new(&config.reply, api_key.clone(), handle.clone())?;
    let speech = OpenAiSpeech::new(&config.synthesis, api_key, handle)?;

    let mut orchestrator = ConversationOrchestrator::new(
        Arc::new(transcriber),
        Arc::new(replier),
        build_synthesizer(config, Some(Arc::new(speech))),
        OrchestratorConfig::from(config),
    );
    if config.audio.playback
        && let Some(sink) = open_playback()
    {
        orchestrator = orchestrator.with_playback(sink);
    }

    let normalizer = AudioIngestNormalizer::from_config(&config.ingest, config.audio.sample_rate);
    let session = VoiceSession::new(normalizer, orchestrator, SessionSettings::from(config))?;
    Ok(attach_input(session, config))
}

/// Prints one turn result for a person watching the terminal.
fn print_result(result: &TurnResult, quiet: bool) {
    match &result.outcome {
        TurnOutcome::NoInput | TurnOutcome::NoSpeech => {
            if !quiet {
                eprintln!("{}", "(no speech detected)".dimmed());
            }
        }
        TurnOutcome::Exit { user_text } => {
            println!("{} {}", "You:".cyan().bold(), user_text);
            if !quiet {
                eprintln!("Goodbye.");
            }
        }
        TurnOutcome::Completed(reply) => {
            println!("{} {}", "You:".cyan().bold(), reply.user_text);
            println!("{} {}", "Assistant:".green().bold(), reply.reply_text);
            if quiet {
                return;
            }
            if reply.degraded {
                eprintln!("{}", "  [no voice available, played a tone]".yellow());
            }
            if let PlaybackStatus::Failed(reason) = &reply.playback {
                eprintln!("{} {}", "  [playback failed]".yellow(), reason);
            }
        }
        TurnOutcome::Failed { stage, reason } => {
            eprintln!("{} {} ({})", "Turn failed:".red().bold(), reason, stage);
        }
    }
}

/// Live conversation until Ctrl+C, an exit phrase, or the input ends.
pub async fn run_chat(session: VoiceSession, quiet: bool) -> Result<()> {
    let handle = session.start_live_session()?;
    if !quiet {
        eprintln!("Listening... (say \"tạm biệt\" or press Ctrl+C to stop)");
    }

    let cancel = handle.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    tokio::task::spawn_blocking(move || {
        loop {
            match handle.results().recv_timeout(Duration::from_millis(200)) {
                Ok(result) => print_result(&result, quiet),
                Err(RecvTimeoutError::Timeout) if handle.is_running() => {}
                Err(_) => break,
            }
        }
        handle.stop();
        // keep the session (and its artifact directory) alive until the end
        drop(session);
    })
    .await
    .map_err(|e| TalkbackError::Other(format!("chat task failed: {e}")))?;

    Ok(())
}

/// One turn on a recorded file, optionally saving the spoken reply.
pub async fn run_turn(
    session: VoiceSession,
    file: PathBuf,
    format: Option<String>,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let bytes = tokio::fs::read(&file).await?;
    let declared = format.or_else(|| {
        file.file_name()
            .map(|name| name.to_string_lossy().into_owned())
    });

    let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
        let result = session.submit_uploaded_audio(&bytes, declared.as_deref())?;
        print_result(&result, quiet);
        if let (Some(output), Some(id)) = (output, result.artifact.as_ref()) {
            let wav = session.take_artifact(id)?;
            std::fs::write(&output, wav)?;
            if !quiet {
                eprintln!("Reply audio written to {}", output.display());
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| TalkbackError::Other(format!("turn task failed: {e}")))?;
    outcome
}

/// Speaks `text`, to the speakers or into a WAV file.
pub async fn run_speak(
    session: VoiceSession,
    text: String,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let outcome = tokio::task::spawn_blocking(move || -> Result<()> {
        let spoken = session.speak(&text);
        if !quiet {
            eprintln!("{} {}", "Voice:".dimmed(), spoken.provider);
        }
        match output {
            Some(path) => save(&path, &spoken.audio, quiet),
            None => session.play(&spoken.audio),
        }
    })
    .await
    .map_err(|e| TalkbackError::Other(format!("speak task failed: {e}")))?;
    outcome
}

fn save(path: &Path, audio: &NormalizedAudio, quiet: bool) -> Result<()> {
    write_wav_file(path, audio)?;
    if !quiet {
        eprintln!("Audio written to {}", path.display());
    }
    Ok(())
}
