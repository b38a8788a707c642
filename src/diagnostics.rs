//! System diagnostics and dependency checking.
//!
//! Reports which decode and synthesis tiers can run on this machine and
//! whether the API credential is present.

use crate::config::Config;
use crate::defaults;
use crate::gateway::command::find_program;
use std::process::Command;

/// Result of a dependency check.
#[derive(Debug, PartialEq)]
pub enum CheckResult {
    /// Tool is installed and working
    Ok,
    /// Tool is not found
    NotFound,
    /// Tool is found but has issues
    Warning(String),
}

/// Check if a command exists and answers `version_flag`.
fn check_command(command: &str, version_flag: &str) -> CheckResult {
    if find_program(command).is_none() {
        return CheckResult::NotFound;
    }
    match Command::new(command).arg(version_flag).output() {
        Ok(output) if output.status.success() => CheckResult::Ok,
        Ok(_) => CheckResult::Warning(format!("'{command}' found but {version_flag} failed")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckResult::NotFound,
        Err(e) => CheckResult::Warning(format!("Error checking '{command}': {e}")),
    }
}

/// `say` has no version flag; being on PATH is all we can check.
fn check_say(command: &str) -> CheckResult {
    if find_program(command).is_some() {
        CheckResult::Ok
    } else {
        CheckResult::NotFound
    }
}

fn check_api_key() -> CheckResult {
    match Config::api_key() {
        Some(_) => CheckResult::Ok,
        None => CheckResult::NotFound,
    }
}

fn report(label: &str, result: &CheckResult, missing_hint: &str) -> bool {
    print!("{label}: ");
    match result {
        CheckResult::Ok => {
            println!("✓ OK");
            true
        }
        CheckResult::NotFound => {
            println!("✗ NOT FOUND");
            if !missing_hint.is_empty() {
                println!("  {missing_hint}");
            }
            false
        }
        CheckResult::Warning(msg) => {
            println!("⚠ WARNING: {msg}");
            false
        }
    }
}

/// Run all dependency checks and print results.
pub fn check_dependencies(config: &Config) {
    println!("talkback {}", crate::version_string());
    println!("Checking system dependencies...\n");

    let key_ok = report(
        &format!("{} (transcription, replies, primary voice)", defaults::API_KEY_ENV),
        &check_api_key(),
        &format!("export {}=...", defaults::API_KEY_ENV),
    );

    let ffmpeg_ok = report(
        "ffmpeg (upload decoding)",
        &check_command(&config.ingest.ffmpeg, "-version"),
        "Install: sudo apt install ffmpeg  (only wav and mp3 uploads work without it)",
    );

    let espeak_ok = report(
        "espeak-ng (secondary voice)",
        &check_command(&config.synthesis.espeak_program, "--version"),
        "Install: sudo apt install espeak-ng",
    );

    let say_ok = report(
        "say (tertiary voice)",
        &check_say(&config.synthesis.say_program),
        "",
    );

    println!();
    if !key_ok {
        println!("✗ Conversations need {}.", defaults::API_KEY_ENV);
    }
    if !ffmpeg_ok {
        println!("⚠ Uploads other than WAV and MP3 will be rejected.");
    }
    if !espeak_ok && !say_ok {
        println!("⚠ Without a local voice, failed replies are spoken as a tone.");
    }
    if key_ok && ffmpeg_ok && (espeak_ok || say_ok) {
        println!("✓ Ready.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_command_is_not_found() {
        assert_eq!(
            check_command("talkback-no-such-tool-12345", "--version"),
            CheckResult::NotFound
        );
        assert_eq!(check_say("talkback-no-such-say-12345"), CheckResult::NotFound);
    }

    #[test]
    #[cfg(unix)]
    fn test_failing_version_flag_is_warning() {
        // `false` exists everywhere and always exits non-zero
        assert!(matches!(
            check_command("false", "--version"),
            CheckResult::Warning(_)
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_working_command_is_ok() {
        assert_eq!(check_command("true", "--version"), CheckResult::Ok);
    }
}
