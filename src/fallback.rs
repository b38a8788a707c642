//! Ordered providers with per-tier deadlines.
//!
//! A [`FallbackChain`] tries its providers strictly in order. Each attempt runs
//! on its own thread and is joined with a deadline; a provider that misses it
//! is abandoned and whatever it produces later is dropped. The first
//! non-empty result wins. When every tier fails the caller either gets the
//! attempt log ([`FallbackChain::try_run`]) or a terminal default of its
//! choosing ([`FallbackChain::run`]).

use crate::audio::frame::NormalizedAudio;
use crate::error::Result;
use crossbeam_channel::{RecvTimeoutError, bounded};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Output types that can be "empty", which counts as a miss.
pub trait Payload {
    fn is_empty_payload(&self) -> bool;
}

impl Payload for String {
    fn is_empty_payload(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Payload for NormalizedAudio {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Payload for Vec<T> {
    fn is_empty_payload(&self) -> bool {
        self.is_empty()
    }
}

/// A named backend for one capability.
pub trait Provider<I, O>: Send + Sync {
    /// Name reported when this provider produced the result.
    fn name(&self) -> &str;

    /// Produces an output for `input`. May block; the chain enforces the deadline.
    fn invoke(&self, input: &I) -> Result<O>;
}

/// Adapts a closure into a [`Provider`].
pub struct FnProvider<F> {
    name: String,
    f: F,
}

impl<F> FnProvider<F> {
    pub fn new<I, O>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&I) -> Result<O> + Send + Sync,
    {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<I, O, F> Provider<I, O> for FnProvider<F>
where
    F: Fn(&I) -> Result<O> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: &I) -> Result<O> {
        (self.f)(input)
    }
}

/// Why a tier did not produce the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Returned successfully but with nothing in it.
    Empty,
    /// Returned an error.
    Failed(String),
    /// Missed its deadline and was abandoned.
    TimedOut,
    /// The worker thread died without answering.
    Panicked,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Empty => write!(f, "empty result"),
            AttemptOutcome::Failed(reason) => write!(f, "{reason}"),
            AttemptOutcome::TimedOut => write!(f, "timed out"),
            AttemptOutcome::Panicked => write!(f, "provider panicked"),
        }
    }
}

/// One unsuccessful tier.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Output of a chain run and where it came from.
#[derive(Debug, Clone)]
pub struct Resolved<O> {
    pub output: O,
    /// Name of the provider (or terminal default) that produced `output`.
    pub provider: String,
    /// Tiers tried before `provider`, in order.
    pub attempts: Vec<Attempt>,
}

impl<O> Resolved<O> {
    /// True when the output came from the terminal default.
    pub fn is_degraded(&self, terminal_name: &str) -> bool {
        self.provider == terminal_name
    }
}

/// Summarises failed attempts as `name: reason; name: reason`.
pub fn describe_attempts(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no providers configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

struct Tier<I, O> {
    provider: Arc<dyn Provider<I, O>>,
    timeout: Duration,
}

/// Degrading executor over an ordered list of providers.
pub struct FallbackChain<I, O> {
    name: String,
    tiers: Vec<Tier<I, O>>,
}

impl<I, O> FallbackChain<I, O>
where
    I: Clone + Send + 'static,
    O: Payload + Send + 'static,
{
    /// Creates an empty chain; `name` is used in logs and thread names.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tiers: Vec::new(),
        }
    }

    /// Appends a tier.
    pub fn with_tier(mut self, provider: Arc<dyn Provider<I, O>>, timeout: Duration) -> Self {
        self.push_tier(provider, timeout);
        self
    }

    pub fn push_tier(&mut self, provider: Arc<dyn Provider<I, O>>, timeout: Duration) {
        self.tiers.push(Tier { provider, timeout });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.provider.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Runs the tiers in order; returns the attempt log if all of them miss.
    pub fn try_run(&self, input: &I) -> std::result::Result<Resolved<O>, Vec<Attempt>> {
        let mut attempts = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            let name = tier.provider.name().to_string();
            let started = Instant::now();
            let outcome = match self.attempt(tier, input) {
                Ok(output) => {
                    tracing::debug!(
                        chain = %self.name,
                        provider = %name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "fallback tier succeeded"
                    );
                    return Ok(Resolved {
                        output,
                        provider: name,
                        attempts,
                    });
                }
                Err(outcome) => outcome,
            };

            tracing::warn!(
                chain = %self.name,
                provider = %name,
                reason = %outcome,
                "fallback tier missed, trying next"
            );
            attempts.push(Attempt {
                provider: name,
                outcome,
                elapsed: started.elapsed(),
            });
        }

        Err(attempts)
    }

    /// Runs the tiers in order, falling back to `terminal` when all of them miss.
    ///
    /// Never fails: the terminal default is reported under `terminal_name`.
    pub fn run<F>(&self, input: &I, terminal_name: &str, terminal: F) -> Resolved<O>
    where
        F: FnOnce(&I) -> O,
    {
        match self.try_run(input) {
            Ok(resolved) => resolved,
            Err(attempts) => {
                tracing::warn!(
                    chain = %self.name,
                    attempts = %describe_attempts(&attempts),
                    "all providers exhausted, using terminal default"
                );
                Resolved {
                    output: terminal(input),
                    provider: terminal_name.to_string(),
                    attempts,
                }
            }
        }
    }

    fn attempt(&self, tier: &Tier<I, O>, input: &I) -> std::result::Result<O, AttemptOutcome> {
        // Capacity 1 lets an abandoned worker deliver without blocking.
        let (tx, rx) = bounded(1);
        let provider = Arc::clone(&tier.provider);
        let owned = input.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, provider.name()))
            .spawn(move || {
                let result = provider.invoke(&owned);
                if tx.send(result).is_err() {
                    tracing::debug!(provider = provider.name(), "late result discarded");
                }
            });
        if let Err(e) = spawned {
            return Err(AttemptOutcome::Failed(format!("failed to spawn worker: {e}")));
        }

        match rx.recv_timeout(tier.timeout) {
            Ok(Ok(output)) if !output.is_empty_payload() => Ok(output),
            Ok(Ok(_)) => Err(AttemptOutcome::Empty),
            Ok(Err(e)) => Err(AttemptOutcome::Failed(e.to_string())),
            Err(RecvTimeoutError::Timeout) => Err(AttemptOutcome::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(AttemptOutcome::Panicked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TalkbackError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Chain = FallbackChain<String, String>;

    fn ok(name: &str, output: &'static str) -> Arc<dyn Provider<String, String>> {
        Arc::new(FnProvider::new(name, move |_: &String| Ok(output.to_string())))
    }

    fn failing(name: &str) -> Arc<dyn Provider<String, String>> {
        Arc::new(FnProvider::new(name, |_: &String| {
            Err(TalkbackError::Synthesis {
                message: "backend down".to_string(),
            })
        }))
    }

    fn slow(name: &str, delay: Duration) -> Arc<dyn Provider<String, String>> {
        Arc::new(FnProvider::new(name, move |_: &String| {
            thread::sleep(delay);
            Ok("late".to_string())
        }))
    }

    const T: Duration = Duration::from_secs(2);

    #[test]
    fn test_first_success_wins() {
        let chain = Chain::new("test")
            .with_tier(ok("a", "from a"), T)
            .with_tier(ok("b", "from b"), T);
        let resolved = chain.try_run(&"x".to_string()).unwrap();
        assert_eq!(resolved.output, "from a");
        assert_eq!(resolved.provider, "a");
        assert!(resolved.attempts.is_empty());
    }

    #[test]
    fn test_fails_fails_succeeds_returns_third() {
        let chain = Chain::new("test")
            .with_tier(failing("a"), T)
            .with_tier(failing("b"), T)
            .with_tier(ok("c", "from c"), T);
        let resolved = chain.run(&"x".to_string(), "default", |_| "fallback".to_string());
        assert_eq!(resolved.output, "from c");
        assert_eq!(resolved.provider, "c");
        assert_eq!(resolved.attempts.len(), 2);
        assert_eq!(resolved.attempts[0].provider, "a");
        assert_eq!(
            resolved.attempts[1].outcome,
            AttemptOutcome::Failed("Speech synthesis failed: backend down".to_string())
        );
    }

    #[test]
    fn test_all_failing_returns_terminal_default() {
        let chain = Chain::new("test")
            .with_tier(failing("a"), T)
            .with_tier(failing("b"), T);
        let resolved = chain.run(&"x".to_string(), "default", |input| format!("beep:{input}"));
        assert_eq!(resolved.output, "beep:x");
        assert_eq!(resolved.provider, "default");
        assert!(resolved.is_degraded("default"));
        assert_eq!(resolved.attempts.len(), 2);
    }

    #[test]
    fn test_empty_chain_uses_terminal_default() {
        let chain = Chain::new("test");
        let resolved = chain.run(&"x".to_string(), "default", |_| "d".to_string());
        assert_eq!(resolved.provider, "default");
        assert!(chain.try_run(&"x".to_string()).unwrap_err().is_empty());
    }

    #[test]
    fn test_empty_output_moves_to_next() {
        let chain = Chain::new("test")
            .with_tier(ok("blank", "   "), T)
            .with_tier(ok("real", "text"), T);
        let resolved = chain.try_run(&"x".to_string()).unwrap();
        assert_eq!(resolved.provider, "real");
        assert_eq!(resolved.attempts[0].outcome, AttemptOutcome::Empty);
    }

    #[test]
    fn test_slow_provider_is_abandoned_at_deadline() {
        let chain = Chain::new("test")
            .with_tier(slow("slow", Duration::from_secs(3)), Duration::from_millis(50))
            .with_tier(ok("fast", "fast"), T);

        let started = Instant::now();
        let resolved = chain.try_run(&"x".to_string()).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(resolved.provider, "fast");
        assert_eq!(resolved.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert!(
            elapsed < Duration::from_millis(1000),
            "chain waited for abandoned provider: {elapsed:?}"
        );
    }

    #[test]
    fn test_timeout_on_last_tier_returns_promptly() {
        let chain = Chain::new("test")
            .with_tier(slow("slow", Duration::from_secs(3)), Duration::from_millis(50));
        let started = Instant::now();
        let resolved = chain.run(&"x".to_string(), "default", |_| "d".to_string());
        assert_eq!(resolved.provider, "default");
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_panicking_provider_is_skipped() {
        let panics: Arc<dyn Provider<String, String>> =
            Arc::new(FnProvider::new("panics", |_: &String| -> Result<String> {
                panic!("provider bug")
            }));
        let chain = Chain::new("test")
            .with_tier(panics, T)
            .with_tier(ok("ok", "fine"), T);
        let resolved = chain.try_run(&"x".to_string()).unwrap();
        assert_eq!(resolved.provider, "ok");
        assert_eq!(resolved.attempts[0].outcome, AttemptOutcome::Panicked);
    }

    #[test]
    fn test_providers_tried_in_order_and_stop_at_success() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = Chain::new("test");
        for (name, succeed) in [("one", false), ("two", true), ("three", true)] {
            let order = Arc::clone(&order);
            let calls = Arc::clone(&calls);
            chain.push_tier(
                Arc::new(FnProvider::new(name, move |_: &String| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    order.lock().unwrap().push(name);
                    if succeed {
                        Ok(name.to_string())
                    } else {
                        Err(TalkbackError::Other("no".to_string()))
                    }
                })),
                T,
            );
        }

        let resolved = chain.try_run(&"x".to_string()).unwrap();
        assert_eq!(resolved.output, "two");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn test_provider_names() {
        let chain = Chain::new("synthesis")
            .with_tier(ok("primary", "x"), T)
            .with_tier(ok("secondary", "y"), T);
        assert_eq!(chain.provider_names(), vec!["primary", "secondary"]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.name(), "synthesis");
    }

    #[test]
    fn test_describe_attempts() {
        let attempts = vec![
            Attempt {
                provider: "ffmpeg".to_string(),
                outcome: AttemptOutcome::Failed("not installed".to_string()),
                elapsed: Duration::ZERO,
            },
            Attempt {
                provider: "native".to_string(),
                outcome: AttemptOutcome::TimedOut,
                elapsed: Duration::ZERO,
            },
        ];
        assert_eq!(
            describe_attempts(&attempts),
            "ffmpeg: not installed; native: timed out"
        );
        assert_eq!(describe_attempts(&[]), "no providers configured");
    }

    #[test]
    fn test_audio_payload_emptiness() {
        assert!(NormalizedAudio::empty(16000).is_empty_payload());
        assert!(!NormalizedAudio::new(vec![0.0], 16000).is_empty_payload());
    }
}
