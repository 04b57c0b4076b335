//! Startup dependency checks
//!
//! Everything the relay depends on is probed once, up front, and reported as
//! a list of results instead of failing halfway through the first turn.

use std::fmt;
use std::time::Duration;

use secrecy::ExposeSecret;

use crate::config::Config;
use crate::llm::LanguageModel;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// Usable, but something is degraded or missing
    Warn,
    /// The relay cannot run this way
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        })
    }
}

/// Result of checking one dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            detail: detail.into(),
        }
    }

    fn warn(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            detail: detail.into(),
        }
    }
}

/// All check results, in the order they ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// True when no check failed
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    /// Failed checks
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }

    /// Look up a check by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            writeln!(f, "[{:>4}] {:<12} {}", check.status, check.name, check.detail)?;
        }
        Ok(())
    }
}

/// Audio hardware presence
pub trait AudioProbe {
    /// A default input device exists
    fn input_available(&self) -> bool;

    /// A default output device exists
    fn output_available(&self) -> bool;
}

/// Probes the host's default audio devices through cpal
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAudio;

impl AudioProbe for SystemAudio {
    fn input_available(&self) -> bool {
        crate::voice::input_device_available()
    }

    fn output_available(&self) -> bool {
        use cpal::traits::HostTrait;
        cpal::default_host().default_output_device().is_some()
    }
}

/// Run every check against `config`
pub async fn run(config: &Config, model: &dyn LanguageModel, audio: &dyn AudioProbe) -> PreflightReport {
    let mut checks = Vec::new();

    checks.push(match config.validate() {
        Ok(()) => CheckResult::pass("config", "configuration is valid"),
        Err(e) => CheckResult::fail("config", e.to_string()),
    });

    checks.push(check_ollama(config, model).await);
    checks.push(check_url("stt", &config.stt.url));
    checks.push(check_url("tts", &config.tts.url));

    if config.voice.enabled {
        checks.push(if audio.input_available() {
            CheckResult::pass("microphone", "default input device found")
        } else {
            CheckResult::fail(
                "microphone",
                "no input device; connect one or run with --disable-voice",
            )
        });
        checks.push(if audio.output_available() {
            CheckResult::pass("speaker", "default output device found")
        } else {
            CheckResult::fail(
                "speaker",
                "no output device; connect one or run with --disable-voice",
            )
        });
    } else {
        checks.push(CheckResult::warn("voice", "voice disabled, text only"));
    }

    checks.push(match config.discord.token.as_ref().map(ExposeSecret::expose_secret) {
        Some(token) if !token.trim().is_empty() => {
            CheckResult::pass("discord", "bot token configured")
        }
        _ => CheckResult::warn("discord", "DISCORD_TOKEN not set, replies go to the console"),
    });

    let report = PreflightReport { checks };
    for failure in report.failures() {
        tracing::warn!(check = failure.name, detail = %failure.detail, "preflight check failed");
    }
    report
}

async fn check_ollama(config: &Config, model: &dyn LanguageModel) -> CheckResult {
    let timeout = config.ollama.request_timeout.min(Duration::from_secs(10));
    match tokio::time::timeout(timeout, model.ping()).await {
        Ok(Ok(())) => CheckResult::pass(
            "ollama",
            format!("{} reachable, model {}", config.ollama.host, config.ollama.model),
        ),
        Ok(Err(e)) => CheckResult::fail(
            "ollama",
            format!(
                "unable to reach Ollama at {}: {e}. Ensure the service is running",
                config.ollama.host
            ),
        ),
        Err(_) => CheckResult::fail(
            "ollama",
            format!("Ollama at {} did not answer within {}s", config.ollama.host, timeout.as_secs()),
        ),
    }
}

fn check_url(name: &'static str, url: &str) -> CheckResult {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some() => {
            CheckResult::pass(name, url.to_string())
        }
        Ok(_) => CheckResult::fail(name, format!("{url} is not an http(s) URL")),
        Err(e) => CheckResult::fail(name, format!("{url}: {e}")),
    }
}
