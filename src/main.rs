use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vox_relay::llm::OllamaClient;
use vox_relay::preflight::{self, SystemAudio};
use vox_relay::voice::{
    AudioSink, MicrophoneSource, SpeakerSink, SpeechSynthesizer, Synthesizer, calculate_energy,
    samples_to_wav,
};
use vox_relay::{Config, Daemon};

/// Vox - wake-word voice and text relay to a local language model
#[derive(Parser)]
#[command(name = "vox", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/vox/relay/config.toml)
    #[arg(short, long, env = "VOX_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable voice features (for headless servers without audio hardware)
    #[arg(long, env = "VOX_DISABLE_VOICE")]
    disable_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Check configuration and every external dependency
    Check,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,vox_relay=info",
        1 => "info,vox_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {}
        Command::Check => return check(config_path, cli.disable_voice).await,
        Command::TestMic { duration } => return test_mic(duration).await.map(|()| ExitCode::SUCCESS),
        Command::TestSpeaker => return test_speaker().await.map(|()| ExitCode::SUCCESS),
        Command::TestTts { text } => {
            return test_tts(config_path, &text).await.map(|()| ExitCode::SUCCESS);
        }
    }

    tracing::info!(
        config = ?cli.config,
        disable_voice = cli.disable_voice,
        "starting vox relay"
    );

    // Load configuration
    let config = Config::load_with_options(config_path, cli.disable_voice)?;
    tracing::debug!(?config, "loaded configuration");

    if config.voice.enabled {
        tracing::info!("vox relay ready - say \"{}\"", config.voice.wake_phrase);
    } else {
        tracing::info!("vox relay ready (text-only mode, voice disabled)");
    }

    // Run until interrupted
    Daemon::new(config).run().await?;

    Ok(ExitCode::SUCCESS)
}

/// Run preflight checks and print the report
async fn check(config_path: Option<&std::path::Path>, disable_voice: bool) -> anyhow::Result<ExitCode> {
    let config = Config::load_with_options(config_path, disable_voice)?;
    let model = OllamaClient::new(&config.ollama)?;

    let report = preflight::run(&config, &model, &SystemAudio).await;
    print!("{report}");

    if report.is_ok() {
        println!("\nAll required dependencies are available.");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\nSome checks failed; fix them before running the relay.");
        Ok(ExitCode::FAILURE)
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = MicrophoneSource::new()?;
    capture.start()?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    let mut recorded = Vec::new();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);

        recorded.extend(samples);
        capture.clear_buffer();
    }

    capture.stop();

    let wav = samples_to_wav(&recorded, sample_rate)?;
    println!("\n---");
    println!("Captured {} bytes of WAV audio.", wav.len());
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sink = SpeakerSink::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let wav = samples_to_wav(&samples, sample_rate)?;
    println!("Playing {} samples at {sample_rate} Hz...", samples.len());

    sink.play(&wav, &CancellationToken::new()).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test the configured TTS service end to end
async fn test_tts(config_path: Option<&std::path::Path>, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(config_path)?;
    let synthesizer = SpeechSynthesizer::new(&config.tts)?;

    println!("Synthesizing speech via {}...", synthesizer.endpoint());
    let audio = synthesizer
        .synthesize(text, &config.voice.voice_id)
        .await
        .map_err(|e| anyhow::anyhow!("TTS synthesis failed: {e}"))?;
    println!("Got {} bytes of audio data", audio.len());

    println!("Playing audio...");
    SpeakerSink::new()?
        .play(&audio, &CancellationToken::new())
        .await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
