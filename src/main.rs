use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use homevoice::selftest::{self, SelfTestReport, SelfTestRequest};
use homevoice::voice::frames_from_wav;
use homevoice::{Config, Daemon};

/// HomeVoice - wake word voice assistant pipeline
#[derive(Parser)]
#[command(name = "homevoice", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "HOMEVOICE_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic,
    /// Test speaker output with a short tone
    TestSpeaker,
    /// Score a sample through the wake word model
    TestWakeWord {
        /// 16 kHz mono WAV file; a synthetic sample when omitted
        #[arg(short, long)]
        sample: Option<PathBuf>,
    },
    /// Test the Gemini API key
    TestApi,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,homevoice=info",
        1 => "info,homevoice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `false` when a self-test ran and failed
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.api_server.port = port;
    }

    let Some(command) = cli.command else {
        tracing::info!(
            name = %config.pipeline.name,
            port = config.api_server.port,
            "starting homevoice"
        );
        tracing::info!("homevoice ready - say \"{}\"", config.pipeline.wake_word);
        Daemon::new(config).run().await?;
        return Ok(true);
    };

    let request = match command {
        Command::TestMic => {
            println!("Testing microphone...");
            SelfTestRequest::AudioCapture { input_device: None }
        }
        Command::TestSpeaker => {
            println!("Testing speaker output, you should hear a 440Hz tone");
            SelfTestRequest::Tts {
                output_device: None,
                tts_service: None,
            }
        }
        Command::TestWakeWord { sample } => {
            let sample = sample.as_deref().map(frames_from_wav).transpose()?;
            println!("Testing wake word \"{}\"...", config.pipeline.wake_word);
            SelfTestRequest::WakeWord {
                wake_word: None,
                sensitivity: None,
                sample,
            }
        }
        Command::TestApi => {
            println!("Testing Gemini API connection...");
            SelfTestRequest::GeminiApi { api_key: None }
        }
    };

    let deps = Daemon::new(config.clone()).deps();
    let report = selftest::run(request, &deps, &config.pipeline).await?;
    print_report(&report);
    Ok(report.success)
}

fn print_report(report: &SelfTestReport) {
    let verdict = if report.success { "PASS" } else { "FAIL" };
    println!("\n[{verdict}] {}", report.message);
}
