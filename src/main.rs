//! Speakersync - acoustic speaker offset calibration
//!
//! Entry point for the command line tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speakersync::audio::click::render_track;
use speakersync::audio::wav::write_track;
use speakersync::session::sim::{SimReferenceChannel, SimulatedRoom};
use speakersync::session::{
    CpalCapture, CpalPlayer, HttpPlaybackController, JsonLinesSink, ResultSink, WsChannel,
};
use speakersync::{
    CalibrationConfig, CalibrationOutcome, CalibrationRequest, CalibrationSession, CancelToken,
    ClickSchedule, Collaborators, SessionEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Acoustic playback-delay calibration for networked speakers
#[derive(Parser, Debug)]
#[command(name = "speakersync", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true, value_name = "FILE", env = "SPEAKERSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the click track length (seconds)
    #[arg(long, global = true, value_name = "SECONDS")]
    duration_sec: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate one endpoint with the local microphone
    Calibrate {
        /// Endpoint identifier used by the playback controller
        #[arg(long)]
        endpoint: String,

        /// Display name (defaults to the identifier)
        #[arg(long)]
        name: Option<String>,

        /// URI of the hosted click track the endpoint should play
        #[arg(long, value_name = "URI")]
        media_uri: String,

        /// WebSocket URL of the time reference server
        #[arg(long, value_name = "URL", env = "SPEAKERSYNC_REFERENCE_URL")]
        reference: String,

        /// Base URL of the playback controller
        #[arg(long, value_name = "URL", env = "SPEAKERSYNC_CONTROL_URL")]
        control_url: String,

        /// Input device name (defaults to the system default)
        #[arg(long, value_name = "NAME")]
        device: Option<String>,

        /// Append results to this JSON-lines file instead of stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Run a calibration against a simulated room
    Simulate {
        /// Delay between the play command and the speaker sounding (ms)
        #[arg(long, default_value = "35")]
        delay_ms: f64,

        /// Peak level of background noise at the microphone
        #[arg(long, default_value = "0.002")]
        noise: f32,

        /// Reference clock offset from the local clock (µs)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        clock_offset_us: i64,

        /// Make the endpoint reject remote playback so the local path is used
        #[arg(long)]
        remote_offline: bool,
    },

    /// Write the click track as a 16-bit stereo WAV file
    Render {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },

    /// Print the expected click schedule as JSON
    Schedule,

    /// List available input devices
    Devices,

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("speakersync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(CalibrationConfig::default_path);
    let mut config = CalibrationConfig::load(&config_path);
    if let Some(duration) = cli.duration_sec {
        config.click.total_duration_sec = duration;
    }

    match cli.command {
        Command::Calibrate {
            endpoint,
            name,
            media_uri,
            reference,
            control_url,
            device,
            output,
        } => {
            let sink: Box<dyn ResultSink> = match output {
                Some(path) => Box::new(
                    JsonLinesSink::file(&path)
                        .with_context(|| format!("opening {}", path.display()))?,
                ),
                None => Box::new(JsonLinesSink::stdout()),
            };
            let capture = match device {
                Some(name) => CpalCapture::with_device(name),
                None => CpalCapture::new(),
            };
            let collaborators = Collaborators {
                channel: Box::new(WsChannel::new(config.session.retry.clone())),
                capture: Box::new(capture),
                playback: Arc::new(HttpPlaybackController::new(control_url)),
                local_player: Box::new(CpalPlayer::new()),
                sink,
            };
            let request = CalibrationRequest {
                endpoint_name: name.unwrap_or_else(|| endpoint.clone()),
                endpoint_id: endpoint,
                media_uri,
                reference_url: reference,
            };
            run_session(config, collaborators, &request).await
        }

        Command::Simulate {
            delay_ms,
            noise,
            clock_offset_us,
            remote_offline,
        } => {
            let mut room = SimulatedRoom::new(&config.click, delay_ms).with_noise(noise);
            if remote_offline {
                room = room.remote_unavailable();
            }
            let collaborators = Collaborators {
                channel: Box::new(SimReferenceChannel::new(clock_offset_us)),
                capture: Box::new(room.capture()),
                playback: Arc::new(room.controller()),
                local_player: Box::new(room.local_player()),
                sink: Box::new(JsonLinesSink::stdout()),
            };
            let request = CalibrationRequest {
                endpoint_id: "simulated".into(),
                endpoint_name: "Simulated speaker".into(),
                media_uri: "sim://clicks.wav".into(),
                reference_url: "sim://reference".into(),
            };
            run_session(config, collaborators, &request).await
        }

        Command::Render { out } => {
            config.validate()?;
            let track = render_track(&config.click);
            write_track(&track, &out).with_context(|| format!("writing {}", out.display()))?;
            info!(
                path = %out.display(),
                frames = track.frames(),
                duration_ms = track.duration_ms(),
                "click_track_written"
            );
            Ok(())
        }

        Command::Schedule => {
            config.validate()?;
            let schedule = ClickSchedule::generate(&config.click);
            println!("{}", serde_json::to_string_pretty(schedule.events())?);
            Ok(())
        }

        Command::Devices => {
            let devices = CpalCapture::list_devices()?;
            if devices.is_empty() {
                println!("No input devices found.");
            }
            for (i, device) in devices.iter().enumerate() {
                println!("  {}. {}", i + 1, device);
            }
            Ok(())
        }

        Command::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            config.save(&config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(())
        }
    }
}

async fn run_session(
    config: CalibrationConfig,
    collaborators: Collaborators,
    request: &CalibrationRequest,
) -> Result<()> {
    let mut session = CalibrationSession::new(config, collaborators);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("installing Ctrl+C handler")?;

    let mut events = session.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { to, .. } => eprintln!("[{:?}]", to),
                SessionEvent::Detection(d) => eprintln!(
                    "  click at {:>9.2}ms  {:>6.0}Hz  confidence {:.2}",
                    d.timestamp_ms, d.frequency_hz, d.confidence
                ),
                _ => {}
            }
        }
    });

    eprintln!(
        "Calibrating '{}' - press Ctrl+C to cancel",
        request.endpoint_name
    );
    let outcome = session.run(request, &cancel).await;
    drop(session);
    let _ = progress.await;

    match outcome {
        Ok(CalibrationOutcome::Completed(result)) => {
            eprintln!();
            eprintln!("Offset:     {:>8.2} ms", result.offset_ms);
            eprintln!("Confidence: {:>8.1} %", result.confidence * 100.0);
            eprintln!(
                "Detected:   {:>4}/{} clicks ({} matched, {} rejected)",
                result.detected_count,
                result.total_expected,
                result.matched_count,
                result.rejected_count
            );
            eprintln!(
                "Clock:      {}",
                if result.clock_synced { "synced" } else { "unsynced" }
            );
            Ok(())
        }
        Ok(CalibrationOutcome::Cancelled) => {
            eprintln!("Cancelled.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "calibration_failed");
            Err(e.into())
        }
    }
}
