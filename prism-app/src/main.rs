//! Prism terminal host.
//!
//! Wires the voice core to cpal devices, OpenAI speech backends and the
//! Gemini answer service (or offline stubs), then drives it from stdin.
//!
//! ## Runtime note
//!
//! Backend clients are blocking `reqwest` clients. They are built before
//! the Tokio runtime starts and only called from blocking workers.

mod answer;
mod assistant;
mod commands;
mod search;
mod settings;
mod state;
mod vision;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prism_core::audio::device::{list_input_devices, list_output_devices};
use prism_core::stub::{SimulatedSink, StubMicrophone, StubSynthesizer, StubTranscriber};
use prism_core::tts::openai::OPENAI_VOICES;
use prism_core::{
    AudioSink, CpalMicrophone, CpalSink, FinishReason, InteractionCoordinator, ListeningStatus,
    Microphone, OpenAiSynthesizer, OpenAiTranscriber, PlaybackEvent, Synthesizer, Transcriber,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use answer::{AnswerService, EchoAnswerService, GeminiAnswerService};
use assistant::Assistant;
use commands::{parse, Command, HELP};
use search::{DuckDuckGoSearch, SearchService};
use settings::{
    default_settings_path, load_settings, normalize_voice, save_voice, AppSettings,
};
use vision::StillImageSource;

/// Prism - voice and vision assistant
#[derive(Parser, Debug)]
#[command(name = "prism", version, about)]
struct Cli {
    /// Keep listening after each phrase
    #[arg(long)]
    continuous: bool,

    /// Voice id for spoken answers
    #[arg(long, env = "PRISM_VOICE")]
    voice: Option<String>,

    /// Image file used as the camera frame
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,

    /// Run with stub backends (no network, no audio devices)
    #[arg(long)]
    offline: bool,

    /// Input device name (falls back to the default microphone)
    #[arg(long, value_name = "NAME")]
    input_device: Option<String>,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// List available voices and exit
    #[arg(long)]
    list_voices: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "prism=info,prism_core=info",
        1 => "prism=debug,prism_core=debug",
        _ => "prism=trace,prism_core=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.list_devices {
        print_devices();
        return Ok(());
    }
    if cli.list_voices {
        let voices: Vec<String> = if cli.offline {
            StubSynthesizer::new().voices()
        } else {
            OPENAI_VOICES.iter().map(|v| v.to_string()).collect()
        };
        for voice in voices {
            println!("{voice}");
        }
        return Ok(());
    }

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    if let Some(voice) = cli.voice.as_deref() {
        settings.voice = normalize_voice(voice);
    }
    if cli.continuous {
        settings.continuous = true;
    }
    if let Some(device) = cli.input_device.clone() {
        settings.preferred_input_device = Some(device);
    }
    info!(
        settings_path = ?settings_path,
        voice = %settings.voice,
        continuous = settings.continuous,
        debounce_ms = settings.debounce_ms,
        barge_in_threshold = settings.barge_in_threshold,
        offline = cli.offline,
        "settings loaded"
    );

    let backends = if cli.offline {
        Backends::offline()
    } else {
        Backends::online(&settings)?
    };

    let mut voice_config = settings.to_voice_config();
    let voices = backends.synthesizer.voices();
    if !voices.contains(&voice_config.voice) {
        if let Some(first) = voices.first() {
            warn!(voice = %voice_config.voice, fallback = %first, "voice not offered by backend");
            voice_config.voice = first.clone();
        }
    }

    let coordinator = Arc::new(
        InteractionCoordinator::new(
            backends.microphone,
            backends.transcriber,
            backends.synthesizer,
            backends.sink,
            voice_config,
        )
        .context("starting voice engine")?,
    );

    let mut assistant = Assistant::new(Arc::clone(coordinator.playback()), backends.answers)
        .with_history_turns(settings.history_turns);
    if let Some(search) = backends.search {
        assistant = assistant.with_search(search);
    }
    if let Some(path) = cli.image {
        assistant = assistant.with_frames(Arc::new(StillImageSource::new(path)?));
    }
    let assistant = Arc::new(assistant);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let host = Host {
        coordinator: Arc::clone(&coordinator),
        assistant: Arc::clone(&assistant),
        settings,
        settings_path,
        draft: None,
    };
    let result = runtime.block_on(host.run());
    // Stdin reads park a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(200));

    info!(turns = assistant.transcript().len(), "shutting down");
    coordinator.shutdown();
    result
}

fn print_devices() {
    println!("input devices:");
    for device in list_input_devices() {
        println!(
            "  {}{}{}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            if device.is_loopback_like { " (loopback)" } else { "" },
        );
    }
    println!("output devices:");
    for device in list_output_devices() {
        println!(
            "  {}{}",
            device.name,
            if device.is_default { " (default)" } else { "" },
        );
    }
}

struct Backends {
    microphone: Arc<dyn Microphone>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    answers: Arc<dyn AnswerService>,
    search: Option<Arc<dyn SearchService>>,
}

impl Backends {
    fn offline() -> Self {
        Self {
            microphone: Arc::new(StubMicrophone::new(16_000)),
            transcriber: Arc::new(StubTranscriber::new()),
            synthesizer: Arc::new(StubSynthesizer::new()),
            sink: Arc::new(SimulatedSink::new()),
            answers: Arc::new(EchoAnswerService),
            search: None,
        }
    }

    fn online(settings: &AppSettings) -> anyhow::Result<Self> {
        let openai_key = settings
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY is not set (use --offline to run without cloud backends)")?;
        let gemini_key = settings
            .gemini_api_key
            .clone()
            .context("GEMINI_API_KEY is not set (use --offline to run without cloud backends)")?;

        let answers = GeminiAnswerService::new(gemini_key, settings.answer_model.clone())?
            .with_max_history(settings.history_turns);
        Ok(Self {
            microphone: Arc::new(CpalMicrophone::new(settings.preferred_input_device.clone())),
            transcriber: Arc::new(OpenAiTranscriber::new(openai_key.clone())?),
            synthesizer: Arc::new(
                OpenAiSynthesizer::new(openai_key)?.with_speed(settings.speech_speed),
            ),
            sink: Arc::new(CpalSink::new()),
            answers: Arc::new(answers),
            search: Some(Arc::new(DuckDuckGoSearch::new()?)),
        })
    }
}

/// The interactive session: stdin commands plus recognized speech.
struct Host {
    coordinator: Arc<InteractionCoordinator>,
    assistant: Arc<Assistant>,
    settings: AppSettings,
    settings_path: PathBuf,
    /// Last phrase heard in single-shot mode, sent on an empty line.
    draft: Option<String>,
}

impl Host {
    async fn run(mut self) -> anyhow::Result<()> {
        spawn_transcript_printer(&self.assistant);
        spawn_status_printer(&self.coordinator);
        spawn_playback_logger(&self.coordinator);

        println!("Prism ready. Type a question, or /help for commands.");
        if let Some(source) = self.assistant.camera_source() {
            println!("camera: {source}");
        }
        if self.settings.continuous {
            self.coordinator.enable_listening(true);
        }

        let mut speech = self.coordinator.listening().subscribe_speech();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.execute(parse(&line)) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin closed: {e}");
                        break;
                    }
                },
                event = speech.recv() => match event {
                    Ok(event) => self.on_speech(event.text),
                    Err(RecvError::Lagged(n)) => warn!("speech receiver lagged by {n} events"),
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    fn on_speech(&mut self, text: String) {
        if self.coordinator.intent().continuous {
            self.submit(text);
        } else {
            println!("heard: \"{text}\" (press Enter to send)");
            self.draft = Some(text);
        }
    }

    fn submit(&self, query: String) {
        let assistant = Arc::clone(&self.assistant);
        tokio::spawn(async move {
            assistant.submit(query).await;
        });
    }

    /// Returns `false` when the session should end.
    fn execute(&mut self, command: Command) -> bool {
        debug!(?command, "command");
        match command {
            Command::Listen { continuous } => {
                let listening = self.coordinator.listening();
                if listening.is_continuous().is_some_and(|c| c != continuous) {
                    self.coordinator.disable_listening();
                }
                if self.coordinator.enable_listening(continuous) {
                    println!(
                        "listening{}",
                        if continuous { " (continuous)" } else { " for one phrase" }
                    );
                } else if self.coordinator.playback().is_active() {
                    println!("will listen when the answer finishes");
                } else {
                    println!("already listening");
                }
            }
            Command::Stop => {
                self.coordinator.disable_listening();
                self.draft = None;
            }
            Command::Shh => {
                if !self.coordinator.playback().stop() {
                    println!("not speaking");
                }
            }
            Command::Voice(None) => {
                let current = self.coordinator.playback().voice();
                for voice in self.coordinator.playback().voices() {
                    let marker = if voice == current { "*" } else { " " };
                    println!("{marker} {voice}");
                }
            }
            Command::Voice(Some(voice)) => self.set_voice(&voice),
            Command::Camera(None) => println!(
                "camera {}",
                if self.assistant.camera_enabled() { "on" } else { "off" }
            ),
            Command::Camera(Some(enabled)) => {
                let on = self.assistant.set_camera(enabled);
                if enabled && !on {
                    println!("no camera attached (start with --image <path>)");
                } else {
                    println!("camera {}", if on { "on" } else { "off" });
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
            Command::SendDraft => {
                if let Some(draft) = self.draft.take() {
                    self.submit(draft);
                }
            }
            Command::Query(query) => {
                self.draft = None;
                self.submit(query);
            }
            Command::Unknown(line) => println!("unknown command: {line} (try /help)"),
        }
        true
    }

    fn set_voice(&mut self, voice: &str) {
        let voice = normalize_voice(voice);
        let voices = self.coordinator.playback().voices();
        if !voices.contains(&voice) {
            println!("unknown voice \"{voice}\"; available: {}", voices.join(", "));
            return;
        }
        self.coordinator.playback().set_voice(voice.clone());
        if let Err(e) = save_voice(&self.settings_path, &voice) {
            warn!("failed to save settings: {e}");
        }
        self.settings.voice = voice;
    }
}

fn spawn_transcript_printer(assistant: &Assistant) {
    let mut turns = assistant.subscribe_turns();
    tokio::spawn(async move {
        loop {
            match turns.recv().await {
                Ok(turn) => println!("{turn}"),
                Err(RecvError::Lagged(n)) => warn!("transcript receiver lagged by {n} turns"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_status_printer(coordinator: &InteractionCoordinator) {
    let mut status = coordinator.listening().subscribe_status();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => match (event.status, event.detail) {
                    (ListeningStatus::MicrophoneUnavailable, detail) => println!(
                        "! microphone unavailable: {}",
                        detail.unwrap_or_else(|| "unknown error".into())
                    ),
                    (status, _) => println!("· {status}"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_playback_logger(coordinator: &InteractionCoordinator) {
    let mut events = coordinator.playback().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PlaybackEvent::Finished {
                    reason: FinishReason::Interrupted,
                    ..
                }) => println!("· interrupted"),
                Ok(PlaybackEvent::Finished {
                    reason: FinishReason::Failed,
                    session,
                }) => println!("! could not speak answer {session}"),
                Ok(event) => debug!(?event, "playback"),
                Err(RecvError::Lagged(n)) => warn!("playback receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
