use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use prism_core::audio::recorder::EnergyLevel;
use prism_core::stub::{
    drain, recv_with_timeout, SimulatedSink, StubMicrophone, StubReply, StubSynthesizer,
    StubTranscriber,
};
use prism_core::{
    BargeInMonitor, FinishReason, InteractionCoordinator, ListeningController, ListeningState,
    ListeningStatus, PlaybackEvent, VoiceConfig,
};

fn quick_config() -> VoiceConfig {
    VoiceConfig {
        ambient_calibration: Duration::from_millis(20),
        pause_threshold: Duration::from_millis(100),
        min_phrase_duration: Duration::from_millis(60),
        ..VoiceConfig::default()
    }
}

fn say(mic: &StubMicrophone, speech: Duration) {
    mic.push_silence(Duration::from_millis(60));
    mic.push_speech(speech, 0.3);
    mic.push_silence(Duration::from_millis(200));
}

/// Single-shot: one captured segment, one `speech_recognized("hello")`, back to Idle.
#[test]
fn single_shot_delivers_hello_then_idles() {
    let mic = Arc::new(StubMicrophone::new(16_000));
    let transcriber = Arc::new(StubTranscriber::with_replies([StubReply::Text(
        "hello".into(),
    )]));
    let config = quick_config();
    let controller = ListeningController::new(
        mic.clone(),
        transcriber.clone(),
        Arc::new(BargeInMonitor::new(config.debounce_window)),
        Arc::new(EnergyLevel::new()),
        config,
    );
    let mut speech = controller.subscribe_speech();
    let mut status = controller.subscribe_status();
    say(&mic, Duration::from_millis(250));

    assert!(controller.start(false));
    let event = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("speech event");
    assert_eq!(event.text, "hello");

    let deadline = Instant::now() + Duration::from_secs(1);
    while controller.state() != ListeningState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(controller.state(), ListeningState::Idle);

    thread::sleep(Duration::from_millis(300));
    assert!(drain(&mut speech).is_empty(), "exactly one speech event");

    let statuses: Vec<_> = drain(&mut status).into_iter().map(|e| e.status).collect();
    assert_eq!(statuses.first(), Some(&ListeningStatus::ListeningStarted));
    assert_eq!(statuses.last(), Some(&ListeningStatus::ListeningStopped));
    assert!(statuses.contains(&ListeningStatus::ProcessingSpeech));

    controller.shutdown();
    assert_eq!(transcriber.calls(), 1);
}

/// URLs never reach the synthesizer; `%` is spoken as "percent".
#[test]
fn urls_and_percent_are_sanitized_before_synthesis() {
    let synth = Arc::new(StubSynthesizer::new().with_fixed_duration(Duration::from_millis(50)));
    let coordinator = InteractionCoordinator::new(
        Arc::new(StubMicrophone::new(16_000)),
        Arc::new(StubTranscriber::new()),
        synth.clone(),
        Arc::new(SimulatedSink::new()),
        quick_config(),
    )
    .expect("coordinator");
    let mut rx = coordinator.playback().subscribe();

    coordinator.playback().speak("Check https://x.com now! 50%");
    recv_with_timeout(&mut rx, Duration::from_secs(1)).expect("started");
    recv_with_timeout(&mut rx, Duration::from_secs(1)).expect("finished");

    let (text, _) = synth.requests().pop().expect("one synthesis request");
    assert!(!text.contains("https://x.com"));
    assert!(!text.contains("x.com"));
    assert!(text.contains(" percent"));
    coordinator.shutdown();
}

/// Loud microphone energy during playback cuts it off within one poll.
#[test]
fn loud_speech_interrupts_long_answer() {
    let mic = Arc::new(StubMicrophone::new(16_000));
    let sink = Arc::new(SimulatedSink::new());
    let config = VoiceConfig {
        barge_in_poll: Duration::from_millis(50),
        barge_in_threshold: 0.05,
        ..quick_config()
    };
    let coordinator = InteractionCoordinator::new(
        mic.clone(),
        Arc::new(StubTranscriber::new()),
        Arc::new(StubSynthesizer::new().with_fixed_duration(Duration::from_secs(10))),
        sink.clone(),
        config,
    )
    .expect("coordinator");
    let mut rx = coordinator.playback().subscribe();

    coordinator.enable_listening(true);
    let session = coordinator.playback().speak("long answer").expect("session");
    assert_eq!(
        recv_with_timeout(&mut rx, Duration::from_secs(1)),
        Some(PlaybackEvent::Started { session })
    );

    thread::sleep(Duration::from_millis(200));
    assert!(coordinator.playback().is_active(), "quiet room must not interrupt");
    mic.set_background(0.3);
    let flipped = Instant::now();

    let finished = recv_with_timeout(&mut rx, Duration::from_secs(2)).expect("finished");
    let latency = flipped.elapsed();
    assert_eq!(
        finished,
        PlaybackEvent::Finished {
            session,
            reason: FinishReason::Interrupted
        }
    );
    // sampler chunk + one poll + scheduling slack
    assert!(latency < Duration::from_millis(400), "barge-in took {latency:?}");
    assert_eq!(sink.active(), 0, "no audio may keep playing");

    mic.set_background(0.0);
    coordinator.shutdown();
    assert_eq!(sink.releases(), sink.plays());
}

/// A start requested right after playback ends idles until the debounce
/// window has elapsed, without opening the microphone.
#[test]
fn start_inside_debounce_window_keeps_mic_closed() {
    let mic = Arc::new(StubMicrophone::new(16_000));
    let config = VoiceConfig {
        debounce_window: Duration::from_secs(1),
        ..quick_config()
    };
    let monitor = Arc::new(BargeInMonitor::new(config.debounce_window));
    let controller = ListeningController::new(
        mic.clone(),
        Arc::new(StubTranscriber::new()),
        Arc::clone(&monitor),
        Arc::new(EnergyLevel::new()),
        config,
    );

    let playback_end = Instant::now();
    monitor.record_playback_end(playback_end);
    thread::sleep(Duration::from_millis(50));
    assert!(controller.start(true));
    assert_eq!(controller.state(), ListeningState::Listening);

    thread::sleep(Duration::from_millis(700));
    assert_eq!(mic.open_count(), 0, "microphone opened inside the debounce window");

    let deadline = Instant::now() + Duration::from_secs(2);
    while mic.open_count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let first_open = *mic.open_times().first().expect("mic opened after the window");
    assert!(first_open.duration_since(playback_end) >= Duration::from_secs(1));

    controller.shutdown();
}

/// Speak-then-listen round trip through the coordinator: listening pauses for
/// the answer and resumes afterwards, and the resumed loop still hears speech.
#[test]
fn conversation_round_trip() {
    let mic = Arc::new(StubMicrophone::new(16_000));
    let transcriber = Arc::new(StubTranscriber::with_replies([
        StubReply::Text("what time is it".into()),
        StubReply::Text("thanks".into()),
    ]));
    let config = VoiceConfig {
        debounce_window: Duration::from_millis(300),
        resume_grace: Duration::from_millis(100),
        ..quick_config()
    };
    let coordinator = InteractionCoordinator::new(
        mic.clone(),
        transcriber,
        Arc::new(StubSynthesizer::new().with_fixed_duration(Duration::from_millis(300))),
        Arc::new(SimulatedSink::new()),
        config,
    )
    .expect("coordinator");
    let mut speech = coordinator.listening().subscribe_speech();
    let mut playback = coordinator.playback().subscribe();

    say(&mic, Duration::from_millis(250));
    coordinator.enable_listening(true);
    let first = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("question");
    assert_eq!(first.text, "what time is it");

    coordinator.playback().speak("It is noon.");
    recv_with_timeout(&mut playback, Duration::from_secs(1)).expect("started");
    let deadline = Instant::now() + Duration::from_secs(1);
    while coordinator.listening().is_active() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!coordinator.listening().is_active());

    let finished = recv_with_timeout(&mut playback, Duration::from_secs(2)).expect("finished");
    assert!(matches!(
        finished,
        PlaybackEvent::Finished {
            reason: FinishReason::Completed,
            ..
        }
    ));

    let deadline = Instant::now() + Duration::from_secs(2);
    while !coordinator.listening().is_active() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(coordinator.listening().is_active(), "listening should resume");

    // Past the debounce window the user speaks again.
    thread::sleep(Duration::from_millis(300));
    say(&mic, Duration::from_millis(250));
    let second = recv_with_timeout(&mut speech, Duration::from_secs(3)).expect("follow-up");
    assert_eq!(second.text, "thanks");

    coordinator.shutdown();
}
