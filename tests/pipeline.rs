//! Pipeline coordinator integration tests
//!
//! Every external service is mocked; see `common`.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Harness, message, test_config};
use vox_relay::channels::Channel;
use vox_relay::pipeline::{PLAYBACK_STOPPED, WAKE_ACK};
use vox_relay::{CommandRouter, Error, FailureKind, PipelineState, TurnOutcome};

const INFERENCE_NOTICE: &str =
    "The language model is unavailable right now. Please try again shortly.";
const TRANSCRIPTION_NOTICE: &str = "Sorry, I couldn't understand that audio. Please try again.";

#[tokio::test]
async fn test_text_wake_turn_replies_and_remembers() {
    let h = Harness::new();

    let outcome = h
        .coordinator
        .on_text_message("c", "Hey assistant, what is Rust?")
        .await;

    assert_eq!(outcome.text(), Some("reply to: what is Rust?"));
    assert!(outcome.audio().is_none(), "text turns are not spoken");
    assert_eq!(h.outlet.texts_for("c"), vec!["reply to: what is Rust?"]);
    assert_eq!(h.coordinator.memory().len("c"), 2);
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_text_without_wake_phrase_is_ignored() {
    let h = Harness::new();

    let outcome = h.coordinator.on_text_message("c", "just chatting").await;

    assert!(matches!(outcome, TurnOutcome::Ignored));
    assert!(h.outlet.texts().is_empty());
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn test_text_without_wake_phrase_answered_when_not_required() {
    let mut config = test_config();
    config.voice.text_requires_wake_phrase = false;
    let h = Harness::with_config(&config);

    let outcome = h.coordinator.on_text_message("c", "just chatting").await;
    assert_eq!(outcome.text(), Some("reply to: just chatting"));
}

#[tokio::test]
async fn test_bare_wake_phrase_acknowledges_and_opens_window() {
    let h = Harness::new();

    let ack = h.coordinator.on_text_message("c", "hey assistant").await;
    assert!(matches!(ack, TurnOutcome::Notice(ref text) if text == WAKE_ACK));
    assert_eq!(h.model.calls(), 0);

    // Next message needs no wake phrase
    let outcome = h.coordinator.on_text_message("c", "what time is it").await;
    assert_eq!(outcome.text(), Some("reply to: what time is it"));

    // Window is single use
    let outcome = h.coordinator.on_text_message("c", "and tomorrow").await;
    assert!(matches!(outcome, TurnOutcome::Ignored));
}

#[tokio::test]
async fn test_cooldown_rejects_second_wake_silently() {
    let mut config = test_config();
    config.voice.cooldown = Duration::from_secs(5);
    let h = Harness::with_config(&config);

    let first = h.coordinator.on_text_message("c", "hey assistant one").await;
    assert!(matches!(first, TurnOutcome::Replied(_)));

    let second = h.coordinator.on_text_message("c", "hey assistant two").await;
    assert_eq!(second.failure(), Some(FailureKind::CooldownRejected));
    assert_eq!(h.outlet.texts_for("c").len(), 1, "rejections post nothing");
    assert_eq!(h.model.calls(), 1);

    // Other channels have their own window
    let other = h.coordinator.on_text_message("d", "hey assistant three").await;
    assert!(matches!(other, TurnOutcome::Replied(_)));

    // Direct questions bypass the cooldown
    let asked = h.coordinator.on_ask("c", "four").await;
    assert_eq!(asked.text(), Some("reply to: four"));
}

#[tokio::test]
async fn test_inference_failure_posts_one_notice_and_keeps_memory() {
    let h = Harness::new();
    h.coordinator.on_ask("c", "first").await;
    h.outlet.clear();

    h.model.fail_next(Error::Inference("connection refused".to_string()));
    let outcome = h.coordinator.on_ask("c", "second").await;

    assert_eq!(outcome.failure(), Some(FailureKind::InferenceUnavailable));
    assert_eq!(h.outlet.texts_for("c"), vec![INFERENCE_NOTICE]);
    assert_eq!(h.coordinator.memory().len("c"), 2);
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_inference_timeout_is_reported() {
    let h = Harness::new();
    h.model.set_delay(Duration::from_secs(2));

    let outcome = h.coordinator.on_ask("c", "slow question").await;

    assert_eq!(outcome.failure(), Some(FailureKind::InferenceUnavailable));
    assert_eq!(h.outlet.texts_for("c"), vec![INFERENCE_NOTICE]);
    assert!(h.coordinator.memory().is_empty("c"));
}

#[tokio::test]
async fn test_concurrent_turn_on_busy_channel_is_dropped() {
    let h = Harness::new();
    h.model.set_delay(Duration::from_millis(200));

    let coordinator = Arc::clone(&h.coordinator);
    let first = tokio::spawn(async move { coordinator.on_ask("c", "first").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.coordinator.state("c"), PipelineState::Inferring);

    let second = h.coordinator.on_ask("c", "second").await;
    assert!(matches!(second, TurnOutcome::Busy));

    let first = first.await.unwrap();
    assert_eq!(first.text(), Some("reply to: first"));
    assert_eq!(h.model.calls(), 1);
    assert_eq!(h.coordinator.memory().len("c"), 2);
}

#[tokio::test]
async fn test_reset_cancels_in_flight_turn() {
    let h = Harness::new();
    h.model.set_delay(Duration::from_millis(300));

    let coordinator = Arc::clone(&h.coordinator);
    let turn = tokio::spawn(async move { coordinator.on_ask("c", "never mind").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reset = h.coordinator.on_reset("c").await;
    assert!(matches!(reset, TurnOutcome::Notice(_)));

    let outcome = turn.await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Cancelled));
    assert!(h.coordinator.memory().is_empty("c"));
    assert_eq!(h.outlet.texts_for("c"), vec!["Conversation history cleared."]);

    // The fresh session is free for the next turn
    let next = h.coordinator.on_ask("c", "hello").await;
    assert_eq!(next.text(), Some("reply to: hello"));
}

#[tokio::test]
async fn test_reset_clears_history() {
    let h = Harness::new();
    h.coordinator.on_ask("c", "remember me").await;
    h.coordinator.on_ask("d", "other channel").await;

    h.coordinator.on_reset("c").await;

    assert!(h.coordinator.memory().is_empty("c"));
    assert_eq!(h.coordinator.memory().len("d"), 2);
}

#[tokio::test]
async fn test_history_bound_keeps_most_recent_turns() {
    let mut config = test_config();
    config.conversation.max_history = 4;
    let h = Harness::with_config(&config);

    for i in 1..=4 {
        h.coordinator.on_ask("c", &format!("question {i}")).await;
    }

    let contents: Vec<String> = h
        .coordinator
        .memory()
        .snapshot("c")
        .into_iter()
        .map(|t| t.content)
        .collect();
    assert_eq!(
        contents,
        vec![
            "question 3",
            "reply to: question 3",
            "question 4",
            "reply to: question 4",
        ]
    );

    // Prompt for the last turn carried only what fit
    let prompts = h.model.prompts.lock().unwrap();
    let last = prompts.last().unwrap();
    assert!(last.iter().all(|m| m.content != "question 1"));
}

#[tokio::test]
async fn test_ask_requires_a_question() {
    let h = Harness::new();

    let outcome = h.coordinator.on_ask("c", "   ").await;

    assert!(matches!(outcome, TurnOutcome::Notice(_)));
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn test_listen_once_accepts_one_message() {
    let h = Harness::new();

    let opened = h.coordinator.listen_once("c").await;
    assert!(matches!(opened, TurnOutcome::Notice(ref t) if t == "Listening..."));

    let answered = h.coordinator.on_text_message("c", "tell me a joke").await;
    assert_eq!(answered.text(), Some("reply to: tell me a joke"));

    let ignored = h.coordinator.on_text_message("c", "another one").await;
    assert!(matches!(ignored, TurnOutcome::Ignored));
}

#[tokio::test]
async fn test_busy_channel_keeps_listen_window_open() {
    let h = Harness::new();
    h.coordinator.listen_once("c").await;
    h.model.set_delay(Duration::from_millis(200));

    let coordinator = Arc::clone(&h.coordinator);
    let asked = tokio::spawn(async move { coordinator.on_ask("c", "first").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let busy = h.coordinator.on_text_message("c", "tell me a joke").await;
    assert!(matches!(busy, TurnOutcome::Busy));
    assert!(matches!(asked.await.unwrap(), TurnOutcome::Replied(_)));

    let answered = h.coordinator.on_text_message("c", "tell me a joke").await;
    assert_eq!(answered.text(), Some("reply to: tell me a joke"));
}

#[tokio::test]
async fn test_idle_sessions_evicted_with_history() {
    let mut config = test_config();
    config.session.idle_horizon = Duration::from_secs(60);
    let h = Harness::with_config(&config);

    h.coordinator.on_ask("idle", "hello").await;
    h.coordinator.on_join("voice").await;

    assert!(h.coordinator.evict_idle(Instant::now()).await.is_empty());

    let evicted = h
        .coordinator
        .evict_idle(Instant::now() + Duration::from_secs(120))
        .await;

    assert_eq!(evicted, vec!["idle".to_string()]);
    assert!(h.coordinator.memory().is_empty("idle"));
    assert!(h.coordinator.sessions().get("idle").is_none());
    assert!(h.coordinator.sessions().voice_connected("voice"));
}

// Voice path

#[tokio::test]
async fn test_voice_turn_replies_and_speaks() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant what's the weather");

    let outcome = h.speak("c", 500).await;

    assert_eq!(outcome.text(), Some("reply to: what's the weather"));
    assert_eq!(outcome.audio(), Some(&b"reply to: what's the weather"[..]));
    assert_eq!(h.transcriber.calls(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        h.sink.events(),
        vec![
            "start reply to: what's the weather",
            "end reply to: what's the weather",
        ]
    );
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_voice_frames_ignored_without_connection() {
    let h = Harness::new();
    h.transcriber.set_fallback("hey assistant hello");

    let outcome = h.speak("c", 500).await;

    assert!(matches!(outcome, TurnOutcome::Ignored));
    assert_eq!(h.transcriber.calls(), 0);
}

#[tokio::test]
async fn test_short_utterance_discarded_before_transcription() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;

    let outcome = h.speak("c", 100).await;

    assert_eq!(outcome.failure(), Some(FailureKind::CaptureDiscarded));
    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_voice_without_wake_phrase_is_ignored() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.outlet.clear();
    h.transcriber.set_fallback("we were just talking");

    let outcome = h.speak("c", 500).await;

    assert!(matches!(outcome, TurnOutcome::Ignored));
    assert_eq!(h.model.calls(), 0);
    assert!(h.outlet.texts().is_empty());
}

#[tokio::test]
async fn test_transcription_timeout_posts_one_notice() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.outlet.clear();
    h.transcriber.set_delay(Duration::from_secs(1));

    let outcome = h.speak("c", 500).await;

    assert_eq!(outcome.failure(), Some(FailureKind::TranscriptionUnavailable));
    assert_eq!(h.outlet.texts_for("c"), vec![TRANSCRIPTION_NOTICE]);
    assert_eq!(h.model.calls(), 0);
    assert!(h.coordinator.memory().is_empty("c"));
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_synthesis_failure_keeps_text_reply() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.outlet.clear();
    *h.synthesizer.fail.lock().unwrap() = true;
    h.transcriber.set_fallback("hey assistant hello");

    let outcome = h.speak("c", 500).await;

    assert_eq!(outcome.text(), Some("reply to: hello"));
    assert!(outcome.audio().is_none());
    assert_eq!(h.outlet.texts_for("c"), vec!["reply to: hello"]);
    assert_eq!(h.coordinator.memory().len("c"), 2);
}

#[tokio::test]
async fn test_spoken_stop_interrupts_playback() {
    let h = Harness::with_playback(&test_config(), Duration::from_secs(10));
    h.coordinator.on_join("c").await;

    h.transcriber.push(Ok("hey assistant tell me a story".to_string()));
    let told = h.speak("c", 500).await;
    assert!(matches!(told, TurnOutcome::Replied(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.coordinator.playback().is_playing("c"));

    h.transcriber.push(Ok("stop".to_string()));
    let stopped = h.speak("c", 500).await;
    assert!(matches!(stopped, TurnOutcome::Notice(ref t) if t == PLAYBACK_STOPPED));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.sink.events(),
        vec![
            "start reply to: tell me a story",
            "stopped reply to: tell me a story",
        ]
    );
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn test_leave_discards_playback_and_keeps_history() {
    let h = Harness::with_playback(&test_config(), Duration::from_secs(10));
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant hello");
    h.speak("c", 500).await;

    let left = h.coordinator.on_leave("c").await;

    assert!(matches!(left, TurnOutcome::Notice(ref t) if t == "Left the voice channel."));
    assert!(!h.coordinator.sessions().voice_connected("c"));
    assert!(!h.coordinator.playback().is_playing("c"));
    assert_eq!(h.coordinator.memory().len("c"), 2);

    // Leaving twice is a no-op
    assert!(matches!(h.coordinator.on_leave("c").await, TurnOutcome::Ignored));
}

/// Feed a full utterance on a background task
fn speak_in_background(h: &Harness, channel_id: &'static str) -> tokio::task::JoinHandle<TurnOutcome> {
    let coordinator = Arc::clone(&h.coordinator);
    tokio::spawn(async move {
        let mut last = TurnOutcome::Ignored;
        for frame in common::speech(500).into_iter().chain(common::silence(300)) {
            last = coordinator.on_audio_frame(channel_id, frame).await;
        }
        last
    })
}

#[tokio::test]
async fn test_voice_cooldown_window_is_fixed_from_accepted_trigger() {
    let mut config = test_config();
    config.voice.cooldown = Duration::from_millis(500);
    let h = Harness::with_config(&config);
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant what time is it");

    let first = h.speak("c", 500).await;
    assert!(matches!(first, TurnOutcome::Replied(_)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let early = h.speak("c", 500).await;
    assert_eq!(early.failure(), Some(FailureKind::CooldownRejected));

    // The rejected trigger does not extend the window
    tokio::time::sleep(Duration::from_millis(400)).await;
    let later = h.speak("c", 500).await;
    assert!(matches!(later, TurnOutcome::Replied(_)));
    assert_eq!(h.model.calls(), 2);
}

#[tokio::test]
async fn test_voice_wake_starts_cooldown_for_text_wake() {
    let mut config = test_config();
    config.voice.cooldown = Duration::from_secs(5);
    let h = Harness::with_config(&config);
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant one");

    let spoken = h.speak("c", 500).await;
    assert!(matches!(spoken, TurnOutcome::Replied(_)));

    let typed = h.coordinator.on_text_message("c", "hey assistant two").await;
    assert_eq!(typed.failure(), Some(FailureKind::CooldownRejected));
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn test_utterance_from_left_session_is_cancelled() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant hello");

    let utterance = common::speech(500)
        .into_iter()
        .chain(common::silence(300))
        .find_map(|frame| h.coordinator.push_audio_frame("c", frame).unwrap())
        .expect("silence closes the utterance");

    h.coordinator.on_leave("c").await;
    let outcome = h.coordinator.process_utterance(utterance).await;

    assert!(matches!(outcome, TurnOutcome::Cancelled));
    assert!(h.coordinator.sessions().get("c").is_none());
    assert!(h.coordinator.memory().is_empty("c"));
    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn test_utterance_from_reset_session_is_cancelled() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant hello");

    let utterance = common::speech(500)
        .into_iter()
        .chain(common::silence(300))
        .find_map(|frame| h.coordinator.push_audio_frame("c", frame).unwrap())
        .expect("silence closes the utterance");

    h.coordinator.on_reset("c").await;
    let outcome = h.coordinator.process_utterance(utterance).await;

    assert!(matches!(outcome, TurnOutcome::Cancelled));
    assert!(h.coordinator.sessions().voice_connected("c"));
    assert_eq!(h.transcriber.calls(), 0);

    // The new incarnation still takes fresh speech
    let next = h.speak("c", 500).await;
    assert_eq!(next.text(), Some("reply to: hello"));
}

#[tokio::test]
async fn test_leave_during_capture_discards_buffer() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.transcriber.set_fallback("hey assistant hello");

    for frame in common::speech(500) {
        h.coordinator.on_audio_frame("c", frame).await;
    }
    assert_eq!(h.coordinator.state("c"), PipelineState::Capturing);

    h.coordinator.on_leave("c").await;
    h.coordinator.on_join("c").await;
    for frame in common::silence(300) {
        let outcome = h.coordinator.on_audio_frame("c", frame).await;
        assert!(matches!(outcome, TurnOutcome::Ignored));
    }

    assert_eq!(h.transcriber.calls(), 0);
    assert_eq!(h.coordinator.state("c"), PipelineState::Listening);
}

#[tokio::test]
async fn test_leave_during_inference_cancels_turn() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.model.set_delay(Duration::from_millis(300));
    h.transcriber.set_fallback("hey assistant hello");

    let turn = speak_in_background(&h, "c");
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.coordinator.on_leave("c").await;

    assert!(matches!(turn.await.unwrap(), TurnOutcome::Cancelled));
    assert!(h.coordinator.memory().is_empty("c"));
    assert!(h.coordinator.sessions().get("c").is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.sink.events().is_empty());
    assert_eq!(h.synthesizer.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_leave_during_synthesis_plays_nothing() {
    let h = Harness::new();
    h.coordinator.on_join("c").await;
    h.synthesizer.set_delay(Duration::from_millis(300));
    h.transcriber.set_fallback("hey assistant hello");

    let turn = speak_in_background(&h, "c");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.coordinator.state("c"), PipelineState::Replying);
    h.coordinator.on_leave("c").await;

    let outcome = turn.await.unwrap();
    assert!(outcome.audio().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.sink.events().is_empty());
    assert!(!h.coordinator.playback().is_playing("c"));
    assert!(h.coordinator.sessions().get("c").is_none());
}

#[tokio::test]
async fn test_join_with_voice_disabled() {
    let mut config = test_config();
    config.voice.enabled = false;
    let h = Harness::with_config(&config);

    let outcome = h.coordinator.on_join("c").await;

    assert!(matches!(outcome, TurnOutcome::Notice(ref t) if t == "Voice is disabled for this relay."));
    assert!(!h.coordinator.sessions().voice_connected("c"));
}

// Command routing

fn router(h: &Harness) -> CommandRouter {
    CommandRouter::new(
        Arc::clone(&h.coordinator),
        Arc::clone(&h.outlet) as Arc<dyn Channel>,
        "!",
    )
}

#[tokio::test]
async fn test_router_moves_voice_between_channels() {
    let h = Harness::new();
    let router = router(&h);

    let joined = router.dispatch(&message("a", "!join")).await;
    assert!(matches!(joined, TurnOutcome::Notice(ref t) if t.starts_with("Listening for")));
    assert_eq!(router.voice_channel().as_deref(), Some("a"));

    let again = router.dispatch(&message("a", "!join")).await;
    assert!(matches!(again, TurnOutcome::Notice(ref t) if t == "Already listening here."));

    router.dispatch(&message("b", "!join")).await;
    assert_eq!(router.voice_channel().as_deref(), Some("b"));
    assert!(!h.coordinator.sessions().voice_connected("a"));
    assert!(h.coordinator.sessions().voice_connected("b"));

    router.dispatch(&message("b", "!leave")).await;
    assert_eq!(router.voice_channel(), None);
}

#[tokio::test]
async fn test_router_dispatches_commands_and_messages() {
    let h = Harness::new();
    let router = router(&h);

    let help = router.dispatch(&message("c", "!help")).await;
    assert!(matches!(help, TurnOutcome::Notice(ref t) if t.contains("!ask")));

    let asked = router.dispatch(&message("c", "!ask what is 2+2")).await;
    assert_eq!(asked.text(), Some("reply to: what is 2+2"));

    let woke = router
        .dispatch(&message("c", "hey assistant say hi"))
        .await;
    assert_eq!(woke.text(), Some("reply to: say hi"));

    let reset = router.dispatch(&message("c", "!RESET")).await;
    assert!(matches!(reset, TurnOutcome::Notice(_)));
    assert!(h.coordinator.memory().is_empty("c"));
}
