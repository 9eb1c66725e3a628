//! End-to-end integration tests for the chatweave generation pipeline.
//!
//! These tests drive the full path from a conversation through packing, a
//! scripted transport and the streaming session into the chat history.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatweave_config::{ApiStyle, AppConfig};
use chatweave_core::error::{Error, PackError, SwipeError, TransportError};
use chatweave_core::event::{GenerationType, SessionEvent, SessionState};
use chatweave_core::message::{ChatHistory, Message, Role};
use chatweave_core::transport::{PromptPayload, TransportChunk};
use chatweave_engine::context::predicate;
use chatweave_engine::{
    ConversationContext, InjectionPosition, InjectionRegistry, NormalizeOptions,
    OutputNormalizer, TokenCounter,
};
use chatweave_providers::{OpenAiCompatTransport, ScriptedTransport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────────────

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.names.character = "Aria".into();
    config.backend.api_style = ApiStyle::Text;
    config
}

fn conversation_with(config: &AppConfig) -> ConversationContext {
    ConversationContext::new(config, Arc::new(TokenCounter::from_config(&config.tokenizer)))
        .with_story("Aria is a wandering bard who answers in rhyme.")
        .with_examples(vec!["User: Hello\nAria: Well met, my friend, well met!".into()])
        .with_history(ChatHistory::from_messages(vec![
            Message::user("User", "Play us a tune."),
            Message::assistant("Aria", "A jig it is, quick on the feet."),
            Message::user("User", "Something slower now."),
        ]))
}

fn conversation() -> ConversationContext {
    conversation_with(&config())
}

fn record(conversation: &mut ConversationContext) -> Arc<Mutex<Vec<SessionEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    conversation.observe(move |event: &SessionEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    log
}

fn count(log: &Mutex<Vec<SessionEvent>>, kind: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|e| e.event_type() == kind)
        .count()
}

fn prompt_text(transport: &ScriptedTransport) -> String {
    match &transport.requests()[0].prompt {
        PromptPayload::Text(text) => text.clone(),
        PromptPayload::Chat(_) => panic!("expected a text prompt"),
    }
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stream_commits_final_text_once() {
    let mut conv = conversation();
    let log = record(&mut conv);
    let transport = ScriptedTransport::from_texts(&["Hi", "Hi there", "Hi there!"]);

    let outcome = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state(), SessionState::Committed);
    assert_eq!(outcome.text(), "Hi there!");
    assert_eq!(conv.history.len(), 4);
    let reply = conv.history.last().unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.name, "Aria");
    assert_eq!(reply.text, "Hi there!");
    assert_eq!(reply.swipe_count(), 1);
    assert!(!reply.extra.cancelled);

    assert_eq!(count(&log, "chunk"), 3);
    assert_eq!(count(&log, "committed"), 1);
    assert!(log.lock().unwrap().last().unwrap().is_terminal());
}

#[tokio::test]
async fn e2e_packed_prompt_reaches_transport() {
    let mut conv = conversation();
    let transport = ScriptedTransport::from_texts(&["Softly now."]);
    conv.generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();

    let prompt = prompt_text(&transport);
    assert!(prompt.starts_with("Aria is a wandering bard who answers in rhyme.\n"));
    assert!(prompt.contains("***\nUser: Hello\nAria: Well met, my friend, well met!\n"));
    assert!(prompt.ends_with("User: Something slower now.\nAria:"));

    let request = &transport.requests()[0];
    assert_eq!(request.stop, vec!["\nUser:"]);
    assert_eq!(request.max_tokens, Some(512));
}

#[tokio::test]
async fn e2e_chat_style_request() {
    let mut config = config();
    config.backend.api_style = ApiStyle::Chat;
    let mut conv = conversation_with(&config);
    let transport = ScriptedTransport::from_texts(&["Softly now."]);
    conv.generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();

    match &transport.requests()[0].prompt {
        PromptPayload::Chat(turns) => {
            assert_eq!(turns[0].role, Role::System);
            let last = turns.last().unwrap();
            assert_eq!(last.role, Role::User);
            assert_eq!(last.name.as_deref(), Some("User"));
            assert!(last.content.contains("Something slower now."));
        }
        PromptPayload::Text(_) => panic!("expected chat turns"),
    }
}

// ── Cancellation and faults ──────────────────────────────────────────────

#[tokio::test]
async fn e2e_cancel_after_second_chunk_keeps_its_text() {
    let mut conv = conversation();
    let log = record(&mut conv);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    conv.observe(move |event: &SessionEvent| {
        if let SessionEvent::Chunk { index: 1, .. } = event {
            trigger.cancel();
        }
    });

    let transport = ScriptedTransport::from_texts(&[
        "Slow",
        "Slow and low",
        "Slow and low, the",
        "Slow and low, the fiddle",
        "Slow and low, the fiddle sings.",
    ]);
    let outcome = conv
        .generate(GenerationType::Normal, &transport, cancel)
        .await
        .unwrap();

    assert_eq!(outcome.state(), SessionState::Stopped);
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.text(), "Slow and low");
    assert_eq!(count(&log, "chunk"), 2);
    assert_eq!(count(&log, "stopped"), 1);

    let reply = conv.history.last().unwrap();
    assert_eq!(reply.text, "Slow and low");
    assert!(reply.extra.cancelled);
    assert!(!conv.is_busy());
}

#[tokio::test]
async fn e2e_cancel_while_backend_is_silent_stops_cleanly() {
    // Accepts the connection and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut config = config();
    config.backend.api_url = format!("http://{addr}/v1");
    let transport = OpenAiCompatTransport::from_config(&config.backend).unwrap();
    let mut conv = conversation_with(&config);
    let log = record(&mut conv);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let outcome = conv
        .generate(GenerationType::Normal, &transport, cancel)
        .await
        .unwrap();

    assert_eq!(outcome.state(), SessionState::Stopped);
    assert_eq!(conv.history.len(), 3);
    assert_eq!(conv.history.last().unwrap().text, "Something slower now.");
    assert_eq!(count(&log, "stopped"), 1);
    assert_eq!(count(&log, "errored"), 0);
    assert!(!conv.is_busy());
}

#[tokio::test]
async fn e2e_mid_stream_fault_keeps_partial_text() {
    let mut conv = conversation();
    let log = record(&mut conv);
    let transport = ScriptedTransport::new(vec![
        TransportChunk::partial("The fiddle"),
        TransportChunk::partial("The fiddle sighs"),
    ])
    .then_fail(TransportError::StreamInterrupted("connection reset".into()));

    let outcome = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state(), SessionState::Errored);
    assert_eq!(conv.history.len(), 4);
    assert_eq!(conv.history.last().unwrap().text, "The fiddle sighs");
    assert_eq!(count(&log, "errored"), 1);
}

#[tokio::test]
async fn e2e_overflow_fails_before_any_request() {
    let mut config = config();
    config.context.max_context = 40;
    config.context.max_response = 10;
    config.context.token_padding = 0;
    let mut conv = conversation_with(&config).with_story("An endless saga. ".repeat(40));
    let transport = ScriptedTransport::from_texts(&["unused"]);

    let err = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Pack(PackError::Overflow {
            segment, ceiling, ..
        }) => {
            assert_eq!(segment, "story");
            assert_eq!(ceiling, 30);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(transport.requests().is_empty());
    assert_eq!(conv.history.len(), 3);
}

// ── Output cleanup ───────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stop_string_trims_committed_text() {
    let mut conv = conversation();
    let transport = ScriptedTransport::from_deltas(&["hello", "\nUser:", " and more"]);
    let outcome = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text(), "hello");
    assert_eq!(conv.history.last().unwrap().text, "hello");
}

#[test]
fn e2e_normalize_stop_string_example() {
    let normalizer = OutputNormalizer::new("User", "Aria");
    let stops = vec!["\nUser:".to_string()];
    let options = NormalizeOptions::new(&stops);
    let once = normalizer.normalize("hello\nUser:", &options);
    assert_eq!(once, "hello");
    assert_eq!(normalizer.normalize(&once, &options), once);
}

#[tokio::test]
async fn e2e_reasoning_block_is_split_off() {
    let mut conv = conversation();
    let transport = ScriptedTransport::from_deltas(&[
        "<think>",
        "They want something slower.",
        "</think>\n",
        "A lullaby, then.",
    ]);
    let outcome = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text(), "A lullaby, then.");
    assert_eq!(
        outcome.result().reasoning.as_deref(),
        Some("They want something slower.")
    );
    let reply = conv.history.last().unwrap();
    assert_eq!(
        reply.extra.reasoning.as_deref(),
        Some("They want something slower.")
    );
}

// ── Swipes, continuation, impersonation ──────────────────────────────────

#[tokio::test]
async fn e2e_swipe_then_delete() {
    let mut conv = conversation();
    let first = ScriptedTransport::from_texts(&["A waltz."]);
    conv.generate(GenerationType::Normal, &first, CancellationToken::new())
        .await
        .unwrap();

    for text in ["A ballad.", "A lament."] {
        let swipe = ScriptedTransport::from_texts(&[text]);
        conv.generate(GenerationType::Swipe, &swipe, CancellationToken::new())
            .await
            .unwrap();
        assert!(!prompt_text(&swipe).contains("A waltz."));
    }

    let reply = conv.history.last_mut().unwrap();
    assert_eq!(reply.swipes, vec!["A waltz.", "A ballad.", "A lament."]);
    assert_eq!(reply.swipe_id, 2);
    assert_eq!(reply.text, "A lament.");

    reply.delete_swipe(1).unwrap();
    assert_eq!(reply.swipe_count(), 2);
    assert!(reply.swipe_id <= 1);
    assert_eq!(reply.text, reply.swipes[reply.swipe_id]);

    reply.delete_swipe(0).unwrap();
    assert!(matches!(reply.delete_swipe(0), Err(SwipeError::LastSwipe)));
}

#[tokio::test]
async fn e2e_extra_candidates_become_swipes() {
    let mut config = config();
    config.backend.candidates = 3;
    let mut conv = conversation_with(&config);
    let mut last = TransportChunk::last("A waltz.");
    last.swipes = vec!["A ballad.".into(), "A lament.".into()];
    let transport = ScriptedTransport::new(vec![last]);

    let outcome = conv
        .generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.result().swipes_added, 2);
    assert_eq!(transport.requests()[0].candidates, 3);

    let reply = conv.history.last().unwrap();
    assert_eq!(reply.swipes, vec!["A waltz.", "A ballad.", "A lament."]);
    assert_eq!(reply.swipe_id, 0);
}

#[tokio::test]
async fn e2e_continue_extends_last_reply() {
    let mut conv = conversation();
    conv.history.push(Message::assistant("Aria", "The moon rose"));
    let transport = ScriptedTransport::from_texts(&[" high", " high above the hill."]);

    let outcome = conv
        .generate(GenerationType::Continue, &transport, CancellationToken::new())
        .await
        .unwrap();

    assert!(prompt_text(&transport).ends_with("Aria: The moon rose"));
    assert_eq!(outcome.text(), "The moon rose high above the hill.");
    assert_eq!(conv.history.len(), 4);
    assert_eq!(
        conv.history.last().unwrap().text,
        "The moon rose high above the hill."
    );
}

#[tokio::test]
async fn e2e_impersonation_leaves_history_alone() {
    let mut conv = conversation();
    let transport = ScriptedTransport::from_texts(&["Play the one about the sea."]);
    let outcome = conv
        .generate(GenerationType::Impersonate, &transport, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text(), "Play the one about the sea.");
    assert_eq!(outcome.result().message_index, None);
    assert_eq!(conv.history.len(), 3);
    assert!(prompt_text(&transport).ends_with("User:"));
    assert_eq!(transport.requests()[0].stop, vec!["\nAria:"]);
}

// ── Packing and injections ───────────────────────────────────────────────

#[tokio::test]
async fn e2e_long_history_fits_ceiling() {
    let mut config = config();
    config.context.max_context = 300;
    config.context.max_response = 50;
    config.context.token_padding = 10;
    let mut conv = conversation_with(&config);
    for i in 0..60 {
        conv.history.push(Message::user("User", format!("Verse {i}, sing it louder.")));
        conv.history
            .push(Message::assistant("Aria", format!("Verse {i} rings out across the hall.")));
    }

    let packed = conv.pack(GenerationType::Normal).await.unwrap();
    assert!(packed.total_tokens() <= 240);
    assert_eq!(packed.ceiling(), 240);
    assert!(packed.text.contains("Verse 59 rings out across the hall."));
    assert!(!packed.text.contains("Verse 0,"));
    assert!(!packed.metadata.drops.is_empty());
}

#[tokio::test(start_paused = true)]
async fn e2e_injections_resolve_in_id_order() {
    let mut registry = InjectionRegistry::new();
    registry.set(
        "b",
        "second",
        InjectionPosition::InChat,
        0,
        Role::System,
        false,
        Some(predicate(|| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            true
        })),
    );
    registry.set(
        "a",
        "first",
        InjectionPosition::InChat,
        0,
        Role::System,
        false,
        Some(predicate(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            true
        })),
    );

    let text = registry
        .resolve(InjectionPosition::InChat, Some(0), None, "\n")
        .await;
    assert_eq!(text, "\nfirst\nsecond\n");
}

#[tokio::test]
async fn e2e_depth_injection_lands_near_the_tail() {
    let mut conv = conversation();
    conv.injections.set(
        "note",
        "[Aria tunes her lute]",
        InjectionPosition::InChat,
        1,
        Role::System,
        false,
        None,
    );
    let transport = ScriptedTransport::from_texts(&["Hush now."]);
    conv.generate(GenerationType::Normal, &transport, CancellationToken::new())
        .await
        .unwrap();

    assert!(prompt_text(&transport).ends_with(
        "[Aria tunes her lute]\nUser: Something slower now.\nAria:"
    ));
    conv.injections.clear_all();
    assert!(conv.injections.is_empty());
}
