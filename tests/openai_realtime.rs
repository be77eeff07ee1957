//! End-to-end protocol tests for the OpenAI Realtime translator against
//! an in-process WebSocket stub.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use voicelink::{
    ContextItem, OpenAiRealtime, Role, S2sProvider, S2sSession, SessionConfig, SpeechError,
    ToolDefinition, VoiceProfile,
};

use common::{recv_timeout, start_ws_stub, wait_closed};

async fn connect(stub_url: &str, config: SessionConfig) -> voicelink::OpenAiSession {
    OpenAiRealtime::new("sk-test")
        .with_base_url(stub_url)
        .connect(&CancellationToken::new(), config)
        .await
        .expect("connect failed")
}

#[tokio::test]
async fn initial_session_update_and_auth_headers() {
    let mut stub = start_ws_stub().await;
    let config = SessionConfig::default()
        .with_instructions("Be brief.")
        .with_voice(VoiceProfile::new("alloy", "Alloy", "openai"))
        .with_tools(vec![ToolDefinition::new("cast_spell", "Casts a spell")]);
    let session = connect(&stub.url, config).await;

    assert_eq!(
        stub.header("authorization").as_deref(),
        Some("Bearer sk-test")
    );
    assert_eq!(stub.header("openai-beta").as_deref(), Some("realtime=v1"));

    let update = stub.next_frame().await;
    assert_eq!(
        update,
        json!({
            "type": "session.update",
            "session": {
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "voice": "alloy",
                "instructions": "Be brief.",
                "tools": [{
                    "type": "function",
                    "name": "cast_spell",
                    "description": "Casts a spell",
                    "parameters": {}
                }]
            }
        })
    );

    session.close().await;
}

#[tokio::test]
async fn transcript_deltas_assemble_into_one_entry() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;
    let mut transcripts = session.take_transcripts().expect("transcript stream");

    stub.send(json!({ "type": "response.audio_transcript.delta", "delta": "Hello " }));
    stub.send(json!({ "type": "response.audio_transcript.delta", "delta": "world!" }));
    stub.send(json!({ "type": "response.audio_transcript.done" }));

    let entry = recv_timeout(&mut transcripts).await.expect("entry");
    assert_eq!(entry.text, "Hello world!");
    assert!(entry.is_npc());
    assert_eq!(entry.speaker_id, "assistant");
    assert_eq!(entry.npc_id.as_deref(), Some("openai"));

    // The accumulator was swapped out: a bare done emits nothing.
    stub.send(json!({ "type": "response.audio_transcript.done" }));
    stub.send(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "transcript": "who goes there"
    }));
    let entry = recv_timeout(&mut transcripts).await.expect("user entry");
    assert_eq!(entry.text, "who goes there");
    assert!(!entry.is_npc());

    session.close().await;
}

#[tokio::test]
async fn tool_call_emits_output_then_response_create() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session.on_tool_call(Arc::new(|name: &str, args: &str| {
        assert_eq!(name, "cast_spell");
        assert_eq!(args, r#"{"spell":"fireball"}"#);
        Ok(r#"{"result":"ok"}"#.to_string())
    }));

    stub.send(json!({
        "type": "response.function_call_arguments.done",
        "name": "cast_spell",
        "arguments": "{\"spell\":\"fireball\"}",
        "call_id": "c1"
    }));

    let output = stub.next_frame().await;
    assert_eq!(output["type"], "conversation.item.create");
    assert_eq!(output["item"]["type"], "function_call_output");
    assert_eq!(output["item"]["call_id"], "c1");
    assert_eq!(output["item"]["output"], "{\"result\":\"ok\"}");

    let follow_up = stub.next_frame().await;
    assert_eq!(follow_up, json!({ "type": "response.create" }));

    session.close().await;
}

#[tokio::test]
async fn tool_handler_error_is_folded_into_output() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session.on_tool_call(Arc::new(|_: &str, _: &str| Err("spell fizzled".to_string())));

    stub.send(json!({
        "type": "response.function_call_arguments.done",
        "name": "cast_spell",
        "arguments": "{}",
        "call_id": "c9"
    }));

    let output = stub.next_frame().await;
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(output["item"]["output"].as_str().unwrap())
            .unwrap(),
        json!({ "error": "spell fizzled" })
    );
    let follow_up = stub.next_frame().await;
    assert_eq!(follow_up["type"], "response.create");

    session.close().await;
}

#[tokio::test]
async fn inject_text_context_maps_roles_and_content_types() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session
        .inject_text_context(vec![
            ContextItem::new(Role::User, "Dragon!"),
            ContextItem::new(Role::Assistant, "Got it."),
            ContextItem::new(Role::System, "Stay in character."),
            ContextItem::new(Role::Model, "I am the narrator."),
        ])
        .await
        .unwrap();

    let first = stub.next_frame().await;
    assert_eq!(first["type"], "conversation.item.create");
    assert_eq!(first["item"]["type"], "message");
    assert_eq!(first["item"]["role"], "user");
    assert_eq!(first["item"]["content"][0]["type"], "input_text");
    assert_eq!(first["item"]["content"][0]["text"], "Dragon!");

    let second = stub.next_frame().await;
    assert_eq!(second["item"]["role"], "assistant");
    assert_eq!(second["item"]["content"][0]["type"], "text");

    let third = stub.next_frame().await;
    assert_eq!(third["item"]["role"], "system");
    assert_eq!(third["item"]["content"][0]["type"], "input_text");

    let fourth = stub.next_frame().await;
    assert_eq!(fourth["item"]["role"], "user");

    session.close().await;
}

#[tokio::test]
async fn mid_session_reconfiguration_keeps_audio_formats() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session
        .set_tools(vec![ToolDefinition::new("open_door", "Opens a door")])
        .await
        .unwrap();
    let frame = stub.next_frame().await;
    assert_eq!(
        frame,
        json!({
            "type": "session.update",
            "session": {
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "tools": [{
                    "type": "function",
                    "name": "open_door",
                    "description": "Opens a door",
                    "parameters": {}
                }]
            }
        })
    );

    session.update_instructions("Now whisper.").await.unwrap();
    let frame = stub.next_frame().await;
    assert_eq!(
        frame,
        json!({
            "type": "session.update",
            "session": {
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "instructions": "Now whisper."
            }
        })
    );

    session.close().await;
}

#[tokio::test]
async fn interrupt_sends_response_cancel() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session.interrupt().await.unwrap();
    assert_eq!(stub.next_frame().await, json!({ "type": "response.cancel" }));

    session.close().await;
}

#[tokio::test]
async fn send_audio_appends_base64_pcm() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    session.send_audio(&[9, 8, 7, 6]).await.unwrap();

    let frame = stub.next_frame().await;
    assert_eq!(frame["type"], "input_audio_buffer.append");
    assert_eq!(
        BASE64.decode(frame["audio"].as_str().unwrap()).unwrap(),
        vec![9, 8, 7, 6]
    );

    session.close().await;
}

#[tokio::test]
async fn audio_deltas_skip_invalid_payloads() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;
    let mut audio = session.take_audio().expect("audio stream");

    stub.send(json!({ "type": "response.audio.delta", "delta": "%%%" }));
    stub.send(json!({ "type": "response.audio.delta", "delta": "" }));
    stub.send(json!({ "type": "response.audio.delta", "delta": BASE64.encode([5, 5]) }));

    let chunk = recv_timeout(&mut audio).await.expect("audio chunk");
    assert_eq!(chunk, vec![5, 5]);
    assert!(session.last_error().is_none());

    session.close().await;
}

#[tokio::test]
async fn server_error_event_reaches_handler() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;

    let (err_tx, mut err_rx) = tokio::sync::mpsc::channel::<SpeechError>(4);
    session.on_error(Arc::new(move |err| {
        let _ = err_tx.try_send(err);
    }));

    stub.send(json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "message": "bad session" }
    }));

    let err = recv_timeout(&mut err_rx).await.expect("error callback");
    assert!(err.to_string().starts_with("openai: "));
    assert!(err.to_string().contains("bad session"));

    session.close().await;
}

#[tokio::test]
async fn writes_after_close_fail_cleanly() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;
    let mut audio = session.take_audio().expect("audio stream");

    session.close().await;
    session.close().await;
    wait_closed(&mut audio).await;

    for err in [
        session.send_audio(&[1]).await.unwrap_err(),
        session.set_tools(vec![]).await.unwrap_err(),
        session.update_instructions("x").await.unwrap_err(),
        session.interrupt().await.unwrap_err(),
    ] {
        assert_eq!(err, SpeechError::SessionClosed { provider: "openai" });
    }
}

#[tokio::test]
async fn cancelled_token_fails_connect() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = OpenAiRealtime::new("sk-test")
        .with_base_url("ws://127.0.0.1:9")
        .connect(&cancel, SessionConfig::default())
        .await
        .expect_err("connect must fail");
    assert!(matches!(err, SpeechError::Connect { .. }));
}

#[tokio::test]
async fn transport_death_latches_error() {
    let mut stub = start_ws_stub().await;
    let session = connect(&stub.url, SessionConfig::default()).await;
    let _update = stub.next_frame().await;
    let mut transcripts = session.take_transcripts().expect("transcript stream");

    stub.kill();
    wait_closed(&mut transcripts).await;

    assert!(matches!(
        session.last_error(),
        Some(SpeechError::Transport { .. })
    ));
}

#[tokio::test]
async fn capabilities_report_static_limits() {
    let caps = OpenAiRealtime::new("sk-test").capabilities();
    assert!(caps.context_window_tokens > 0);
    assert!(!caps.voices.is_empty());
    assert!(Duration::from_millis(caps.max_session_ms) >= Duration::from_secs(60));
}
