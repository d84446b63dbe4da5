//! Integration tests for parley-server endpoints
//!
//! Router tests run through `oneshot`; the WebSocket tests bind a real
//! listener and talk to it with tokio-tungstenite.

mod helpers;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use helpers::*;
use parley_common::wire::{ClientFrame, ServerFrame};
use parley_common::{
    AnonymousId, CorrelationHandle, Message, MessageContent, MessageKind, MessageStatus,
    MessageStore, OwnerFilter, OwnerRef,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::util::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn reply(owner: OwnerRef, text: &str, minutes_ago: i64) -> Message {
    Message::ai(
        owner,
        CorrelationHandle::generate(),
        MessageContent::AiReply { text: text.into() },
        Utc::now() - ChronoDuration::minutes(minutes_ago),
    )
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = parley_server::build_router(setup_state(setup_store().await));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = extract_json(response.into_body()).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "parley-server");
    assert!(json["version"].is_string());
    assert!(json["build"].is_string());
    assert_eq!(json["store"]["state"], "reachable");
    assert_eq!(json["analyzer"], false);
    assert_eq!(json["auth_exchange"], false);
}

#[tokio::test]
async fn test_health_reports_wired_collaborators() {
    let state = setup_state(setup_store().await)
        .with_analyzer(Arc::new(StubAnalyzer::default()))
        .with_exchange(Arc::new(StubExchange::new(&[])));
    let app = parley_server::build_router(state);

    let json = extract_json(app.oneshot(get("/health")).await.unwrap().into_body()).await;
    assert_eq!(json["analyzer"], true);
    assert_eq!(json["auth_exchange"], true);
}

#[tokio::test]
async fn test_health_is_unavailable_when_store_is_down() {
    let store = setup_store().await;
    store.pool().close().await;
    let app = parley_server::build_router(setup_state(store));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = extract_json(response.into_body()).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["store"]["state"], "unreachable");
    assert!(json["store"]["error"].is_string());
}

// =============================================================================
// History
// =============================================================================

#[tokio::test]
async fn test_messages_require_an_owner() {
    let app = parley_server::build_router(setup_state(setup_store().await));

    let response = app.oneshot(get("/api/messages")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = extract_json(response.into_body()).await;
    assert!(json["error"].as_str().unwrap().contains("anonymous"));
}

#[tokio::test]
async fn test_messages_reject_malformed_anonymous_id() {
    let app = parley_server::build_router(setup_state(setup_store().await));

    let response = app
        .oneshot(get("/api/messages?anonymous=not-a-uuid"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_messages_list_combined_owners_in_order() {
    let store = setup_store().await;
    let anon = AnonymousId::generate();
    let alice = user("alice");

    store.insert(reply(OwnerRef::User(alice.clone()), "second", 5)).await.unwrap();
    store.insert(reply(OwnerRef::Anonymous(anon), "first", 10)).await.unwrap();
    store.insert(reply(OwnerRef::User(user("bob")), "not mine", 7)).await.unwrap();
    store.insert(reply(OwnerRef::Anonymous(anon), "third", 1)).await.unwrap();

    let app = parley_server::build_router(setup_state(store));
    let uri = format!("/api/messages?anonymous={}&user=alice", anon);
    let response = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let rows: Vec<Message> =
        serde_json::from_value(extract_json(response.into_body()).await).unwrap();
    let texts: Vec<_> = rows.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

// =============================================================================
// Live feed
// =============================================================================

#[tokio::test]
async fn test_event_stream_delivers_matching_inserts() {
    let store = setup_store().await;
    let alice = OwnerRef::User(user("alice"));
    let app = parley_server::build_router(setup_state(store.clone()));

    let response = app.oneshot(get("/api/messages/events?user=alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.into_body().into_data_stream();
    let mut received = String::new();
    let mut inserted = false;
    let read = async {
        while !received.contains("MessageInserted") {
            if received.contains("connected") && !inserted {
                store.insert(reply(OwnerRef::User(user("bob")), "bob-only", 0)).await.unwrap();
                store.insert(reply(alice.clone(), "alice-only", 0)).await.unwrap();
                inserted = true;
            }
            match body.next().await {
                Some(Ok(chunk)) => received.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("no insert event within 5s");

    assert!(received.contains("event: ConnectionStatus"));
    assert!(received.contains("event: MessageInserted"));
    assert!(received.contains("\"alice-only\""));
    assert!(!received.contains("\"bob-only\""));
}

// =============================================================================
// Auth callback
// =============================================================================

fn location(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
}

#[tokio::test]
async fn test_callback_merges_anonymous_history_and_redirects() {
    let store = setup_store().await;
    let anon = AnonymousId::generate();
    store.insert(reply(OwnerRef::Anonymous(anon), "hello", 3)).await.unwrap();
    store.insert(reply(OwnerRef::Anonymous(anon), "again", 2)).await.unwrap();

    let state = setup_state(store.clone())
        .with_exchange(Arc::new(StubExchange::new(&[("good-code", "alice")])));
    let app = parley_server::build_router(state);

    let uri = format!("/auth/callback?code=good-code&temp_user_id={}", anon);
    let response = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), ORIGIN);

    let mine = store
        .select(&OwnerFilter::single(OwnerRef::User(user("alice"))))
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);
    let leftover = store
        .select(&OwnerFilter::single(OwnerRef::Anonymous(anon)))
        .await
        .unwrap();
    assert!(leftover.is_empty());
    assert_eq!(store.find_merge(&anon).await.unwrap().unwrap().user_id, user("alice"));
}

#[tokio::test]
async fn test_callback_repeated_is_harmless() {
    let store = setup_store().await;
    let anon = AnonymousId::generate();
    store.insert(reply(OwnerRef::Anonymous(anon), "hello", 3)).await.unwrap();

    let state = setup_state(store.clone())
        .with_exchange(Arc::new(StubExchange::new(&[("code", "alice")])));
    let uri = format!("/auth/callback?code=code&temp_user_id={}", anon);

    for _ in 0..2 {
        let app = parley_server::build_router(state.clone());
        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    let mine = store
        .select(&OwnerFilter::single(OwnerRef::User(user("alice"))))
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn test_callback_failures_still_redirect() {
    let store = setup_store().await;
    let anon = AnonymousId::generate();
    store.insert(reply(OwnerRef::Anonymous(anon), "hello", 3)).await.unwrap();

    let state = setup_state(store.clone())
        .with_exchange(Arc::new(StubExchange::new(&[("code", "alice")])));

    let uris = [
        "/auth/callback".to_string(),
        format!("/auth/callback?code=expired&temp_user_id={}", anon),
        "/auth/callback?code=code&temp_user_id=garbage".to_string(),
    ];
    for uri in &uris {
        let app = parley_server::build_router(state.clone());
        let response = app.oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "for {}", uri);
        assert_eq!(location(&response), ORIGIN);
    }

    // none of the above could merge the token
    assert!(store.find_merge(&anon).await.unwrap().is_none());
}

#[tokio::test]
async fn test_callback_without_exchange_redirects() {
    let app = parley_server::build_router(setup_state(setup_store().await));
    let response = app.oneshot(get("/auth/callback?code=abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

// =============================================================================
// WebSocket
// =============================================================================

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(state: parley_server::AppState) -> Socket {
    let addr = spawn_server(state).await;
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Should connect to /ws");
    socket
}

async fn send_audio(socket: &mut Socket, owner: &OwnerRef, audio: &str) -> CorrelationHandle {
    use base64::prelude::*;
    let handle = CorrelationHandle::generate();
    let frame = ClientFrame::Audio {
        handle,
        payload: format!("data:audio/wav;base64,{}", BASE64_STANDARD.encode(audio)),
        owner: owner.clone(),
        duration: 1.2,
        reference: Some(format!("blob:{}", audio)),
    };
    socket
        .send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
        .await
        .unwrap();
    handle
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).expect("Should parse server frame");
        }
    }
}

/// Poll the store until `count` rows exist for `owner`
async fn rows_for(store: &dyn MessageStore, owner: OwnerRef, count: usize) -> Vec<Message> {
    let filter = OwnerFilter::single(owner);
    for _ in 0..100 {
        let rows = store.select(&filter).await.unwrap();
        if rows.len() >= count {
            return rows;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} rows", count);
}

#[tokio::test]
async fn test_ws_round_trip_persists_correlated_rows() {
    let store = setup_store().await;
    let state = setup_state(store.clone()).with_analyzer(Arc::new(StubAnalyzer::default()));
    let mut socket = connect(state).await;

    let owner = OwnerRef::Anonymous(AnonymousId::generate());
    let handle = send_audio(&mut socket, &owner, "hi there").await;

    match next_frame(&mut socket).await {
        ServerFrame::Transcription { handle: h, text, analysis } => {
            assert_eq!(h, handle);
            assert_eq!(text, "[calm] hi there");
            assert!(analysis.unwrap().starts_with("Communication Tip:"));
        }
        other => panic!("expected transcription, got {:?}", other),
    }
    match next_frame(&mut socket).await {
        ServerFrame::AiReply { handle: h, text } => {
            assert_eq!(h, handle);
            assert_eq!(text, "You said [calm] hi there");
        }
        other => panic!("expected ai_reply, got {:?}", other),
    }

    let rows = rows_for(store.as_ref(), owner, 3).await;
    let kinds: Vec<_> = rows.iter().map(|m| m.kind()).collect();
    assert_eq!(
        kinds,
        vec![MessageKind::UserAudio, MessageKind::AiAnalysis, MessageKind::AiReply]
    );
    assert!(rows.iter().all(|m| m.handle == Some(handle)));
    assert!(rows.iter().all(|m| m.status == MessageStatus::Completed));
    assert_eq!(rows[0].transcription(), Some("[calm] hi there"));
    match &rows[0].content {
        MessageContent::UserAudio { reference, .. } => assert_eq!(reference, "blob:hi there"),
        other => panic!("unexpected content {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_results_may_finish_out_of_order() {
    let store = setup_store().await;
    let analyzer = Arc::new(StubAnalyzer::default());
    let slow = analyzer.gate(b"slow one");
    let state = setup_state(store).with_analyzer(analyzer.clone());
    let mut socket = connect(state).await;

    let owner = OwnerRef::User(user("alice"));
    let first = send_audio(&mut socket, &owner, "slow one").await;
    let second = send_audio(&mut socket, &owner, "quick one").await;

    // second submission answers fully while the first is held
    assert_eq!(next_frame(&mut socket).await.handle(), second);
    assert_eq!(next_frame(&mut socket).await.handle(), second);

    slow.notify_one();
    let frame = next_frame(&mut socket).await;
    assert_eq!(frame.handle(), first);
    assert_eq!(frame.frame_type(), "transcription");
}

#[tokio::test]
async fn test_ws_without_analyzer_answers_with_error() {
    let mut socket = connect(setup_state(setup_store().await)).await;
    let owner = OwnerRef::Anonymous(AnonymousId::generate());
    let handle = send_audio(&mut socket, &owner, "hello").await;

    match next_frame(&mut socket).await {
        ServerFrame::Error { handle: h, reason } => {
            assert_eq!(h, handle);
            assert!(reason.contains("not configured"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_bad_payload_errors_only_that_submission() {
    let store = setup_store().await;
    let state = setup_state(store).with_analyzer(Arc::new(StubAnalyzer::default()));
    let mut socket = connect(state).await;
    let owner = OwnerRef::Anonymous(AnonymousId::generate());

    let bad = CorrelationHandle::generate();
    let frame = ClientFrame::Audio {
        handle: bad,
        payload: "data:audio/wav;base64,@@not base64@@".into(),
        owner: owner.clone(),
        duration: 1.0,
        reference: None,
    };
    socket
        .send(WsMessage::Text(serde_json::to_string(&frame).unwrap()))
        .await
        .unwrap();

    match next_frame(&mut socket).await {
        ServerFrame::Error { handle, .. } => assert_eq!(handle, bad),
        other => panic!("expected error, got {:?}", other),
    }

    // socket stays usable
    let good = send_audio(&mut socket, &owner, "still here").await;
    assert_eq!(next_frame(&mut socket).await.handle(), good);
}

#[tokio::test]
async fn test_ws_reply_failure_after_transcription_reports_error() {
    let store = setup_store().await;
    let analyzer = StubAnalyzer::failing_replies();
    let state = setup_state(store.clone()).with_analyzer(Arc::new(analyzer));
    let mut socket = connect(state).await;
    let owner = OwnerRef::Anonymous(AnonymousId::generate());
    let handle = send_audio(&mut socket, &owner, "hello").await;

    assert_eq!(next_frame(&mut socket).await.frame_type(), "transcription");
    match next_frame(&mut socket).await {
        ServerFrame::Error { handle: h, reason } => {
            assert_eq!(h, handle);
            assert!(reason.contains("reply failed"));
        }
        other => panic!("expected error, got {:?}", other),
    }

    // transcription and analysis are still kept
    let rows = rows_for(store.as_ref(), owner, 2).await;
    assert!(rows.iter().all(|m| m.kind() != MessageKind::AiReply));
}

#[tokio::test]
async fn test_ws_late_anonymous_submission_lands_with_merged_user() {
    let store = setup_store().await;
    let anon = AnonymousId::generate();
    let alice = user("alice");
    store.reassign_ownership(&anon, &alice).await.unwrap();

    let state = setup_state(store.clone()).with_analyzer(Arc::new(StubAnalyzer::default()));
    let mut socket = connect(state).await;
    send_audio(&mut socket, &OwnerRef::Anonymous(anon), "sent before login").await;
    next_frame(&mut socket).await;
    next_frame(&mut socket).await;

    let rows = rows_for(store.as_ref(), OwnerRef::User(alice), 3).await;
    assert_eq!(rows.len(), 3);
    let orphaned = store
        .select(&OwnerFilter::single(OwnerRef::Anonymous(anon)))
        .await
        .unwrap();
    assert!(orphaned.is_empty());
}
