//! End-to-end coverage driving the orchestrator the way a real client
//! would, without any real transport: frames go in as JSON strings, replies
//! come out over the session's outbound channel.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use axum::extract::ws::Message;
use relay_rs::config::Settings;
use relay_rs::event::test_support::{new_keypair, signed_event, signed_event_with_keypair};
use relay_rs::event::Tag;
use relay_rs::kind;
use relay_rs::orchestrator::RelayOrchestrator;
use relay_rs::session::{self, InboundHandler, SessionHandle};
use relay_rs::storage::memory::MemoryStore;
use relay_rs::storage::Storage;

fn settings() -> Settings {
    Settings::parse_from(["relay-rs"])
}

fn ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

async fn session(orch: &RelayOrchestrator) -> (Arc<SessionHandle>, tokio::sync::mpsc::Receiver<Message>) {
    let id = orch.next_session_id();
    let (session, rx) = session::new_session(id, "127.0.0.1:1".into(), ip());
    orch.register_session(session.clone()).await;
    (session, rx)
}

fn text_of(message: Message) -> String {
    match message {
        Message::Text(t) => t,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn count_reports_cardinality_ignoring_limit() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    for content in ["a", "b", "c"] {
        let e = signed_event(1, content, vec![], 1000);
        orch.handle_text(&sess, &format!(r#"["EVENT",{}]"#, serde_json::to_string(&e).unwrap())).await;
        let _ = rx.recv().await;
    }
    orch.handle_text(&sess, r#"["COUNT","c1",{"kinds":[1],"limit":1}]"#).await;
    let reply = text_of(rx.recv().await.unwrap());
    assert_eq!(reply, r#"["COUNT","c1",{"count":3}]"#);
}

#[tokio::test]
async fn count_with_no_filters_is_refused_with_closed() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    orch.handle_text(&sess, r#"["COUNT","c1"]"#).await;
    let reply = text_of(rx.recv().await.unwrap());
    assert!(reply.starts_with(r#"["CLOSED","c1""#));
}

#[tokio::test]
async fn auth_event_is_validated_and_never_stored() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    let keypair = new_keypair();
    let auth = signed_event_with_keypair(&keypair, kind::AUTH, "challenge-string", vec![], 1000);
    orch.handle_text(&sess, &format!(r#"["AUTH",{}]"#, serde_json::to_string(&auth).unwrap())).await;
    let reply = text_of(rx.recv().await.unwrap());
    assert!(reply.contains("authenticated"));

    let got = orch.storage().get(&auth.id, &relay_rs::cancel::CancelToken::new()).await;
    assert!(got.is_err(), "auth events must never be persisted");
}

#[tokio::test]
async fn close_removes_the_subscription_so_later_events_are_not_delivered() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    orch.handle_text(&sess, r#"["REQ","s",{}]"#).await;
    let _ = rx.recv().await; // EOSE
    orch.handle_text(&sess, r#"["CLOSE","s"]"#).await;

    let e = signed_event(1, "after close", vec![], 1000);
    orch.handle_text(&sess, &format!(r#"["EVENT",{}]"#, serde_json::to_string(&e).unwrap())).await;
    let ok = text_of(rx.recv().await.unwrap());
    assert!(ok.contains("true"));
    let nothing_else = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    assert!(nothing_else.is_err(), "closed subscription must not receive further events");
}

#[tokio::test]
async fn vanish_request_tombstones_every_event_from_that_author() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    let keypair = new_keypair();
    let e1 = signed_event_with_keypair(&keypair, 1, "one", vec![], 1000);
    let e2 = signed_event_with_keypair(&keypair, 1, "two", vec![], 1001);
    for e in [&e1, &e2] {
        orch.handle_text(&sess, &format!(r#"["EVENT",{}]"#, serde_json::to_string(e).unwrap())).await;
        let _ = rx.recv().await;
    }

    let vanish = signed_event_with_keypair(
        &keypair,
        kind::VANISH_REQUEST,
        "",
        vec![Tag::new(vec!["relay".into(), "ALL_RELAYS".into()])],
        1002,
    );
    orch.handle_text(&sess, &format!(r#"["EVENT",{}]"#, serde_json::to_string(&vanish).unwrap())).await;
    let reply = text_of(rx.recv().await.unwrap());
    assert!(reply.contains("Request to Vanish processed"));

    let cancel = relay_rs::cancel::CancelToken::new();
    assert!(orch.storage().get(&e1.id, &cancel).await.is_err());
    assert!(orch.storage().get(&e2.id, &cancel).await.is_err());
}

#[tokio::test]
async fn addressable_replaceable_events_key_on_pubkey_kind_and_d_tag() {
    let orch = RelayOrchestrator::new(Arc::new(MemoryStore::new()), settings());
    let (sess, mut rx) = session(&orch).await;
    let keypair = new_keypair();
    let first = signed_event_with_keypair(
        &keypair,
        30023,
        "draft",
        vec![Tag::new(vec!["d".into(), "article-1".into()])],
        1000,
    );
    let updated = signed_event_with_keypair(
        &keypair,
        30023,
        "published",
        vec![Tag::new(vec!["d".into(), "article-1".into()])],
        2000,
    );
    for e in [&first, &updated] {
        orch.handle_text(&sess, &format!(r#"["EVENT",{}]"#, serde_json::to_string(e).unwrap())).await;
        let _ = rx.recv().await;
    }
    let cancel = relay_rs::cancel::CancelToken::new();
    assert!(orch.storage().get(&first.id, &cancel).await.is_err());
    let fetched = orch.storage().get(&updated.id, &cancel).await.unwrap();
    assert_eq!(fetched.content, "published");
}
