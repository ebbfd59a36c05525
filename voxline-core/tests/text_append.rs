use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use voxline_core::chat::FAILURE_NOTICE;
use voxline_core::{drive_response, ChatMode, Conversations, TextEvent, UpdateKind, VoxlineError};

fn store() -> Arc<Mutex<Conversations>> {
    Arc::new(Mutex::new(Conversations::new()))
}

/// Let every spawned driver apply what is already queued for it.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn interleaved_replies_stay_in_their_own_sessions() {
    let store = store();
    let (math, chef) = {
        let mut chats = store.lock();
        let math = chats.create_session(ChatMode::Math);
        let chef = chats.create_session(ChatMode::Chef);
        chats.push_user_message(&math, "what is 2+2", None).unwrap();
        chats.push_user_message(&chef, "how do I boil an egg", None).unwrap();
        (math, chef)
    };
    let mut updates = store.lock().subscribe();

    let (math_tx, math_rx) = mpsc::channel(16);
    let (chef_tx, chef_rx) = mpsc::channel(16);
    let math_task = tokio::spawn(drive_response(Arc::clone(&store), math.clone(), math_rx));
    let chef_task = tokio::spawn(drive_response(Arc::clone(&store), chef.clone(), chef_rx));

    let script = [
        (&math_tx, TextEvent::Delta("2+2".into())),
        (&chef_tx, TextEvent::Delta("Boil water, ".into())),
        (&math_tx, TextEvent::Delta(" = 4".into())),
        (&chef_tx, TextEvent::Delta("then wait 9 minutes.".into())),
        (&chef_tx, TextEvent::Done),
        (&math_tx, TextEvent::Done),
    ];
    for (tx, event) in script {
        tx.send(event).await.unwrap();
        settle().await;
    }

    let math_out = math_task.await.unwrap().unwrap();
    let chef_out = chef_task.await.unwrap().unwrap();
    assert_eq!(math_out.kind, UpdateKind::Final);
    assert_eq!(chef_out.kind, UpdateKind::Final);

    {
        let chats = store.lock();
        let math_session = chats.session(&math).unwrap();
        let chef_session = chats.session(&chef).unwrap();
        assert_eq!(math_session.message(&math_out.message_id).unwrap().text, "2+2 = 4");
        assert_eq!(
            chef_session.message(&chef_out.message_id).unwrap().text,
            "Boil water, then wait 9 minutes."
        );
        assert!(math_session.message(&chef_out.message_id).is_none());
        assert_eq!(math_session.messages.len(), 2);
        assert_eq!(chef_session.messages.len(), 2);
    }

    // The store saw the two replies alternate, each update carrying the full
    // text of its own message.
    let (m, c) = (math.as_str(), chef.as_str());
    let seen: Vec<(String, String, UpdateKind)> = std::iter::from_fn(|| updates.try_recv().ok())
        .map(|e| (e.session_id, e.text, e.kind))
        .collect();
    let expected = [
        (m, "", UpdateKind::Streaming),
        (m, "2+2", UpdateKind::Streaming),
        (c, "", UpdateKind::Streaming),
        (c, "Boil water, ", UpdateKind::Streaming),
        (m, "2+2 = 4", UpdateKind::Streaming),
        (c, "Boil water, then wait 9 minutes.", UpdateKind::Streaming),
        (c, "Boil water, then wait 9 minutes.", UpdateKind::Final),
        (m, "2+2 = 4", UpdateKind::Final),
    ]
    .map(|(s, t, k)| (s.to_string(), t.to_string(), k));
    assert_eq!(seen, expected);
}

#[test]
fn deltas_alternating_between_sessions_land_by_message_id() {
    let mut chats = Conversations::new();
    let a = chats.create_session(ChatMode::Default);
    let b = chats.create_session(ChatMode::Default);
    chats.push_user_message(&a, "one", None).unwrap();
    chats.push_user_message(&b, "two", None).unwrap();
    let a_reply = chats.begin_response(&a).unwrap();
    let b_reply = chats.begin_response(&b).unwrap();
    let mut updates = chats.subscribe();

    chats.append_delta(&a, &a_reply, "a1").unwrap();
    chats.append_delta(&b, &b_reply, "b1").unwrap();
    chats.append_delta(&a, &a_reply, "a2").unwrap();

    assert_eq!(chats.session(&a).unwrap().message(&a_reply).unwrap().text, "a1a2");
    assert_eq!(chats.session(&b).unwrap().message(&b_reply).unwrap().text, "b1");
    assert!(matches!(
        chats.append_delta(&a, &b_reply, "x"),
        Err(VoxlineError::UnknownResponse { .. })
    ));

    let order: Vec<(String, String)> = std::iter::from_fn(|| updates.try_recv().ok())
        .map(|e| (e.session_id, e.text))
        .collect();
    assert_eq!(
        order,
        vec![
            (a.to_string(), "a1".to_string()),
            (b.to_string(), "b1".to_string()),
            (a.to_string(), "a1a2".to_string()),
        ]
    );
}

#[tokio::test]
async fn late_delta_after_completion_is_rejected() {
    let store = store();
    let id = {
        let mut chats = store.lock();
        let id = chats.create_session(ChatMode::Coder);
        chats.push_user_message(&id, "write fizzbuzz", None).unwrap();
        id
    };

    let (tx, rx) = mpsc::channel(4);
    tx.send(TextEvent::Delta("for i in 1..=100".into())).await.unwrap();
    tx.send(TextEvent::Done).await.unwrap();
    let outcome = drive_response(Arc::clone(&store), id.clone(), rx).await.unwrap();

    let mut chats = store.lock();
    let err = chats
        .append_delta(&id, &outcome.message_id, " {}")
        .unwrap_err();
    assert!(matches!(err, VoxlineError::UnknownResponse { .. }));
    assert_eq!(
        chats.session(&id).unwrap().message(&outcome.message_id).unwrap().text,
        "for i in 1..=100"
    );
}

#[tokio::test]
async fn failure_in_one_session_leaves_the_other_streaming() {
    let store = store();
    let (a, b) = {
        let mut chats = store.lock();
        let a = chats.create_session(ChatMode::Default);
        let b = chats.create_session(ChatMode::Default);
        chats.push_user_message(&a, "first", None).unwrap();
        chats.push_user_message(&b, "second", None).unwrap();
        (a, b)
    };

    let (a_tx, a_rx) = mpsc::channel(4);
    let (b_tx, b_rx) = mpsc::channel(4);
    let a_task = tokio::spawn(drive_response(Arc::clone(&store), a.clone(), a_rx));
    let b_task = tokio::spawn(drive_response(Arc::clone(&store), b.clone(), b_rx));

    a_tx.send(TextEvent::Delta("partial".into())).await.unwrap();
    settle().await;
    b_tx.send(TextEvent::Delta("still ".into())).await.unwrap();
    settle().await;
    a_tx.send(TextEvent::Error("connection reset".into())).await.unwrap();

    let a_out = a_task.await.unwrap().unwrap();
    assert_eq!(a_out.kind, UpdateKind::Failed);
    assert!(store.lock().is_responding(&b), "other reply still streaming");

    b_tx.send(TextEvent::Delta("going".into())).await.unwrap();
    b_tx.send(TextEvent::Done).await.unwrap();
    let b_out = b_task.await.unwrap().unwrap();

    let chats = store.lock();
    assert_eq!(
        chats.session(&a).unwrap().message(&a_out.message_id).unwrap().text,
        FAILURE_NOTICE
    );
    assert_eq!(
        chats.session(&b).unwrap().message(&b_out.message_id).unwrap().text,
        "still going"
    );
    assert!(!chats.is_responding(&a));
    assert!(!chats.is_responding(&b));
}
