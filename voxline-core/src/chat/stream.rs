//! Async driver feeding a streamed text reply into [`Conversations`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chat::{Conversations, MessageId, SessionId};
use crate::error::Result;
use crate::events::UpdateKind;

/// One item of a streamed text reply, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEvent {
    Delta(String),
    Done,
    Error(String),
}

/// How a driven reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOutcome {
    pub message_id: MessageId,
    /// `Final` or `Failed`.
    pub kind: UpdateKind,
}

/// Apply `events` to the reply for `session_id` until it completes or fails.
///
/// The reply is created when the first event arrives. A stream that ends
/// without `Done` or `Error` is treated as failed. The store lock is only
/// held while an event is applied, never across an await.
///
/// # Errors
/// Store errors such as `ResponseInFlight` or a session deleted mid-stream.
pub async fn drive_response(
    store: Arc<Mutex<Conversations>>,
    session_id: SessionId,
    mut events: mpsc::Receiver<TextEvent>,
) -> Result<ResponseOutcome> {
    let mut message_id: Option<MessageId> = None;

    loop {
        let event = events.recv().await;

        let mut chats = store.lock();
        let id = match &message_id {
            Some(id) => id.clone(),
            None => {
                let id = chats.begin_response(&session_id)?;
                message_id = Some(id.clone());
                id
            }
        };

        let kind = match event {
            Some(TextEvent::Delta(delta)) => {
                chats.append_delta(&session_id, &id, &delta)?;
                continue;
            }
            Some(TextEvent::Done) => {
                chats.complete(&session_id, &id)?;
                UpdateKind::Final
            }
            Some(TextEvent::Error(reason)) => {
                chats.fail(&session_id, &id, &reason)?;
                UpdateKind::Failed
            }
            None => {
                chats.fail(&session_id, &id, "stream ended without completion")?;
                UpdateKind::Failed
            }
        };

        return Ok(ResponseOutcome {
            message_id: id,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMode, FAILURE_NOTICE};

    fn store_with_session() -> (Arc<Mutex<Conversations>>, SessionId) {
        let mut chats = Conversations::new();
        let id = chats.create_session(ChatMode::Default);
        chats.push_user_message(&id, "hello", None).unwrap();
        (Arc::new(Mutex::new(chats)), id)
    }

    #[tokio::test]
    async fn deltas_then_done_finalize_text() {
        let (store, id) = store_with_session();
        let (tx, rx) = mpsc::channel(8);
        for event in [
            TextEvent::Delta("Hi ".into()),
            TextEvent::Delta("there".into()),
            TextEvent::Done,
        ] {
            tx.send(event).await.unwrap();
        }

        let outcome = drive_response(Arc::clone(&store), id.clone(), rx).await.unwrap();
        assert_eq!(outcome.kind, UpdateKind::Final);

        let chats = store.lock();
        let text = &chats.session(&id).unwrap().message(&outcome.message_id).unwrap().text;
        assert_eq!(text, "Hi there");
        assert!(!chats.is_responding(&id));
    }

    #[tokio::test]
    async fn stream_ending_early_counts_as_failure() {
        let (store, id) = store_with_session();
        let (tx, rx) = mpsc::channel(8);
        tx.send(TextEvent::Delta("half".into())).await.unwrap();
        drop(tx);

        let outcome = drive_response(Arc::clone(&store), id.clone(), rx).await.unwrap();
        assert_eq!(outcome.kind, UpdateKind::Failed);
        let chats = store.lock();
        assert_eq!(
            chats.session(&id).unwrap().message(&outcome.message_id).unwrap().text,
            FAILURE_NOTICE
        );
    }

    #[tokio::test]
    async fn immediate_error_still_shows_notice() {
        let (store, id) = store_with_session();
        let (tx, rx) = mpsc::channel(1);
        tx.send(TextEvent::Error("503".into())).await.unwrap();

        let outcome = drive_response(Arc::clone(&store), id.clone(), rx).await.unwrap();
        assert_eq!(outcome.kind, UpdateKind::Failed);
        assert_eq!(store.lock().session(&id).unwrap().messages.len(), 2);
    }
}
