use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::TryRecvError;
use zchat::client::{ByteStream, ChatBackend};
use zchat::error::{ChatError, RATE_LIMIT_MESSAGE};
use zchat::session::{ChatSession, SendOptions, SessionEvent};
use zchat::storage::{InMemoryStore, MessageStore, NewMessage};
use zchat::stream::{DecoderLimits, Increment};
use zchat::wire::{ChatRequest, Role};

const HELLO_REPLY: &str = "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"Greeting.\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\" there!\"}}]}\n\n\
data: [DONE]\n\n";

const SECOND_REPLY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi again.\"}}]}\n\
data: [DONE]\n";

const REASONING_ONLY_REPLY: &str =
    "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"thinking...\"}}]}\ndata: [DONE]\n";

enum Script {
    Reply(&'static str),
    Reject { status: u16, message: &'static str },
    BreakAfter(&'static str),
    Stall(&'static str),
}

#[derive(Default)]
struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

/// Split `body` into small chunks to exercise reassembly.
fn chunked(body: &'static str) -> Vec<Result<Bytes, ChatError>> {
    body.as_bytes()
        .chunks(5)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect()
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        self.requests.lock().push(request.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .expect("backend called more often than scripted");
        match script {
            Script::Reply(body) => Ok(Box::pin(futures_util::stream::iter(chunked(body)))),
            Script::Reject { status, message } => Err(ChatError::Upstream {
                status,
                message: message.to_string(),
            }),
            Script::BreakAfter(body) => {
                let mut chunks = chunked(body);
                chunks.push(Err(ChatError::Transport("connection reset".to_string())));
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
            Script::Stall(body) => Ok(Box::pin(
                futures_util::stream::iter(chunked(body)).chain(futures_util::stream::pending()),
            )),
        }
    }
}

type Session = ChatSession<InMemoryStore, ScriptedBackend>;

async fn session_with_conversation(scripts: Vec<Script>) -> (Arc<Session>, Arc<InMemoryStore>, Arc<ScriptedBackend>) {
    let store = Arc::new(InMemoryStore::new());
    let backend = ScriptedBackend::new(scripts);
    let session = Arc::new(ChatSession::new(Arc::clone(&store), Arc::clone(&backend)));
    session.start_conversation().await.expect("start conversation");
    (session, store, backend)
}

async fn wait_until_loading(session: &Session) {
    for _ in 0..200 {
        if session.is_loading() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never became busy");
}

#[tokio::test]
async fn test_send_persists_user_and_assistant_once() {
    let (session, store, backend) = session_with_conversation(vec![Script::Reply(HELLO_REPLY)]).await;
    let conversation_id = session.conversation_id().expect("conversation id");

    let summary = session
        .send("Hello", SendOptions::think())
        .await
        .expect("send");
    assert_eq!(summary.content, "Hello there!");
    assert_eq!(summary.thinking, "Greeting.");
    assert_eq!(summary.increments, 3);
    assert!(summary.persisted);
    assert!(!session.is_loading());

    let stored = store.list_messages(conversation_id).await.expect("list");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].content, "Hello");
    assert_eq!(stored[1].role, Role::Assistant);
    assert_eq!(stored[1].content, "Hello there!");

    let conversation = store
        .get_conversation(conversation_id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(conversation.title, "Hello");
    assert_eq!(session.title(), "Hello");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].think);
    assert!(!requests[0].search);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].content, "Hello");

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].thinking, "Greeting.");
}

#[tokio::test]
async fn test_long_first_message_truncates_title() {
    let (session, store, _backend) = session_with_conversation(vec![Script::Reply(SECOND_REPLY)]).await;
    let long = "x".repeat(80);
    session.send(&long, SendOptions::default()).await.expect("send");

    let expected = format!("{}...", "x".repeat(50));
    assert_eq!(session.title(), expected);
    let conversation = store
        .get_conversation(session.conversation_id().expect("id"))
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(conversation.title, expected);
}

#[tokio::test]
async fn test_empty_answer_is_not_persisted() {
    let (session, store, _backend) =
        session_with_conversation(vec![Script::Reply(REASONING_ONLY_REPLY)]).await;

    let summary = session.send("Hm?", SendOptions::think()).await.expect("send");
    assert!(!summary.persisted);
    assert_eq!(summary.thinking, "thinking...");
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_broken_stream_persists_nothing_and_removes_reply() {
    let (session, store, _backend) = session_with_conversation(vec![Script::BreakAfter(
        "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n",
    )])
    .await;
    let mut events = session.subscribe();

    let err = session
        .send("Tell me a story", SendOptions::default())
        .await
        .expect_err("turn should fail");
    assert!(matches!(err, ChatError::Transport(_)));
    assert!(err.is_transport());
    assert!(!session.is_loading());

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(store.message_count(), 1);

    let mut saw_partial = false;
    let mut failed_with = None;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Increment { increment, .. }) => {
                saw_partial |= increment == Increment::content("partial");
            }
            Ok(SessionEvent::TurnFailed { message }) => failed_with = Some(message),
            Ok(_) => {}
            Err(TryRecvError::Empty) => break,
            Err(err) => panic!("event channel error: {err}"),
        }
    }
    assert!(saw_partial);
    assert_eq!(failed_with.as_deref(), Some("connection reset"));
}

#[tokio::test]
async fn test_rejected_request_surfaces_message() {
    let (session, store, _backend) = session_with_conversation(vec![Script::Reject {
        status: 429,
        message: RATE_LIMIT_MESSAGE,
    }])
    .await;

    let err = session
        .send("Hello", SendOptions::default())
        .await
        .expect_err("rate limited");
    assert_eq!(err.user_message(), RATE_LIMIT_MESSAGE);
    assert!(!session.is_loading());
    assert_eq!(session.messages().len(), 1);
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_decode_limit_fails_turn() {
    let store = Arc::new(InMemoryStore::new());
    let backend = ScriptedBackend::new(vec![Script::Reply(HELLO_REPLY)]);
    let session = ChatSession::new(Arc::clone(&store), backend).with_limits(DecoderLimits {
        max_carry_bytes: 16,
        max_parse_retries: 1,
    });
    session.start_conversation().await.expect("start");

    let err = session
        .send("Hello", SendOptions::default())
        .await
        .expect_err("decode should fail");
    assert!(matches!(err, ChatError::Decode(_)));
    assert_eq!(store.message_count(), 1);
    assert!(!session.is_loading());
}

#[tokio::test]
async fn test_regenerate_replaces_last_reply() {
    let (session, store, backend) = session_with_conversation(vec![
        Script::Reply(HELLO_REPLY),
        Script::Reply(SECOND_REPLY),
    ])
    .await;
    let conversation_id = session.conversation_id().expect("id");

    session.send("Hello", SendOptions::search()).await.expect("send");
    let summary = session.regenerate().await.expect("regenerate");
    assert_eq!(summary.content, "Hi again.");

    let stored = store.list_messages(conversation_id).await.expect("list");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].content, "Hi again.");

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Hi again.");
    assert_eq!(messages[1].id, summary.message_id);

    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].search);
    assert_eq!(requests[1].messages.len(), 1);
    assert_eq!(requests[1].messages[0].role, Role::User);
}

#[tokio::test]
async fn test_regenerate_after_reload_deletes_stored_reply() {
    let store = Arc::new(InMemoryStore::new());
    let conversation = store.create_conversation("Saved").await.expect("create");
    store
        .insert_message(NewMessage::new(conversation.id, Role::User, "Hello"))
        .await
        .expect("insert user");
    store
        .insert_message(NewMessage::new(conversation.id, Role::Assistant, "Old answer"))
        .await
        .expect("insert assistant");

    let backend = ScriptedBackend::new(vec![Script::Reply(SECOND_REPLY), Script::Reply(SECOND_REPLY)]);
    let session = ChatSession::new(Arc::clone(&store), Arc::clone(&backend));
    session.load(conversation.id).await.expect("load");
    assert_eq!(session.title(), "Saved");
    assert_eq!(session.messages().len(), 2);

    // nothing sent in this session yet
    assert!(matches!(
        session.regenerate().await,
        Err(ChatError::NothingToRegenerate)
    ));

    session.send("And now?", SendOptions::default()).await.expect("send");
    let history = &backend.requests()[0].messages;
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].content, "Old answer");

    session.regenerate().await.expect("regenerate");
    let stored = store.list_messages(conversation.id).await.expect("list");
    let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Hello", "Old answer", "And now?", "Hi again."]);
    // title is only derived from the first message of a conversation
    assert_eq!(session.title(), "Saved");
}

#[tokio::test]
async fn test_concurrent_turns_are_rejected_and_cancel_stops_stream() {
    let (session, store, _backend) = session_with_conversation(vec![
        Script::Stall("data: {\"choices\":[{\"delta\":{\"content\":\"Once upon\"}}]}\n"),
        Script::Reply(SECOND_REPLY),
    ])
    .await;

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send("Tell me a story", SendOptions::default()).await })
    };
    wait_until_loading(&session).await;

    assert!(matches!(
        session.send("Another", SendOptions::default()).await,
        Err(ChatError::Busy)
    ));
    assert!(matches!(session.regenerate().await, Err(ChatError::Busy)));

    session.handle().cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("turn should stop after cancel")
        .expect("task join");
    assert!(matches!(result, Err(ChatError::Cancelled)));
    assert!(!session.is_loading());
    assert_eq!(store.message_count(), 1);
    assert_eq!(session.messages().len(), 1);

    let summary = session
        .send("Try again", SendOptions::default())
        .await
        .expect("send after cancel");
    assert_eq!(summary.content, "Hi again.");
}

#[tokio::test]
async fn test_dropping_turn_future_clears_busy_flag() {
    let (session, store, _backend) = session_with_conversation(vec![Script::Stall(
        "data: {\"choices\":[{\"delta\":{\"content\":\"...\"}}]}\n",
    )])
    .await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        session.send("Hello", SendOptions::default()),
    )
    .await;
    assert!(outcome.is_err());
    assert!(!session.is_loading());
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn test_event_order_for_successful_turn() {
    let (session, _store, _backend) = session_with_conversation(vec![Script::Reply(HELLO_REPLY)]).await;
    let mut events = session.subscribe();
    let summary = session.send("Hello", SendOptions::default()).await.expect("send");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            SessionEvent::MessageAdded(message) => format!("added:{}", message.role),
            SessionEvent::TitleChanged(title) => format!("title:{title}"),
            SessionEvent::Increment { increment, .. } => {
                format!("{}:{}", increment.kind, increment.text)
            }
            SessionEvent::TurnFinished { message_id } => {
                assert_eq!(message_id, summary.message_id);
                "finished".to_string()
            }
            other => panic!("unexpected event {other:?}"),
        });
    }
    assert_eq!(
        kinds,
        vec![
            "added:user",
            "title:Hello",
            "added:assistant",
            "reasoning:Greeting.",
            "content:Hello",
            "content: there!",
            "finished",
        ]
    );
}

#[tokio::test]
async fn test_session_model_is_forwarded() {
    let store = Arc::new(InMemoryStore::new());
    let backend = ScriptedBackend::new(vec![Script::Reply(SECOND_REPLY)]);
    let session = ChatSession::new(store, Arc::clone(&backend))
        .with_model(Some("glm-4-flash".to_string()));

    session.send("Hi", SendOptions::default()).await.expect("send");
    assert_eq!(backend.requests()[0].model.as_deref(), Some("glm-4-flash"));
}

#[tokio::test]
async fn test_regenerate_after_failed_send_replays_last_message() {
    let (session, store, backend) = session_with_conversation(vec![
        Script::Reply(HELLO_REPLY),
        Script::Reject {
            status: 500,
            message: "upstream exploded",
        },
        Script::Reply(SECOND_REPLY),
    ])
    .await;
    let conversation_id = session.conversation_id().expect("id");

    session.send("q1", SendOptions::default()).await.expect("first send");
    session
        .send("q2", SendOptions::default())
        .await
        .expect_err("second send fails");

    let summary = session.regenerate().await.expect("regenerate");
    assert_eq!(summary.content, "Hi again.");

    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    let replayed = requests[2].messages.last().expect("history");
    assert_eq!(replayed.role, Role::User);
    assert_eq!(replayed.content, "q2");

    let contents: Vec<String> = session.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["q1", "Hello there!", "q2", "Hi again."]);

    let stored = store.list_messages(conversation_id).await.expect("list");
    let contents: Vec<&str> = stored.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["q1", "Hello there!", "q2", "Hi again."]);
}

/// Deletes every conversation while the reply is being opened, so the
/// assistant insert that follows the stream hits a missing conversation.
struct DroppingBackend {
    store: Arc<InMemoryStore>,
}

#[async_trait]
impl ChatBackend for DroppingBackend {
    async fn open_stream(&self, _request: &ChatRequest) -> Result<ByteStream, ChatError> {
        for conversation in self.store.list_conversations().await? {
            self.store.delete_conversation(conversation.id).await?;
        }
        Ok(Box::pin(futures_util::stream::iter(chunked(SECOND_REPLY))))
    }
}

#[tokio::test]
async fn test_store_error_after_stream_fails_turn() {
    let store = Arc::new(InMemoryStore::new());
    let backend = Arc::new(DroppingBackend {
        store: Arc::clone(&store),
    });
    let session = ChatSession::new(Arc::clone(&store), backend);
    session.start_conversation().await.expect("start");
    let mut events = session.subscribe();

    let err = session
        .send("hi", SendOptions::default())
        .await
        .expect_err("assistant insert should fail");
    assert!(matches!(err, ChatError::NotFound(_)));
    assert!(!session.is_loading());

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);

    let mut assistant_id = None;
    let mut removed = None;
    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::MessageAdded(message) if message.role == Role::Assistant => {
                assistant_id = Some(message.id);
            }
            SessionEvent::MessageRemoved { message_id } => removed = Some(message_id),
            SessionEvent::TurnFailed { .. } => failed = true,
            _ => {}
        }
    }
    assert!(assistant_id.is_some());
    assert_eq!(removed, assistant_id);
    assert!(failed);
}
