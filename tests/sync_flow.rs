//! End-to-end flows through the public session API against an in-process
//! authority that replays mutations the same way the real server would.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::watch;

use ripplechat_core::repositories::InMemoryReplicaRepository;
use ripplechat_core::sse::{STREAM_CHUNK_EVENT, STREAM_DONE_EVENT};
use ripplechat_core::sync::{
    Cookie, Mutation, PatchOperation, PullRequest, PullResponse, PushRequest, PushResponse,
    SyncTransport, TransportError,
};
use ripplechat_core::sync::transport::TransportFuture;
use ripplechat_core::{ChatSession, ReplicaStore, Role, SessionConfig};

/// Server stand-in: applies pushed mutations through the same mutator
/// definitions the client uses and serves full-snapshot pulls.
#[derive(Default)]
struct FakeAuthority {
    rows: Mutex<BTreeMap<String, Value>>,
    last_applied: Mutex<HashMap<String, u64>>,
    order: AtomicI64,
    offline: AtomicBool,
}

impl FakeAuthority {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn apply_wires(&self, mutations: &[ripplechat_core::sync::WireMutation]) {
        let mut rows = self.rows.lock();
        let mut last_applied = self.last_applied.lock();
        for wire in mutations {
            let seen = last_applied.get(&wire.client_id).copied().unwrap_or(0);
            if wire.id <= seen {
                continue;
            }
            let mutation: Mutation =
                serde_json::from_value(json!({"name": wire.name, "args": wire.args}))
                    .expect("authority received unknown mutation");
            let staging = ReplicaStore::new();
            staging.load_snapshot(rows.clone(), None);
            staging.apply(|tx| mutation.apply(tx));
            *rows = staging.read(|view| {
                view.scan_prefix("")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            });
            last_applied.insert(wire.client_id.clone(), wire.id);
        }
    }
}

impl SyncTransport for FakeAuthority {
    fn push(&self, request: PushRequest) -> TransportFuture<PushResponse> {
        if self.offline.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::Status(503)) });
        }
        self.apply_wires(&request.mutations);
        let applied_up_to = request.mutations.iter().map(|m| m.id).max().unwrap_or(0);
        Box::pin(async move { Ok(PushResponse { applied_up_to }) })
    }

    fn pull(&self, _request: PullRequest) -> TransportFuture<PullResponse> {
        if self.offline.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::Status(503)) });
        }
        let mut patch = vec![PatchOperation::Clear];
        patch.extend(self.rows.lock().iter().map(|(key, value)| {
            PatchOperation::Put {
                key: key.clone(),
                value: value.clone(),
            }
        }));
        let cookie = Cookie {
            order: self.order.fetch_add(1, Ordering::SeqCst) + 1,
            cvr_id: "cvr-test".into(),
        };
        Box::pin(async move { Ok(PullResponse { cookie, patch }) })
    }
}

async fn start_session(user_id: &str, authority: Arc<FakeAuthority>) -> ChatSession {
    ChatSession::start_with(
        SessionConfig::new(user_id, "http://localhost"),
        Arc::new(InMemoryReplicaRepository::new()),
        authority,
    )
    .await
    .expect("session start")
}

/// Wait until the watch channel value satisfies the predicate, or panic.
async fn wait_for<T: Clone + Send + Sync + 'static>(
    rx: &mut watch::Receiver<T>,
    predicate: impl Fn(&T) -> bool,
) {
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            if predicate(&rx.borrow()) {
                return;
            }
            rx.changed().await.expect("watch sender dropped");
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn optimistic_send_converges_across_sessions() {
    let authority = FakeAuthority::new();

    let alice = start_session("alice", authority.clone()).await;
    let chat = alice.create_chat(Some("Plans".into()));
    alice.open_chat(&chat.id);
    alice.send_message(&chat.id, "are we still on for friday?".into());

    // Visible locally before any network round trip.
    assert_eq!(alice.messages().data().len(), 1);

    alice.sync().await.expect("sync");

    // A fresh session for the same account sees the pushed state.
    let bob = start_session("bob", authority.clone()).await;
    bob.sync().await.expect("sync");
    let chats = bob.chats().data();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].title.as_deref(), Some("Plans"));

    bob.open_chat(&chat.id);
    let messages = bob.messages().data();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "are we still on for friday?");

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn streamed_reply_lands_in_history_and_syncs_back() {
    let authority = FakeAuthority::new();
    let session = start_session("alice", authority.clone()).await;

    let chat = session.create_chat(None);
    session.open_chat(&chat.id);
    session.send_message(&chat.id, "hi".into());

    let envelope = |event: &str, data: Value| json!({"type": event, "data": data});
    session.registry().dispatch(
        STREAM_CHUNK_EVENT,
        &envelope(STREAM_CHUNK_EVENT, json!({"chat_id": chat.id, "chunk": "Hel"})),
    );
    session.registry().dispatch(
        STREAM_CHUNK_EVENT,
        &envelope(STREAM_CHUNK_EVENT, json!({"chat_id": chat.id, "chunk": "lo"})),
    );

    // Transient buffer is exposed while streaming.
    let pending = session.streams().pending_watch().borrow().clone();
    assert_eq!(pending[&chat.id].content, "Hello");

    session.registry().dispatch(
        STREAM_DONE_EVENT,
        &envelope(STREAM_DONE_EVENT, json!({"chat_id": chat.id, "msg_id": "srv-1"})),
    );

    let messages = session.messages().data();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "srv-1");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].body, "Hello");

    // The finalized reply pushes like any other mutation.
    session.sync().await.expect("sync");
    assert!(
        authority
            .rows
            .lock()
            .contains_key(&format!("message/{}", "srv-1"))
    );

    session.shutdown();
}

#[tokio::test]
async fn offline_edits_push_after_reconnect() {
    let authority = FakeAuthority::new();
    authority.set_offline(true);

    let session = start_session("alice", authority.clone()).await;
    let chat = session.create_chat(Some("Offline draft".into()));
    session.open_chat(&chat.id);
    session.send_message(&chat.id, "queued while offline".into());

    assert!(session.sync().await.is_err());
    // Local state is unaffected by the failure.
    assert_eq!(session.chats().data().len(), 1);
    assert_eq!(session.messages().data().len(), 1);
    assert!(authority.rows.lock().is_empty());

    authority.set_offline(false);
    session.sync().await.expect("sync");

    let rows = authority.rows.lock();
    assert!(rows.contains_key(&format!("chat/{}", chat.id)));
    assert_eq!(
        rows.keys().filter(|k| k.starts_with("message/")).count(),
        1
    );
    drop(rows);

    session.shutdown();
}

#[tokio::test]
async fn repeated_push_of_the_same_records_applies_once() {
    let authority = FakeAuthority::new();
    let session = start_session("alice", authority.clone()).await;

    let chat = session.create_chat(Some("Once".into()));
    let wire = {
        // Replay the identical push a second time, as a client would after
        // losing the response to the first.
        let mutation = Mutation::CreateChat(ripplechat_core::Chat::new(
            chat.id.clone(),
            "alice".into(),
            Some("Once".into()),
            chrono::Utc::now(),
        ));
        let tagged = serde_json::to_value(&mutation).unwrap();
        ripplechat_core::sync::WireMutation {
            client_id: "client-alice".into(),
            id: 1,
            name: tagged["name"].as_str().unwrap().to_string(),
            args: tagged["args"].clone(),
            timestamp: 0.0,
        }
    };

    session.sync().await.expect("sync");
    authority.apply_wires(std::slice::from_ref(&wire));

    assert_eq!(
        authority
            .rows
            .lock()
            .keys()
            .filter(|k| k.starts_with("chat/"))
            .count(),
        1
    );

    session.shutdown();
}

#[tokio::test]
async fn two_replicas_converge_to_the_same_projection() {
    let authority = FakeAuthority::new();

    let alice = start_session("alice", authority.clone()).await;
    let bob = start_session("bob", authority.clone()).await;

    let a = alice.create_chat(Some("From alice".into()));
    let b = bob.create_chat(Some("From bob".into()));
    bob.set_pinned(&b.id, true);

    // Sync twice each: the first cycle pushes, the second pulls whatever the
    // other replica pushed in between.
    alice.sync().await.expect("sync");
    bob.sync().await.expect("sync");
    alice.sync().await.expect("sync");
    bob.sync().await.expect("sync");

    let mut alice_rx = alice.chats().watch();
    wait_for(&mut alice_rx, |chats| chats.len() == 2).await;

    let alice_chats = alice.chats().data();
    let bob_chats = bob.chats().data();
    assert_eq!(alice_chats, bob_chats);

    let pinned = alice_chats.iter().find(|c| c.id == b.id).unwrap();
    assert!(pinned.pinned);
    assert!(pinned.pinned_at.is_some());
    assert!(alice_chats.iter().any(|c| c.id == a.id));

    alice.shutdown();
    bob.shutdown();
}

#[tokio::test]
async fn restart_after_confirmation_does_not_reuse_sequence_numbers() {
    let authority = FakeAuthority::new();
    let repository = Arc::new(InMemoryReplicaRepository::new());

    // First session: mutation id 1 is pushed, confirmed, and pruned.
    let session = ChatSession::start_with(
        SessionConfig::new("alice", "http://localhost"),
        repository.clone(),
        authority.clone(),
    )
    .await
    .expect("session start");
    session.create_chat(Some("First".into()));
    session.sync().await.expect("sync");
    // Let the persistence writer drain before tearing the session down.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    session.shutdown();

    // Second session, same user and storage, empty pending log. Its first
    // mutation must get a fresh id; a reused one would be deduped away by
    // the authority and then erased locally by the next pull.
    let session = ChatSession::start_with(
        SessionConfig::new("alice", "http://localhost"),
        repository,
        authority.clone(),
    )
    .await
    .expect("session start");
    session.create_chat(Some("Second".into()));
    session.sync().await.expect("sync");

    assert_eq!(
        authority
            .rows
            .lock()
            .keys()
            .filter(|k| k.starts_with("chat/"))
            .count(),
        2
    );
    let titles: Vec<Option<String>> = session
        .chats()
        .data()
        .into_iter()
        .map(|c| c.title)
        .collect();
    assert!(titles.contains(&Some("First".into())));
    assert!(titles.contains(&Some("Second".into())));

    session.shutdown();
}

#[tokio::test]
async fn pull_discards_rows_the_authority_no_longer_has() {
    let authority = FakeAuthority::new();
    let session = start_session("alice", authority.clone()).await;

    let chat = session.create_chat(Some("Ephemeral".into()));
    session.sync().await.expect("sync");
    assert_eq!(session.chats().data().len(), 1);

    // Another client deleted the chat server-side.
    authority
        .rows
        .lock()
        .remove(&format!("chat/{}", chat.id));

    session.sync().await.expect("sync");
    assert!(session.chats().data().is_empty());

    session.shutdown();
}
