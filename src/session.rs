use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::chat::ChatUpdate;
use crate::models::message::MESSAGE_KEY_PREFIX;
use crate::models::{
    ActiveModel, ActiveModelUpdate, Chat, ForkChatArgs, Message, ReasoningEffort, Role,
};
use crate::replica::ReplicaStore;
use crate::repositories::{
    PersistCommand, ReplicaRepository, ReplicaSqliteRepository, RepositoryError,
};
use crate::sse::{ConnectionState, ListenerHandle, ListenerRegistry, POKE_EVENT, SseClient};
use crate::stores::{ActiveModelStore, ChatsStore, MessagesStore};
use crate::stream::StreamReconciler;
use crate::sync::{HttpSyncTransport, Mutation, MutationLog, SyncCoordinator, SyncTransport};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: String,
    pub server_url: String,
    /// Database location. `None` uses the platform config directory.
    pub db_path: Option<PathBuf>,
    /// Fallback pull cadence for when pokes are not arriving.
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            server_url: server_url.into(),
            db_path: None,
            poll_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Composition root for one signed-in user: owns the replica, the mutation
/// log, the sync coordinator, the push channel, and the projection stores,
/// and exposes the typed operations the presentation layer calls.
///
/// All mutations flow through [`ChatSession`] methods into the mutation log;
/// nothing else writes to the replica. Reads flow out through the stores'
/// watch channels.
pub struct ChatSession {
    user_id: String,
    replica: Arc<ReplicaStore>,
    log: Arc<MutationLog>,
    coordinator: Arc<SyncCoordinator>,
    registry: Arc<ListenerRegistry>,
    chats: Arc<ChatsStore>,
    messages: Arc<MessagesStore>,
    active_model: Arc<ActiveModelStore>,
    streams: Arc<StreamReconciler>,
    sse: Option<SseClient>,
    sync_notify: Arc<Notify>,
    poke_listener: Option<ListenerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatSession {
    /// Start a durable session against a remote server: SQLite persistence,
    /// HTTP push/pull, and a live push-channel connection.
    pub async fn start(config: SessionConfig) -> Result<Self, SessionError> {
        let repository: Arc<dyn ReplicaRepository> = Arc::new(match &config.db_path {
            Some(path) => ReplicaSqliteRepository::open(path.clone()).await?,
            None => ReplicaSqliteRepository::new().await?,
        });
        let transport = Arc::new(HttpSyncTransport::new(&config.server_url));
        let sse_url = format!("{}/api/sse", config.server_url.trim_end_matches('/'));
        Self::build(config, repository, transport, Some(sse_url)).await
    }

    /// Start with explicit storage and transport and no push channel.
    /// Intended for tests and embedding.
    pub async fn start_with(
        config: SessionConfig,
        repository: Arc<dyn ReplicaRepository>,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Self, SessionError> {
        Self::build(config, repository, transport, None).await
    }

    async fn build(
        config: SessionConfig,
        repository: Arc<dyn ReplicaRepository>,
        transport: Arc<dyn SyncTransport>,
        sse_url: Option<String>,
    ) -> Result<Self, SessionError> {
        let snapshot = repository.load().await?;
        info!(
            rows = snapshot.rows.len(),
            pending = snapshot.pending.len(),
            "Loaded replica snapshot"
        );

        let replica = Arc::new(ReplicaStore::new());
        replica.load_snapshot(snapshot.rows, snapshot.cookie);

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let sync_notify = Arc::new(Notify::new());

        let log = Arc::new(MutationLog::new(
            replica.clone(),
            persist_tx.clone(),
            sync_notify.clone(),
        ));
        log.restore(snapshot.pending.clone(), snapshot.last_mutation_id);
        // Unconfirmed mutations from the previous session become visible
        // again before the first pull.
        replica.replay(&snapshot.pending);

        // Stable per-user ids keep retried pushes deduplicatable across
        // restarts.
        let coordinator = Arc::new(SyncCoordinator::new(
            replica.clone(),
            log.clone(),
            transport,
            format!("group-{}", config.user_id),
            format!("client-{}", config.user_id),
            persist_tx,
        ));

        let registry = Arc::new(ListenerRegistry::new());

        let chats = ChatsStore::new();
        chats.sync(&replica);
        let messages = MessagesStore::new();
        let active_model = ActiveModelStore::new();
        active_model.sync(&replica);

        let streams = StreamReconciler::new(log.clone(), messages.clone(), config.user_id.clone());
        streams.register(&registry);

        let poke_notify = sync_notify.clone();
        let poke_listener = registry.add_listener(
            POKE_EVENT,
            Arc::new(move |_| {
                debug!("Poke received, scheduling sync");
                poke_notify.notify_one();
            }),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_persistence_writer(persist_rx, repository)));
        tasks.push(tokio::spawn(run_sync_scheduler(
            coordinator.clone(),
            sync_notify.clone(),
            config.poll_interval,
        )));

        let sse = sse_url.map(|url| SseClient::connect(url, registry.clone()));
        if let Some(sse) = &sse {
            // A reconnect means pokes may have been missed; pull to catch up.
            let mut state_rx = sse.state_watch();
            let notify = sync_notify.clone();
            tasks.push(tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    if *state_rx.borrow() == ConnectionState::Connected {
                        debug!("Push channel connected, scheduling sync");
                        notify.notify_one();
                    }
                }
            }));
        }

        Ok(Self {
            user_id: config.user_id,
            replica,
            log,
            coordinator,
            registry,
            chats,
            messages,
            active_model,
            streams,
            sse,
            sync_notify,
            poke_listener: Some(poke_listener),
            tasks,
        })
    }

    pub fn chats(&self) -> &Arc<ChatsStore> {
        &self.chats
    }

    pub fn messages(&self) -> &Arc<MessagesStore> {
        &self.messages
    }

    pub fn active_model(&self) -> &Arc<ActiveModelStore> {
        &self.active_model
    }

    pub fn streams(&self) -> &Arc<StreamReconciler> {
        &self.streams
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.sse.as_ref().map(|sse| sse.state())
    }

    /// Schedule a sync cycle without waiting for it.
    pub fn request_sync(&self) {
        self.sync_notify.notify_one();
    }

    /// Run a sync cycle now and wait for it to finish.
    pub async fn sync(&self) -> Result<(), crate::sync::SyncError> {
        self.coordinator.sync().await
    }

    pub fn create_chat(&self, title: Option<String>) -> Chat {
        let chat = Chat::new(
            Uuid::new_v4().to_string(),
            self.user_id.clone(),
            title,
            Utc::now(),
        );
        self.log.enqueue(Mutation::CreateChat(chat.clone()));
        chat
    }

    pub fn rename_chat(&self, chat_id: &str, title: String) {
        self.log.enqueue(Mutation::UpdateChat(ChatUpdate {
            id: chat_id.to_string(),
            title: Some(title),
            updated_at: Utc::now(),
            ..ChatUpdate::default()
        }));
    }

    pub fn set_pinned(&self, chat_id: &str, pinned: bool) {
        self.log.enqueue(Mutation::UpdateChat(ChatUpdate {
            id: chat_id.to_string(),
            pinned: Some(pinned),
            updated_at: Utc::now(),
            ..ChatUpdate::default()
        }));
    }

    pub fn set_archived(&self, chat_id: &str, archived: bool) {
        self.log.enqueue(Mutation::UpdateChat(ChatUpdate {
            id: chat_id.to_string(),
            archived: Some(archived),
            updated_at: Utc::now(),
            ..ChatUpdate::default()
        }));
    }

    pub fn delete_chat(&self, chat_id: &str) {
        self.log.enqueue(Mutation::DeleteChat(crate::sync::DeleteArgs {
            id: chat_id.to_string(),
        }));
    }

    /// Copy a chat's history into a new chat marked as forked.
    pub fn fork_chat(&self, source_chat_id: &str, title: String) -> Chat {
        let now = Utc::now();
        let new_id = Uuid::new_v4().to_string();

        let mut msgs: Vec<Message> = self.replica.read(|view| {
            view.scan_prefix(MESSAGE_KEY_PREFIX)
                .filter_map(|(_, value)| serde_json::from_value::<Message>(value.clone()).ok())
                .filter(|m| m.chat_id == source_chat_id)
                .collect()
        });
        msgs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        // Copies get fresh ids; reusing the source ids would overwrite the
        // source chat's rows when the mutator writes the copies.
        for msg in &mut msgs {
            msg.id = Uuid::new_v4().to_string();
        }

        self.log.enqueue(Mutation::ForkChat(ForkChatArgs {
            new_id: new_id.clone(),
            user_id: self.user_id.clone(),
            title: title.clone(),
            time: now,
            msgs,
        }));

        let mut chat = Chat::new(new_id, self.user_id.clone(), Some(title), now);
        chat.forked = true;
        chat
    }

    /// Record a user message and bump the chat so it sorts to the top.
    /// The assistant's reply arrives later through the push channel.
    pub fn send_message(&self, chat_id: &str, body: String) -> Message {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: self.user_id.clone(),
            role: Role::User,
            body,
            reasoning: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.log.enqueue(Mutation::CreateMessage(message.clone()));
        self.log
            .enqueue(Mutation::UpdateChat(ChatUpdate::touch(chat_id.to_string(), now)));
        self.streams.start_stream(chat_id);
        message
    }

    /// Set the model used for new assistant requests. Creates the singleton
    /// selection record on first use, updates it afterwards.
    pub fn select_model(&self, provider: String, model: String, reasoning: Option<ReasoningEffort>) {
        let now = Utc::now();
        match self.active_model.current() {
            Some(current) => {
                self.log
                    .enqueue(Mutation::UpdateActiveModel(ActiveModelUpdate {
                        id: current.id,
                        provider,
                        model,
                        reasoning,
                        updated_at: now,
                    }));
            }
            None => {
                self.log.enqueue(Mutation::CreateActiveModel(ActiveModel {
                    id: Uuid::new_v4().to_string(),
                    provider,
                    model,
                    reasoning,
                    created_at: now,
                    updated_at: now,
                }));
            }
        }
    }

    /// Scope the message projection to one chat.
    pub fn open_chat(&self, chat_id: &str) {
        self.messages.sync(&self.replica, chat_id);
    }

    pub fn close_chat(&self) {
        self.messages.cleanup(&self.replica);
    }

    /// Stop background work and detach every listener and subscription.
    /// Pending mutations stay on disk and are pushed by the next session.
    pub fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(sse) = self.sse.take() {
            sse.shutdown();
        }
        if let Some(handle) = self.poke_listener.take() {
            self.registry.remove_listener(handle);
        }
        self.streams.unregister(&self.registry);
        self.chats.cleanup(&self.replica);
        self.messages.cleanup(&self.replica);
        self.active_model.cleanup(&self.replica);
        info!(unconfirmed = self.log.len(), "Session shut down");
    }
}

/// Single writer for all disk state. Commands are applied strictly in the
/// order the rest of the system produced them.
async fn run_persistence_writer(
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    repository: Arc<dyn ReplicaRepository>,
) {
    while let Some(command) = rx.recv().await {
        let result = match command {
            PersistCommand::SavePending(record) => repository.save_pending(record).await,
            PersistCommand::RemovePendingUpTo(id) => repository.remove_pending_up_to(id).await,
            PersistCommand::SaveBase { ops, cookie } => repository.apply_patch(ops, cookie).await,
        };
        if let Err(error) = result {
            // In-memory state is still correct; the next successful pull
            // rewrites the base.
            warn!(%error, "Persistence write failed");
        }
    }
}

/// Drives sync cycles from three sources folded into one notify: pokes,
/// explicit requests, and a fallback poll interval.
async fn run_sync_scheduler(
    coordinator: Arc<SyncCoordinator>,
    sync_notify: Arc<Notify>,
    poll_interval: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    // The first tick completes immediately; it doubles as the startup sync.
    loop {
        tokio::select! {
            _ = sync_notify.notified() => {}
            _ = interval.tick() => {}
        }
        if let Err(error) = coordinator.sync().await {
            warn!(%error, "Sync cycle failed");
        }
    }
}
