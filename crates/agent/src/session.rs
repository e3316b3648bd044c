//! Agent sessions and the manager that bounds them.
//!
//! An [`AgentSession`] is one conversation's live state: its context buffer
//! and its own tool registry. The [`SessionManager`] keeps a bounded set of
//! sessions, evicting the least recently used idle one, and rebuilds a
//! session from the tail of its stored history when a known conversation is
//! reopened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stockchat_core::buffer::ContextBuffer;
use stockchat_core::error::{StoreError, ToolError};
use stockchat_core::message::{ConversationId, Message};
use stockchat_core::store::{ConversationStore, StoredMessage};
use stockchat_core::tool::{ToolRegistry, ToolStatsSnapshot};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Most messages loaded back from the store for one session by default.
pub const DEFAULT_REHYDRATE_LIMIT: u32 = 1000;

/// Builds a fresh tool registry for each new session.
pub type RegistryFactory = Arc<dyn Fn() -> Result<ToolRegistry, ToolError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation {0} already has a turn in progress")]
    Busy(String),

    #[error("could not build tools for session: {0}")]
    Tools(#[from] ToolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AgentSession {
    id: ConversationId,
    model: String,
    pub(crate) buffer: ContextBuffer,
    pub(crate) tools: ToolRegistry,
    created_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(id: ConversationId, system_prompt: &str, tools: ToolRegistry, model: impl Into<String>) -> Self {
        Self {
            id,
            model: model.into(),
            buffer: ContextBuffer::with_system_prompt(system_prompt),
            tools,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn buffer(&self) -> &ContextBuffer {
        &self.buffer
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Drop the conversation history, keeping the system prompt.
    pub fn reset(&mut self) {
        self.buffer.reset();
        info!(conversation_id = %self.id, "Session reset");
    }

    /// Append previously persisted messages after the system prompt.
    ///
    /// Tool outputs whose call is not in the history are skipped. Returns
    /// how many messages were restored.
    pub fn restore(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut restored = 0;
        for message in messages {
            match self.buffer.append(message) {
                Ok(()) => restored += 1,
                Err(e) => warn!(conversation_id = %self.id, error = %e, "Skipping stored message"),
            }
        }
        restored
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            conversation_id: self.id.to_string(),
            model: self.model.clone(),
            conversation_length: self.buffer.len(),
            created_at: self.created_at,
            tools: self.tools.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub conversation_id: String,
    pub model: String,
    pub conversation_length: usize,
    pub created_at: DateTime<Utc>,
    pub tools: Vec<ToolStatsSnapshot>,
}

/// A live session plus its recency bookkeeping.
pub struct SessionHandle {
    id: String,
    session: Arc<Mutex<AgentSession>>,
    last_active_ms: AtomicI64,
    last_use: AtomicU64,
}

impl SessionHandle {
    fn new(session: AgentSession, tick: u64) -> Self {
        Self {
            id: session.id().to_string(),
            session: Arc::new(Mutex::new(session)),
            last_active_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            last_use: AtomicU64::new(tick),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn touch(&self, tick: u64) {
        self.last_active_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.last_use.store(tick, Ordering::Relaxed);
    }

    /// When the session was last handed out, as unix milliseconds.
    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    /// Claim the session for one turn; fails if a turn is already running.
    pub fn try_begin_turn(&self) -> Result<OwnedMutexGuard<AgentSession>, SessionError> {
        Arc::clone(&self.session)
            .try_lock_owned()
            .map_err(|_| SessionError::Busy(self.id.clone()))
    }

    /// Wait for the session, e.g. to read stats or reset it.
    pub async fn lock(&self) -> MutexGuard<'_, AgentSession> {
        self.session.lock().await
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
    system_prompt: String,
    model: String,
    registry_factory: RegistryFactory,
    store: Option<Arc<dyn ConversationStore>>,
    rehydrate_limit: u32,
    ticks: AtomicU64,
}

impl SessionManager {
    pub fn new(
        max_sessions: usize,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
        registry_factory: RegistryFactory,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            system_prompt: system_prompt.into(),
            model: model.into(),
            registry_factory,
            store: None,
            rehydrate_limit: DEFAULT_REHYDRATE_LIMIT,
            ticks: AtomicU64::new(0),
        }
    }

    /// Rehydrate reopened conversations from `store`.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load at most the newest `limit` stored messages when rehydrating.
    pub fn with_rehydrate_limit(mut self, limit: u32) -> Self {
        self.rehydrate_limit = limit.max(1);
        self
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The session for `id`, creating it (and loading its history) if it is
    /// not live. Without an id a new conversation id is generated.
    pub async fn get_or_create(&self, id: Option<&str>) -> Result<Arc<SessionHandle>, SessionError> {
        if let Some(id) = id
            && let Some(handle) = self.get(id).await
        {
            return Ok(handle);
        }

        let conversation_id = id.map(ConversationId::from).unwrap_or_else(ConversationId::generate);
        let mut session = AgentSession::new(
            conversation_id.clone(),
            &self.system_prompt,
            (self.registry_factory)()?,
            self.model.clone(),
        );
        if id.is_some() {
            self.rehydrate(&mut session).await;
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(conversation_id.as_str()) {
            existing.touch(self.tick());
            return Ok(Arc::clone(existing));
        }
        if sessions.len() >= self.max_sessions && !evict_least_recent(&mut sessions) {
            warn!(
                live = sessions.len(),
                max_sessions = self.max_sessions,
                "Every session has a turn in progress, growing past the limit"
            );
        }
        let handle = Arc::new(SessionHandle::new(session, self.tick()));
        sessions.insert(conversation_id.to_string(), Arc::clone(&handle));
        debug!(conversation_id = %conversation_id, live = sessions.len(), "Session created");
        Ok(handle)
    }

    async fn rehydrate(&self, session: &mut AgentSession) {
        let Some(store) = &self.store else {
            return;
        };
        let rows = match self.load_tail(store.as_ref(), session.id()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(conversation_id = session.id(), error = %e, "Could not load history");
                return;
            }
        };
        // Start on a user message so no call is split from its output.
        let start = rows.iter().position(starts_turn).unwrap_or(rows.len());
        if start > 0 {
            debug!(conversation_id = session.id(), skipped = start, "Trimmed partial turn from history window");
        }
        let restored = session.restore(rows[start..].iter().filter_map(StoredMessage::to_message));
        if restored > 0 {
            info!(conversation_id = session.id(), restored, "Session rehydrated from store");
        }
    }

    /// The newest stored messages, oldest first.
    async fn load_tail(&self, store: &dyn ConversationStore, id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let total = store.count_messages(id).await?;
        let skip = u32::try_from(total.saturating_sub(u64::from(self.rehydrate_limit))).unwrap_or(u32::MAX);
        store.messages(id, skip, self.rehydrate_limit).await
    }

    /// A live session, marking it as used.
    pub async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let handle = self.sessions.read().await.get(id).cloned()?;
        handle.touch(self.tick());
        Some(handle)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Drop sessions idle for at least `max_idle`. Sessions with a turn in
    /// progress are kept. Returns how many were removed.
    pub async fn clear_inactive(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| handle.is_busy() || handle.last_active_ms() > cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, live = sessions.len(), "Cleared inactive sessions");
        }
        removed
    }

    /// Periodically clear sessions idle for `max_idle` until the manager is dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, max_idle: Duration) -> tokio::task::JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.clear_inactive(max_idle).await;
            }
        })
    }
}

fn starts_turn(row: &StoredMessage) -> bool {
    row.role == "user" && row.message_type == "message"
}

/// Remove the least recently used session that has no turn in progress.
/// Returns `false` if every session is busy.
fn evict_least_recent(sessions: &mut HashMap<String, Arc<SessionHandle>>) -> bool {
    let oldest = sessions
        .iter()
        .filter(|(_, handle)| !handle.is_busy())
        .min_by_key(|(_, handle)| handle.last_use.load(Ordering::Relaxed))
        .map(|(id, _)| id.clone());
    match oldest {
        Some(id) => {
            sessions.remove(&id);
            info!(conversation_id = %id, "Evicted least recently used session");
            true
        }
        None => false,
    }
}
