//! Orchestration between local feedback sessions and the remote chat channel.
//!
//! Outbound text is formatted, chunked, rate limited and sent in order per
//! session; every sent chunk is correlated so that a reply quoting it can be
//! routed back. The inbound side runs either as a poll loop or behind the
//! webhook queue, and each cycle sweeps expired correlations and sessions.

use crate::chunker::{Chunk, MessageChunker};
use crate::config::BridgeConfig;
use crate::correlation::CorrelationStore;
use crate::cursor::{CursorStore, MemoryCursorStore};
use crate::error::{BridgeError, Result};
use crate::format::format_outbound;
use crate::rate_limit::{Acquire, RateLimiter};
use crate::session::{
    BridgeSession, ForwardReport, LocalSession, RemoteReply, ReplyDisposition, SessionEvent,
    SessionId, SessionState,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fb_channels::{
    ChannelError, ChatId, MessageId, OutboundText, RemoteChannel, RemoteUpdate, SentMessage,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const SESSION_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Started,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub channel: String,
    pub open: usize,
    pub awaiting: usize,
    pub closed: usize,
    pub correlations: usize,
    pub cursor: i64,
}

pub struct Bridge {
    cfg: BridgeConfig,
    chat_id: ChatId,
    channel: Arc<dyn RemoteChannel>,
    local: Arc<dyn LocalSession>,
    cursor_store: Arc<dyn CursorStore>,
    limiter: RateLimiter,
    chunker: MessageChunker,
    correlations: CorrelationStore,
    sessions: DashMap<SessionId, BridgeSession>,
    send_locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
    cursor: AtomicI64,
}

impl Bridge {
    pub fn new(
        cfg: BridgeConfig,
        chat_id: ChatId,
        channel: Arc<dyn RemoteChannel>,
        local: Arc<dyn LocalSession>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            limiter: RateLimiter::new(cfg.rate_limit.max_requests, cfg.rate_window()),
            chunker: MessageChunker::new(cfg.max_message_length),
            cfg,
            chat_id,
            channel,
            local,
            cursor_store: Arc::new(MemoryCursorStore::default()),
            correlations: CorrelationStore::new(),
            sessions: DashMap::new(),
            send_locks: DashMap::new(),
            cursor: AtomicI64::new(0),
        })
    }

    pub fn with_cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = store;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Load the persisted poll cursor. Missing state starts from zero.
    pub async fn restore_cursor(&self) -> anyhow::Result<i64> {
        let cursor = self.cursor_store.load().await?.unwrap_or(0);
        self.cursor.store(cursor, Ordering::SeqCst);
        tracing::info!(cursor, "bridge poll cursor restored");
        Ok(cursor)
    }

    /// Register a session. Reopening a closed id starts it afresh. Fails with
    /// `SessionLimit` when `max_sessions` sessions are already live.
    pub fn open_session(&self, session_id: SessionId, disposition: ReplyDisposition) -> Result<()> {
        let reopening = self
            .sessions
            .get(&session_id)
            .is_none_or(|session| session.is_closed());
        if reopening {
            self.check_capacity(&session_id)?;
        }

        let now = Utc::now();
        self.sessions
            .entry(session_id.clone())
            .and_modify(|session| {
                if session.is_closed() {
                    *session = BridgeSession::new(session_id.clone(), disposition, now);
                } else {
                    session.disposition = disposition;
                }
            })
            .or_insert_with(|| BridgeSession::new(session_id.clone(), disposition, now));
        tracing::debug!(session_id = %session_id, ?disposition, "bridge session opened");
        Ok(())
    }

    fn check_capacity(&self, session_id: &SessionId) -> Result<()> {
        let limit = self.cfg.max_sessions;
        let live = self
            .sessions
            .iter()
            .filter(|session| !session.is_closed())
            .count();
        if live >= limit {
            tracing::warn!(session_id = %session_id, limit, "session limit reached");
            return Err(BridgeError::SessionLimit {
                session_id: session_id.clone(),
                limit,
            });
        }
        Ok(())
    }

    pub fn session_state(&self, session_id: &SessionId) -> Option<SessionState> {
        self.sessions.get(session_id).map(|session| session.state)
    }

    /// Close a session locally and drop its pending correlations so late
    /// replies cannot be routed into it. Returns how many were dropped.
    pub fn close_session(&self, session_id: &SessionId) -> usize {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        session.close(Utc::now());
        let removed = self.correlations.remove_session(session_id);
        tracing::info!(session_id = %session_id, removed, "bridge session closed");
        removed
    }

    /// Send `text` to the remote chat on behalf of `session_id`.
    ///
    /// Chunks go out in order under a per-session lock. A failure part way
    /// through reports how many chunks were already delivered.
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn forward(&self, session_id: &SessionId, text: &str) -> Result<ForwardReport> {
        if text.trim().is_empty() {
            return Err(BridgeError::EmptyMessage);
        }
        self.ensure_session(session_id)?;

        let lock = self
            .send_locks
            .entry(session_id.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;
        self.ensure_session(session_id)?;

        let formatted = format_outbound(&self.cfg.format, session_id, text, Utc::now());
        let chunks = self.chunker.chunk(&formatted)?;
        let total = chunks.len();
        let mut message_ids = Vec::with_capacity(total);

        for chunk in &chunks {
            let sent = self
                .send_chunk(session_id, chunk, message_ids.len(), total)
                .await?;
            if !self.correlate(session_id, &sent.message_id) {
                let delivered = message_ids.len() + 1;
                tracing::info!(delivered, total, "session closed while forwarding; stopping");
                return Err(BridgeError::ClosedMidForward {
                    session_id: session_id.clone(),
                    delivered,
                    total,
                });
            }
            message_ids.push(sent.message_id);
        }

        tracing::info!(total, "bridge forward delivered");
        Ok(ForwardReport {
            session_id: session_id.clone(),
            total_chunks: total,
            message_ids,
        })
    }

    /// Unknown sessions are opened implicitly, within the session limit;
    /// closed ones refuse new content.
    fn ensure_session(&self, session_id: &SessionId) -> Result<()> {
        match self.session_state(session_id) {
            Some(SessionState::Closed) => Err(BridgeError::SessionClosed(session_id.clone())),
            Some(_) => Ok(()),
            None => {
                self.check_capacity(session_id)?;
                self.sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| {
                        BridgeSession::new(
                            session_id.clone(),
                            ReplyDisposition::KeepOpen,
                            Utc::now(),
                        )
                    });
                Ok(())
            }
        }
    }

    async fn send_chunk(
        &self,
        session_id: &SessionId,
        chunk: &Chunk,
        delivered: usize,
        total: usize,
    ) -> Result<SentMessage> {
        let max_wait = self.cfg.max_rate_wait();
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            let wait = match self.limiter.acquire() {
                Acquire::Denied { retry_after } => Some(retry_after),
                Acquire::Allowed => {
                    let outbound = OutboundText::plain(chunk.render());
                    match self.channel.send_text(&self.chat_id, outbound).await {
                        Ok(sent) => return Ok(sent),
                        Err(ChannelError::RateLimited { retry_after }) => Some(retry_after),
                        Err(error) if error.is_transient() => {
                            attempt += 1;
                            if attempt >= self.cfg.send_max_attempts {
                                return Err(BridgeError::ChannelUnavailable {
                                    attempts: attempt,
                                    delivered,
                                    total,
                                    reason: error.to_string(),
                                });
                            }
                            let delay = self.cfg.retry_delay(attempt);
                            tracing::warn!(
                                %error,
                                attempt,
                                ?delay,
                                chunk = chunk.index,
                                "remote send failed; retrying with backoff"
                            );
                            tokio::time::sleep(delay).await;
                            None
                        }
                        Err(error) => {
                            return Err(BridgeError::ChannelUnavailable {
                                attempts: attempt + 1,
                                delivered,
                                total,
                                reason: error.to_string(),
                            });
                        }
                    }
                }
            };

            if let Some(retry_after) = wait {
                if waited + retry_after > max_wait {
                    return Err(BridgeError::DeliveryFailed {
                        session_id: session_id.clone(),
                        delivered,
                        total,
                        waited,
                    });
                }
                tracing::debug!(?retry_after, chunk = chunk.index, "rate limited; waiting");
                tokio::time::sleep(retry_after).await;
                waited += retry_after;
            }
        }
    }

    /// Uncorrelated notice about a session's lifecycle; replies to it route
    /// nowhere. Failures are logged and otherwise ignored.
    async fn lifecycle_notice(&self, session_id: &SessionId, event: Lifecycle) {
        if !self.cfg.lifecycle_notices {
            return;
        }
        let text = match event {
            Lifecycle::Started => format!("🎯 Session {} started", session_id.short()),
            Lifecycle::Completed => format!("🏁 Session {} completed", session_id.short()),
        };
        let chunks = match self.chunker.chunk(&text) {
            Ok(chunks) => chunks,
            Err(error) => {
                tracing::warn!(%error, session_id = %session_id, "lifecycle notice not built");
                return;
            }
        };
        let total = chunks.len();
        for (delivered, chunk) in chunks.iter().enumerate() {
            if let Err(error) = self.send_chunk(session_id, chunk, delivered, total).await {
                tracing::warn!(%error, session_id = %session_id, ?event, "lifecycle notice not sent");
                return;
            }
        }
        tracing::debug!(session_id = %session_id, ?event, "lifecycle notice sent");
    }

    /// Record a sent chunk against its session while holding the session entry,
    /// so a concurrent close cannot leave a stale correlation behind. Returns
    /// false when the session is gone or closed.
    fn correlate(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if session.is_closed() {
            return false;
        }
        match self.correlations.record(
            message_id.clone(),
            session_id.clone(),
            self.cfg.correlation_ttl(),
        ) {
            Ok(()) => session.mark_awaiting(Utc::now()),
            Err(error) => {
                tracing::error!(%error, session_id = %session_id, "dropping correlation write");
            }
        }
        true
    }

    /// Route one inbound update. Returns whether it reached a local session.
    #[tracing::instrument(level = "debug", skip_all, fields(update_id = update.update_id))]
    pub async fn handle_update(&self, update: &RemoteUpdate) -> bool {
        if !self.accepts_chat(&update.chat_id) {
            tracing::debug!(chat_id = %update.chat_id, "update from another chat ignored");
            return false;
        }

        let session_id = match update.reply_to_message_id.as_ref() {
            Some(reply_to) => self.correlations.resolve(reply_to),
            None if self.cfg.route_unthreaded_replies => self.latest_awaiting(),
            None => None,
        };
        let Some(session_id) = session_id else {
            tracing::debug!("update does not answer a tracked message");
            return false;
        };

        let routable = self
            .sessions
            .get(&session_id)
            .is_some_and(|session| !session.is_closed());
        if !routable {
            tracing::debug!(session_id = %session_id, "reply for closed session discarded");
            return false;
        }
        self.correlations.remove_session(&session_id);

        let reply = RemoteReply {
            session_id: session_id.clone(),
            text: update.text.clone(),
            remote_message_id: update.message_id.clone(),
            sender_id: update.sender_id.clone(),
            received_at: update.timestamp,
        };
        if let Err(error) = self.local.route_reply(reply).await {
            tracing::warn!(%error, session_id = %session_id, "local session rejected reply");
        }

        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if !session.is_closed() {
                session.reply_routed(Utc::now());
            }
        }
        tracing::info!(session_id = %session_id, "remote reply routed");
        true
    }

    /// `@username` targets cannot be compared with the numeric ids updates carry.
    fn accepts_chat(&self, chat_id: &ChatId) -> bool {
        self.chat_id.starts_with('@') || &self.chat_id == chat_id
    }

    fn latest_awaiting(&self) -> Option<SessionId> {
        self.sessions
            .iter()
            .filter(|session| session.state == SessionState::AwaitingRemote)
            .max_by_key(|session| session.awaiting_since)
            .map(|session| session.id.clone())
    }

    /// One poll of the remote channel. Transient failures are retried with
    /// backoff up to `poll_max_attempts`.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn poll_once(&self) -> Result<usize> {
        let cursor = self.cursor();
        let mut attempt: u32 = 0;
        let batch = loop {
            match self
                .channel
                .poll_updates(cursor, self.cfg.poll_timeout())
                .await
            {
                Ok(batch) => break batch,
                Err(error) if error.is_transient() && attempt + 1 < self.cfg.poll_max_attempts => {
                    attempt += 1;
                    let delay = match error {
                        ChannelError::RateLimited { retry_after } => retry_after,
                        _ => self.cfg.retry_delay(attempt),
                    };
                    tracing::warn!(%error, attempt, ?delay, "remote poll failed; retrying with backoff");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(BridgeError::ChannelUnavailable {
                        attempts: attempt + 1,
                        delivered: 0,
                        total: 0,
                        reason: error.to_string(),
                    });
                }
            }
        };

        let mut routed = 0;
        for update in &batch.updates {
            if self.handle_update(update).await {
                routed += 1;
            }
        }

        if batch.next_cursor != cursor {
            self.cursor.store(batch.next_cursor, Ordering::SeqCst);
            if let Err(error) = self.cursor_store.save(batch.next_cursor).await {
                tracing::warn!(%error, cursor = batch.next_cursor, "failed to persist poll cursor");
            }
        }
        Ok(routed)
    }

    /// Expire correlations and sessions. Sessions that waited past the
    /// awaiting timeout, or lost every correlation to TTL, are closed and the
    /// local side is told. Returns the sessions closed by this sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let swept = self.correlations.sweep_expired(now);
        if !swept.is_empty() {
            tracing::debug!(count = swept.len(), "expired correlations removed");
        }

        let timeout = chrono_duration(self.cfg.awaiting_timeout());
        let mut expired = Vec::new();
        for mut session in self.sessions.iter_mut() {
            let orphaned = session.state == SessionState::AwaitingRemote
                && !self.correlations.has_session(&session.id);
            if orphaned || session.awaiting_expired(now, timeout) {
                session.close(now);
                expired.push(session.id.clone());
            }
        }

        for session_id in &expired {
            self.correlations.remove_session(session_id);
            tracing::info!(session_id = %session_id, "bridge session expired awaiting reply");
            self.local.session_expired(session_id).await;
        }

        let retention = chrono_duration(self.cfg.correlation_ttl());
        self.sessions.retain(|_, session| {
            !(session.is_closed() && now.signed_duration_since(session.last_activity) >= retention)
        });
        self.send_locks
            .retain(|session_id, _| self.sessions.contains_key(session_id));
        expired
    }

    /// Poll then sweep. Errors are logged; the next cycle starts fresh.
    pub async fn run_cycle(&self) {
        if let Err(error) = self.poll_once().await {
            tracing::warn!(%error, "bridge poll cycle failed; continuing");
        }
        self.sweep(Utc::now()).await;
    }

    pub fn status(&self) -> BridgeStatus {
        let mut status = BridgeStatus {
            channel: self.channel.channel_id().to_string(),
            open: 0,
            awaiting: 0,
            closed: 0,
            correlations: self.correlations.len(),
            cursor: self.cursor(),
        };
        for session in self.sessions.iter() {
            match session.state {
                SessionState::Open => status.open += 1,
                SessionState::AwaitingRemote => status.awaiting += 1,
                SessionState::Closed => status.closed += 1,
            }
        }
        status
    }

    pub fn start_polling(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_poll_loop(shutdown).await {
                tracing::error!(%e, "bridge poll loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        if let Err(error) = self.restore_cursor().await {
            tracing::warn!(%error, "could not restore poll cursor; starting from zero");
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.run_cycle() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
            }
        }
    }

    /// Consume updates pushed by the webhook receiver instead of polling.
    pub fn start_webhook(
        self: Arc<Self>,
        updates: mpsc::Receiver<RemoteUpdate>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_webhook_loop(updates, shutdown).await {
                tracing::error!(%e, "bridge webhook loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_webhook_loop(
        &self,
        mut updates: mpsc::Receiver<RemoteUpdate>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut sweep = tokio::time::interval(self.cfg.poll_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                update = updates.recv() => {
                    let Some(update) = update else {
                        return Err(anyhow::anyhow!("webhook update queue closed"));
                    };
                    self.handle_update(&update).await;
                }
                _ = sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }

    /// Drive forwarding from local session events. Each session gets its own
    /// worker so its messages stay ordered without holding up other sessions.
    pub fn start_session_events(
        self: Arc<Self>,
        events: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_session_events(events, shutdown).await {
                tracing::error!(%e, "bridge session event loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_session_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SessionEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut queues: HashMap<SessionId, mpsc::Sender<String>> = HashMap::new();
        let mut workers: JoinSet<SessionId> = JoinSet::new();
        let mut prune = tokio::time::interval(self.cfg.poll_interval());
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                event = events.recv() => match event {
                    Some(SessionEvent::Outbound { session_id, text }) => {
                        self.dispatch_outbound(&mut queues, &mut workers, session_id, text);
                    }
                    Some(SessionEvent::Closed { session_id }) => {
                        let was_live = self
                            .session_state(&session_id)
                            .is_some_and(|state| state != SessionState::Closed);
                        self.close_session(&session_id);
                        queues.remove(&session_id);
                        if was_live && self.cfg.lifecycle_notices {
                            let bridge = Arc::clone(&self);
                            workers.spawn(async move {
                                bridge.lifecycle_notice(&session_id, Lifecycle::Completed).await;
                                session_id
                            });
                        }
                    }
                    None => break Err(anyhow::anyhow!("session event queue closed")),
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(error) = joined {
                        tracing::error!(%error, "session worker failed");
                    }
                }
                _ = prune.tick() => {
                    queues.retain(|session_id, _| {
                        self.session_state(session_id) != Some(SessionState::Closed)
                    });
                }
            }
        };

        drop(queues);
        workers.shutdown().await;
        result
    }

    /// Hand `text` to the session's worker without waiting on its queue. A full
    /// queue fails that one message back through `delivery_report`.
    fn dispatch_outbound(
        self: &Arc<Self>,
        queues: &mut HashMap<SessionId, mpsc::Sender<String>>,
        workers: &mut JoinSet<SessionId>,
        session_id: SessionId,
        text: String,
    ) {
        let queue = queues.entry(session_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
            let announce = self.session_state(&session_id).is_none();
            workers.spawn(Arc::clone(self).session_worker(session_id.clone(), rx, announce));
            tx
        });
        let error = match queue.try_send(text) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(_)) => BridgeError::QueueFull {
                session_id: session_id.clone(),
                capacity: SESSION_QUEUE_CAPACITY,
            },
            Err(mpsc::error::TrySendError::Closed(text)) => {
                // The worker died; a fresh queue gets a fresh worker.
                tracing::error!(session_id = %session_id, "session worker queue closed; restarting");
                queues.remove(&session_id);
                return self.dispatch_outbound(queues, workers, session_id, text);
            }
        };

        tracing::warn!(%error, session_id = %session_id, "outbound text not queued");
        let bridge = Arc::clone(self);
        workers.spawn(async move {
            bridge.local.delivery_report(&session_id, &Err(error)).await;
            session_id
        });
    }

    async fn session_worker(
        self: Arc<Self>,
        session_id: SessionId,
        mut texts: mpsc::Receiver<String>,
        announce: bool,
    ) -> SessionId {
        if announce && self.ensure_session(&session_id).is_ok() {
            self.lifecycle_notice(&session_id, Lifecycle::Started).await;
        }
        while let Some(text) = texts.recv().await {
            let outcome = self.forward(&session_id, &text).await;
            if let Err(error) = &outcome {
                tracing::warn!(%error, session_id = %session_id, "forward from session event failed");
            }
            self.local.delivery_report(&session_id, &outcome).await;
        }
        session_id
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
