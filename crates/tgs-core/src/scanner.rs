//! Group discovery and live monitoring.
//!
//! Lifecycle: idle (no groups) -> discovered -> monitoring -> discovered.
//! - `discover_groups` walks the dialog list (or resolves the allow-list
//!   directly) and replaces the cached group list.
//! - `start_monitoring` subscribes to new messages, routes the ones from
//!   monitored groups into a bounded queue and spawns the worker pool.
//! - Workers run processor -> filter -> storage (-> AI reply) per message and
//!   keep going after per-message failures. A `SessionExpired` stops
//!   monitoring and is reported through [`GroupScanner::session_expired`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    command::StatsRecorder,
    config::ScanningConfig,
    domain::{ChatId, Group, Message},
    errors::Error,
    filter::RelevanceFilter,
    ports::{ChatKind, Dialog, RawMessage, TelegramClient},
    processor::MessageProcessor,
    resilience::{ErrorHandler, HealthMonitor},
    responder::AiResponder,
    storage::StorageManager,
    Result,
};

/// How long a worker waits on the queue before re-checking for cancellation.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Recent messages per group kept as AI reply context.
const CONTEXT_PER_GROUP: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub total_messages: usize,
    pub relevant_messages: usize,
    pub stored_messages: usize,
}

/// Everything the scanner needs, built once by the application.
pub struct ScannerParts {
    pub cfg: ScanningConfig,
    pub client: Arc<dyn TelegramClient>,
    pub processor: Arc<MessageProcessor>,
    pub filter: Arc<RelevanceFilter>,
    pub storage: Arc<StorageManager>,
    pub responder: Option<Arc<AiResponder>>,
    pub stats: Arc<StatsRecorder>,
    pub errors: Arc<ErrorHandler>,
    pub health: Arc<HealthMonitor>,
}

#[derive(Clone)]
pub struct GroupScanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    cfg: ScanningConfig,
    client: Arc<dyn TelegramClient>,
    processor: Arc<MessageProcessor>,
    filter: Arc<RelevanceFilter>,
    storage: Arc<StorageManager>,
    responder: Option<Arc<AiResponder>>,
    stats: Arc<StatsRecorder>,
    errors: Arc<ErrorHandler>,
    health: Arc<HealthMonitor>,

    groups: RwLock<Vec<Group>>,
    monitor: Mutex<Option<MonitorHandle>>,
    recent: std::sync::Mutex<HashMap<i64, VecDeque<Message>>>,
    dropped_events: AtomicU64,
    session_tx: watch::Sender<bool>,
}

struct MonitorHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    queue: Arc<Mutex<mpsc::Receiver<RawMessage>>>,
}

impl GroupScanner {
    pub fn new(parts: ScannerParts) -> Self {
        let (session_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScannerInner {
                cfg: parts.cfg,
                client: parts.client,
                processor: parts.processor,
                filter: parts.filter,
                storage: parts.storage,
                responder: parts.responder,
                stats: parts.stats,
                errors: parts.errors,
                health: parts.health,
                groups: RwLock::new(Vec::new()),
                monitor: Mutex::new(None),
                recent: std::sync::Mutex::new(HashMap::new()),
                dropped_events: AtomicU64::new(0),
                session_tx,
            }),
        }
    }

    // ============== Queries ==============

    pub async fn discovered_groups(&self) -> Vec<Group> {
        self.inner.groups.read().await.clone()
    }

    pub async fn group_count(&self) -> usize {
        self.inner.groups.read().await.len()
    }

    pub async fn group_by_id(&self, id: i64) -> Option<Group> {
        self.inner
            .groups
            .read()
            .await
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }

    pub async fn groups_by_name(&self, pattern: &str) -> Vec<Group> {
        self.inner
            .groups
            .read()
            .await
            .iter()
            .filter(|g| g.name_matches(pattern))
            .cloned()
            .collect()
    }

    pub async fn is_monitoring(&self) -> bool {
        self.inner.monitor.lock().await.is_some()
    }

    /// Live events dropped because the work queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    /// Flips to `true` when a worker hit `SessionExpired`.
    pub fn session_expired(&self) -> watch::Receiver<bool> {
        self.inner.session_tx.subscribe()
    }

    // ============== Discovery ==============

    pub async fn discover_groups(&self) -> Result<Vec<Group>> {
        let inner = &self.inner;
        if !inner.client.is_authorized().await? {
            return Err(Error::InvalidCredentials(
                "authentication required before discovering groups".to_string(),
            ));
        }

        info!(
            selected = inner.cfg.selected_groups.len(),
            "discovering groups"
        );
        let mut found: Vec<Group> = Vec::new();
        let limit = inner.cfg.discovery_timeout();

        match timeout(limit, self.discover_into(&mut found)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.health.record_failure("discover_groups", &e);
                return Err(e);
            }
            Err(_) if found.is_empty() => {
                let e = Error::Timeout(format!(
                    "group discovery found nothing within {}s",
                    limit.as_secs()
                ));
                inner.health.record_failure("discover_groups", &e);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    found = found.len(),
                    timeout_secs = limit.as_secs(),
                    "group discovery timed out, keeping partial results"
                );
            }
        }

        *inner.groups.write().await = found.clone();
        inner.health.record_success("discover_groups");
        info!(groups = found.len(), "group discovery finished");
        Ok(found)
    }

    async fn discover_into(&self, found: &mut Vec<Group>) -> Result<()> {
        let inner = &self.inner;
        let wanted: Vec<String> = inner
            .cfg
            .selected_groups
            .iter()
            .map(|s| normalize_name(s))
            .filter(|s| !s.is_empty())
            .collect();
        let mut seen: HashSet<i64> = HashSet::new();

        if !wanted.is_empty() {
            let mut all_found = true;
            for name in &wanted {
                let resolved = inner
                    .errors
                    .with_retry("resolve_group", || inner.client.resolve_dialog(name))
                    .await;
                match resolved {
                    Ok(Some(d)) if d.kind.is_group_like() => {
                        match self.group_from_dialog(&d).await? {
                            Some(g) if seen.insert(g.id) => found.push(g),
                            Some(_) => {}
                            None => all_found = false,
                        }
                    }
                    Ok(_) => {
                        debug!(group = %name, "group not resolvable directly");
                        all_found = false;
                    }
                    Err(e) if e.is_session_expired() => return Err(e),
                    Err(e) => {
                        warn!(group = %name, error = %e, "direct group lookup failed");
                        all_found = false;
                    }
                }
            }
            if all_found {
                debug!("all selected groups resolved directly");
                return Ok(());
            }
        }

        let mut dialogs = inner.client.iter_dialogs();
        while let Some(item) = dialogs.next().await {
            let d = match item {
                Ok(d) => d,
                Err(e) if e.is_session_expired() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "failed to read dialog, skipping");
                    continue;
                }
            };

            if !d.kind.is_group_like() || seen.contains(&d.id) {
                continue;
            }
            if !wanted.is_empty() && !dialog_matches(&d, &wanted) {
                continue;
            }

            if let Some(g) = self.group_from_dialog(&d).await? {
                seen.insert(g.id);
                found.push(g);
            }

            if !wanted.is_empty() && allow_list_satisfied(found, &wanted) {
                debug!("selected groups satisfied, stopping dialog walk");
                break;
            }
        }
        Ok(())
    }

    /// `Ok(None)` when the member count cannot be read (entity skipped).
    async fn group_from_dialog(&self, d: &Dialog) -> Result<Option<Group>> {
        let inner = &self.inner;
        let member_count = match d.participants_count {
            Some(n) => n,
            None => {
                let counted = inner
                    .errors
                    .with_retry("get_participants", || inner.client.participants_count(d))
                    .await;
                match counted {
                    Ok(n) => n,
                    Err(e) if e.is_session_expired() => return Err(e),
                    Err(Error::PermissionDenied(reason)) => {
                        debug!(group_id = d.id, %reason, "no access to members, skipping group");
                        return Ok(None);
                    }
                    Err(e) => {
                        warn!(group_id = d.id, error = %e, "member count failed, skipping group");
                        return Ok(None);
                    }
                }
            }
        };

        Ok(Some(Group {
            id: d.id,
            title: d.title.clone(),
            username: d.username.clone(),
            member_count,
            is_private: d.username.is_none(),
            access_hash: d.access_hash,
            is_channel: d.kind == ChatKind::Channel,
            is_megagroup: d.kind == ChatKind::Megagroup,
            last_scanned: None,
        }))
    }

    // ============== History ==============

    /// Run the backlog of every discovered group through filter and storage.
    pub async fn scan_history(&self) -> Result<HistorySummary> {
        let inner = &self.inner;
        let since = Utc::now() - chrono::Duration::days(i64::from(inner.cfg.max_history_days));
        let mut summary = HistorySummary::default();

        for group in self.discovered_groups().await {
            let msgs = match inner
                .processor
                .process_message_history(
                    inner.client.as_ref(),
                    ChatId(group.id),
                    inner.cfg.history_limit,
                    Some(since),
                )
                .await
            {
                Ok(m) => m,
                Err(e) if e.is_session_expired() => return Err(e),
                Err(e) => {
                    warn!(group_id = group.id, error = %e, "history scan failed for group");
                    continue;
                }
            };

            for mut m in msgs {
                if m.group_id == 0 {
                    m.group_id = group.id;
                }
                if m.group_name.is_empty() {
                    m.group_name = group.title.clone();
                }
                summary.total_messages += 1;

                if !inner.filter.apply(&mut m) {
                    continue;
                }
                summary.relevant_messages += 1;
                match inner.storage.store_message(&m).await {
                    Ok(true) => summary.stored_messages += 1,
                    Ok(false) => {}
                    Err(e) => warn!(message_id = m.id, error = %e, "failed to store history message"),
                }
            }

            let now = Utc::now();
            if let Some(g) = inner
                .groups
                .write()
                .await
                .iter_mut()
                .find(|g| g.id == group.id)
            {
                g.last_scanned = Some(now);
            }
        }

        info!(
            total = summary.total_messages,
            relevant = summary.relevant_messages,
            stored = summary.stored_messages,
            "history scan finished"
        );
        Ok(summary)
    }

    // ============== Monitoring ==============

    pub async fn start_monitoring(&self) -> Result<()> {
        let inner = &self.inner;
        let mut slot = inner.monitor.lock().await;
        if slot.is_some() {
            debug!("already monitoring");
            return Ok(());
        }

        let groups = self.discovered_groups().await;
        if groups.is_empty() {
            warn!("no groups discovered, nothing to monitor");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let events = inner
            .errors
            .with_retry("subscribe", || inner.client.subscribe(cancel.clone()))
            .await?;

        let (tx, rx) = mpsc::channel(inner.cfg.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(rx));
        inner.session_tx.send_replace(false);

        let monitored: HashSet<i64> = groups.iter().map(|g| g.id).collect();
        let workers = inner.cfg.max_workers.max(1).min(groups.len());

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(self.clone().route_events(
            events,
            tx,
            monitored,
            cancel.clone(),
        )));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(self.clone().run_worker(
                worker_id,
                queue.clone(),
                cancel.clone(),
            )));
        }

        *slot = Some(MonitorHandle {
            cancel,
            tasks,
            queue,
        });
        info!(groups = groups.len(), workers, "monitoring started");
        Ok(())
    }

    pub async fn stop_monitoring(&self) {
        let Some(handle) = self.inner.monitor.lock().await.take() else {
            return;
        };

        handle.cancel.cancel();
        for task in handle.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "monitoring task failed");
                }
            }
        }

        let mut rx = handle.queue.lock().await;
        rx.close();
        let mut drained = 0usize;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        info!(drained, "monitoring stopped");
    }

    async fn route_events(
        self,
        mut events: mpsc::Receiver<RawMessage>,
        tx: mpsc::Sender<RawMessage>,
        monitored: HashSet<i64>,
        cancel: CancellationToken,
    ) {
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => ev,
            };
            let Some(raw) = ev else {
                debug!("event subscription ended");
                break;
            };
            match raw.chat_id {
                Some(id) if monitored.contains(&id) => {}
                _ => continue,
            }
            if !enqueue(&tx, raw, &self.inner.dropped_events) {
                break;
            }
        }
    }

    async fn run_worker(
        self,
        worker_id: usize,
        queue: Arc<Mutex<mpsc::Receiver<RawMessage>>>,
        cancel: CancellationToken,
    ) {
        debug!(worker_id, "worker started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                r = async {
                    let mut rx = queue.lock().await;
                    timeout(POLL_INTERVAL, rx.recv()).await
                } => r,
            };

            let raw = match next {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(raw)) => raw,
            };

            match self.handle_message(raw).await {
                Ok(()) => {}
                Err(e) if e.is_session_expired() => {
                    error!(worker_id, error = %e, "session expired, stopping monitoring");
                    self.inner.health.record_failure("monitor_message", &e);
                    self.inner.session_tx.send_replace(true);
                    cancel.cancel();
                    let scanner = self.clone();
                    tokio::spawn(async move { scanner.stop_monitoring().await });
                    break;
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "message handling failed");
                    self.inner.health.record_failure("monitor_message", &e);
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    async fn handle_message(&self, raw: RawMessage) -> Result<()> {
        let inner = &self.inner;
        let mut msg = inner
            .processor
            .try_process_message(&raw, inner.client.as_ref())
            .await?;
        if msg.group_name.is_empty() {
            if let Some(g) = self.group_by_id(msg.group_id).await {
                msg.group_name = g.title;
            }
        }

        let relevant = inner.filter.apply(&mut msg);
        if relevant {
            match inner.storage.store_message(&msg).await {
                Ok(true) => self.maybe_respond(&msg).await?,
                Ok(false) => {}
                Err(e) => warn!(message_id = msg.id, error = %e, "failed to store message"),
            }
        }

        inner.stats.update_message_stats(
            msg.group_id,
            &msg.group_name,
            relevant,
            &msg.matched_criteria,
        );
        inner.health.record_success("monitor_message");
        self.remember(msg);
        Ok(())
    }

    async fn maybe_respond(&self, msg: &Message) -> Result<()> {
        let Some(responder) = &self.inner.responder else {
            return Ok(());
        };
        if !responder.auto_respond() {
            return Ok(());
        }

        let context = self.context_for(msg.group_id);
        match responder.generate_and_send_response(msg, &context).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_session_expired() => Err(e),
            Err(e) => {
                warn!(message_id = msg.id, error = %e, "ai auto-response failed");
                Ok(())
            }
        }
    }

    fn context_for(&self, group_id: i64) -> Vec<Message> {
        self.inner
            .recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&group_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remember(&self, msg: Message) {
        let mut recent = self.inner.recent.lock().unwrap_or_else(|e| e.into_inner());
        let q = recent.entry(msg.group_id).or_default();
        if q.len() >= CONTEXT_PER_GROUP {
            q.pop_front();
        }
        q.push_back(msg);
    }
}

/// Drop-newest when the queue is full. Returns `false` once the queue is closed.
fn enqueue(tx: &mpsc::Sender<RawMessage>, raw: RawMessage, dropped: &AtomicU64) -> bool {
    match tx.try_send(raw) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(raw)) => {
            let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                message_id = raw.id,
                chat_id = raw.chat_id.unwrap_or(0),
                dropped_total = n,
                "work queue full, dropping event"
            );
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn normalize_name(s: &str) -> String {
    s.trim().trim_start_matches('@').to_lowercase()
}

fn dialog_matches(d: &Dialog, wanted: &[String]) -> bool {
    let title = d.title.to_lowercase();
    let username = d.username.as_deref().map(str::to_lowercase);
    wanted
        .iter()
        .any(|w| *w == title || username.as_deref() == Some(w.as_str()))
}

fn allow_list_satisfied(found: &[Group], wanted: &[String]) -> bool {
    wanted.iter().all(|w| {
        found.iter().any(|g| {
            g.title.to_lowercase() == *w
                || g.username.as_deref().map(str::to_lowercase).as_deref() == Some(w.as_str())
        })
    })
}
