//! Command and control: the scanner lifecycle state machine.
//!
//! | Command | Valid from               | Result  |
//! |---------|--------------------------|---------|
//! | start   | stopped                  | running |
//! | stop    | running, paused, error   | stopped |
//! | pause   | running                  | paused  |
//! | resume  | paused                   | running |
//!
//! Every command runs under one mutex, so concurrent commands are applied
//! one at a time. Invalid transitions return a failed [`CommandResult`] and
//! leave the state alone.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex as StdMutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    app::ScannerApp,
    errors::Error,
    resilience::HealthSnapshot,
    scanner::HistorySummary,
    storage::StorageStatistics,
    utils::start_of_day,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerState {
    Stopped,
    Running,
    Paused,
    Error,
}

impl ScannerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScannerState::Stopped => "stopped",
            ScannerState::Running => "running",
            ScannerState::Paused => "paused",
            ScannerState::Error => "error",
        }
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub state: ScannerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_monitored: Option<usize>,
}

impl CommandResult {
    fn ok(message: impl Into<String>, state: ScannerState) -> Self {
        Self {
            success: true,
            message: message.into(),
            state,
            groups_monitored: None,
        }
    }

    fn fail(message: impl Into<String>, state: ScannerState) -> Self {
        Self {
            success: false,
            message: message.into(),
            state,
            groups_monitored: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScannerStatus {
    pub state: ScannerState,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub messages_processed: u64,
    pub groups_monitored: usize,
    pub relevant_messages_found: u64,
    pub uptime_seconds: f64,
    pub monitoring: bool,
    pub dropped_events: u64,
    pub last_error: Option<String>,
    pub health: HealthSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupReport {
    pub group_id: i64,
    pub group_name: String,
    pub messages_processed: u64,
    pub relevant_messages: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PerformanceMetrics {
    pub uptime_seconds: f64,
    pub uptime_percentage: f64,
    pub messages_per_minute: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanningReport {
    pub report_generated: DateTime<Utc>,
    pub scan_period_start: DateTime<Utc>,
    pub scan_period_end: DateTime<Utc>,
    pub total_messages_processed: u64,
    pub relevant_messages_found: u64,
    pub groups_scanned: Vec<GroupReport>,
    pub top_keywords: Vec<KeywordCount>,
    pub error_summary: BTreeMap<String, u64>,
    pub performance_metrics: PerformanceMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStatistics>,
}

// ============== Statistics ==============

#[derive(Clone, Debug, Default)]
struct GroupCounters {
    name: String,
    processed: u64,
    relevant: u64,
    last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    relevant: u64,
    last_scan_time: Option<DateTime<Utc>>,
    groups: HashMap<i64, GroupCounters>,
    keywords: HashMap<String, u64>,
    errors: BTreeMap<String, u64>,
}

/// Running totals fed by the scanner workers and the history scan.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    counters: StdMutex<Counters>,
}

impl StatsRecorder {
    /// Called once per processed message, relevant or not.
    pub fn update_message_stats(
        &self,
        group_id: i64,
        group_name: &str,
        is_relevant: bool,
        keywords: &[String],
    ) {
        let now = Utc::now();
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.processed += 1;
        c.last_scan_time = Some(now);

        let g = c.groups.entry(group_id).or_default();
        if g.name.is_empty() {
            g.name = group_name.to_string();
        }
        g.processed += 1;
        g.last_activity = Some(now);

        if is_relevant {
            g.relevant += 1;
            c.relevant += 1;
            for k in keywords {
                *c.keywords.entry(k.clone()).or_default() += 1;
            }
        }
    }

    pub fn record_history(&self, summary: &HistorySummary) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.processed += summary.total_messages as u64;
        c.relevant += summary.relevant_messages as u64;
        c.last_scan_time = Some(Utc::now());
    }

    pub fn record_error(&self, kind: &str) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *c.errors.entry(kind.to_string()).or_default() += 1;
    }

    /// (processed, relevant)
    pub fn totals(&self) -> (u64, u64) {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        (c.processed, c.relevant)
    }

    pub fn last_scan_time(&self) -> Option<DateTime<Utc>> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_scan_time
    }

    pub fn error_summary(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .errors
            .clone()
    }

    pub fn top_keywords(&self, n: usize) -> Vec<KeywordCount> {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<KeywordCount> = c
            .keywords
            .iter()
            .map(|(k, v)| KeywordCount {
                keyword: k.clone(),
                count: *v,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.keyword.cmp(&b.keyword)));
        out.truncate(n);
        out
    }

    fn group(&self, id: i64) -> Option<GroupCounters> {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .get(&id)
            .cloned()
    }
}

// ============== Command interface ==============

struct Control {
    state: ScannerState,
    start_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Watches for session expiry while running.
    supervisor: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct CommandInterface {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    app: Arc<ScannerApp>,
    control: Mutex<Control>,
}

impl CommandInterface {
    pub fn new(app: Arc<ScannerApp>) -> Self {
        Self {
            inner: Arc::new(CommandInner {
                app,
                control: Mutex::new(Control {
                    state: ScannerState::Stopped,
                    start_time: None,
                    last_error: None,
                    supervisor: None,
                }),
            }),
        }
    }

    pub fn app(&self) -> &Arc<ScannerApp> {
        &self.inner.app
    }

    pub async fn current_state(&self) -> ScannerState {
        self.inner.control.lock().await.state
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.control.lock().await.last_error.clone()
    }

    pub fn update_message_stats(
        &self,
        group_id: i64,
        group_name: &str,
        is_relevant: bool,
        keywords: &[String],
    ) {
        self.inner
            .app
            .stats()
            .update_message_stats(group_id, group_name, is_relevant, keywords);
    }

    pub async fn start(&self) -> CommandResult {
        let mut ctl = self.inner.control.lock().await;
        if ctl.state != ScannerState::Stopped {
            return CommandResult::fail(
                format!(
                    "Cannot start scanner from {} state. Must be stopped first.",
                    ctl.state
                ),
                ctl.state,
            );
        }

        info!("starting scanner");
        match self.run_start().await {
            Ok(groups) => {
                ctl.state = ScannerState::Running;
                ctl.start_time = Some(Utc::now());
                ctl.last_error = None;
                ctl.supervisor = Some(self.spawn_supervisor());
                info!(groups, "scanner started");
                CommandResult {
                    groups_monitored: Some(groups),
                    ..CommandResult::ok("Scanner started successfully", ctl.state)
                }
            }
            Err(e) => {
                let msg = format!("Failed to start scanner: {e}");
                error!(error = %e, "scanner start failed");
                ctl.state = ScannerState::Error;
                ctl.last_error = Some(msg.clone());
                self.inner.app.stats().record_error("start_command");
                CommandResult::fail(msg, ctl.state)
            }
        }
    }

    async fn run_start(&self) -> Result<usize> {
        let app = &self.inner.app;
        let c = app.initialize().await?;

        let client = app.telegram();
        app.errors()
            .with_retry("connect", || client.connect())
            .await?;
        if !client.is_authorized().await? {
            return Err(Error::InvalidCredentials(
                "not authorized; complete Telegram login first".to_string(),
            ));
        }

        if c.scanner.group_count().await == 0 {
            c.scanner.discover_groups().await?;
        }

        info!("scanning historical messages");
        let summary = c.scanner.scan_history().await?;
        app.stats().record_history(&summary);

        c.scanner.start_monitoring().await?;
        Ok(c.scanner.group_count().await)
    }

    pub async fn stop(&self) -> CommandResult {
        let mut ctl = self.inner.control.lock().await;
        if ctl.state == ScannerState::Stopped {
            return CommandResult::fail("Scanner is already stopped", ctl.state);
        }

        if let Some(c) = self.inner.app.components() {
            c.scanner.stop_monitoring().await;
        }
        if let Some(token) = ctl.supervisor.take() {
            token.cancel();
        }
        ctl.state = ScannerState::Stopped;
        ctl.start_time = None;
        ctl.last_error = None;
        info!("scanner stopped");
        CommandResult::ok("Scanner stopped successfully", ctl.state)
    }

    pub async fn pause(&self) -> CommandResult {
        let mut ctl = self.inner.control.lock().await;
        if ctl.state != ScannerState::Running {
            return CommandResult::fail(
                format!("Cannot pause scanner in {} state", ctl.state),
                ctl.state,
            );
        }

        if let Some(c) = self.inner.app.components() {
            c.scanner.stop_monitoring().await;
        }
        ctl.state = ScannerState::Paused;
        info!("scanner paused");
        CommandResult::ok("Scanner paused successfully", ctl.state)
    }

    pub async fn resume(&self) -> CommandResult {
        let mut ctl = self.inner.control.lock().await;
        if ctl.state != ScannerState::Paused {
            return CommandResult::fail(
                format!("Cannot resume scanner from {} state", ctl.state),
                ctl.state,
            );
        }

        let resumed = match self.inner.app.components() {
            Some(c) => c.scanner.start_monitoring().await,
            None => Err(Error::Config("scanner components are not initialized".into())),
        };
        match resumed {
            Ok(()) => {
                ctl.state = ScannerState::Running;
                info!("scanner resumed");
                CommandResult::ok("Scanner resumed successfully", ctl.state)
            }
            Err(e) => {
                warn!(error = %e, "resume failed");
                self.inner.app.stats().record_error("resume_command");
                CommandResult::fail(format!("Failed to resume scanner: {e}"), ctl.state)
            }
        }
    }

    pub async fn get_status(&self) -> ScannerStatus {
        let ctl = self.inner.control.lock().await;
        let app = &self.inner.app;
        let (processed, relevant) = app.stats().totals();

        let (groups, monitoring, dropped) = match app.components() {
            Some(c) => (
                c.scanner.group_count().await,
                c.scanner.is_monitoring().await,
                c.scanner.dropped_events(),
            ),
            None => (0, false, 0),
        };

        ScannerStatus {
            state: ctl.state,
            last_scan_time: app.stats().last_scan_time(),
            messages_processed: processed,
            groups_monitored: groups,
            relevant_messages_found: relevant,
            uptime_seconds: uptime_secs(ctl.start_time, Utc::now()),
            monitoring,
            dropped_events: dropped,
            last_error: ctl.last_error.clone(),
            health: app.health().get_health_status(),
        }
    }

    /// Activity summary; the period defaults to the start of today until now.
    pub async fn generate_report(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> ScanningReport {
        let now = Utc::now();
        let period_start = start.unwrap_or_else(|| start_of_day(now));
        let period_end = end.unwrap_or(now);

        let start_time = self.inner.control.lock().await.start_time;
        let app = &self.inner.app;
        let stats = app.stats();
        let (processed, relevant) = stats.totals();

        let mut groups_scanned = Vec::new();
        let mut storage = None;
        if let Some(c) = app.components() {
            for g in c.scanner.discovered_groups().await {
                let counters = stats.group(g.id).unwrap_or_default();
                groups_scanned.push(GroupReport {
                    group_id: g.id,
                    group_name: g.title,
                    messages_processed: counters.processed,
                    relevant_messages: counters.relevant,
                    last_activity: counters.last_activity,
                });
            }
            storage = Some(c.storage.get_statistics().await);
        }

        let uptime = uptime_secs(start_time, now);
        let period_secs = (period_end - period_start).num_milliseconds().max(0) as f64 / 1000.0;
        let uptime_percentage = if period_secs > 0.0 {
            (uptime / period_secs * 100.0).min(100.0)
        } else {
            0.0
        };
        let messages_per_minute = if uptime > 0.0 {
            processed as f64 / (uptime / 60.0)
        } else {
            0.0
        };

        ScanningReport {
            report_generated: now,
            scan_period_start: period_start,
            scan_period_end: period_end,
            total_messages_processed: processed,
            relevant_messages_found: relevant,
            groups_scanned,
            top_keywords: stats.top_keywords(10),
            error_summary: stats.error_summary(),
            performance_metrics: PerformanceMetrics {
                uptime_seconds: uptime,
                uptime_percentage,
                messages_per_minute,
            },
            storage,
        }
    }

    fn spawn_supervisor(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let Some(c) = self.inner.app.components() else {
            return token;
        };
        let mut expired = c.scanner.session_expired();
        let this = self.clone();
        let stop = token.clone();

        tokio::spawn(async move {
            let hit = tokio::select! {
                _ = stop.cancelled() => false,
                r = expired.wait_for(|v| *v) => r.is_ok(),
            };
            if hit {
                this.on_session_expired().await;
            }
        });
        token
    }

    async fn on_session_expired(&self) {
        let mut ctl = self.inner.control.lock().await;
        if !matches!(ctl.state, ScannerState::Running | ScannerState::Paused) {
            return;
        }
        if let Some(c) = self.inner.app.components() {
            c.scanner.stop_monitoring().await;
        }
        ctl.supervisor = None;
        ctl.state = ScannerState::Error;
        ctl.last_error = Some("Telegram session expired; re-authentication required".to_string());
        self.inner.app.stats().record_error("session_expired");
        error!("session expired, scanner moved to error state");
    }
}

fn uptime_secs(start: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    start
        .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}
