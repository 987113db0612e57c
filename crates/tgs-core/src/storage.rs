use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    fmt::Write as _,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{fs, sync::Mutex, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    domain::{Message, StoredMessage},
    errors::Error,
    resilience::HealthMonitor,
    utils::{digest_parts, file_stamp},
    Result,
};

/// Retries after the first failed write.
const PERSIST_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Txt => "txt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "text" => Ok(ExportFormat::Txt),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DateRange {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupCount {
    pub group_id: i64,
    /// Most recently stored title for the group.
    pub group_name: String,
    pub messages: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageStatistics {
    pub total_messages: usize,
    pub groups: usize,
    pub date_range: Option<DateRange>,
    pub top_groups: Vec<GroupCount>,
    pub media_types: BTreeMap<String, usize>,
    pub file_size_bytes: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    records: Vec<StoredMessage>,
    hashes: HashSet<String>,
}

/// Deduplicating, append-only JSON message store.
///
/// The whole list is rewritten on every insert. A `<file>.backup` copy
/// exists only while a write is in flight, so a crash never leaves the
/// store truncated.
#[derive(Debug)]
pub struct StorageManager {
    path: PathBuf,
    backup: PathBuf,
    state: Mutex<StoreState>,
    health: Arc<HealthMonitor>,
    retry_base: Duration,
}

impl StorageManager {
    pub fn new(path: impl Into<PathBuf>, health: Arc<HealthMonitor>) -> Self {
        let path = path.into();
        let mut backup = path.as_os_str().to_owned();
        backup.push(".backup");
        Self {
            path,
            backup: PathBuf::from(backup),
            state: Mutex::new(StoreState::default()),
            health,
            retry_base: Duration::from_secs(1),
        }
    }

    /// Override the first persist retry delay (doubles per attempt).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted list and rebuild the duplicate index.
    ///
    /// Never fails: an absent or unreadable store starts empty.
    pub async fn initialize(&self) -> usize {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "cannot create storage directory");
            }
        }

        // A leftover backup means the last write never completed.
        if fs::try_exists(&self.backup).await.unwrap_or(false) {
            warn!(backup = %self.backup.display(), "restoring store from leftover backup");
            if let Err(e) = fs::rename(&self.backup, &self.path).await {
                error!(error = %e, "failed to restore backup");
            }
        }

        let records = match fs::read_to_string(&self.path).await {
            Ok(txt) if txt.trim().is_empty() => Vec::new(),
            Ok(txt) => match serde_json::from_str::<Vec<StoredMessage>>(&txt) {
                Ok(v) => v,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "message store is corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "cannot read message store, starting empty");
                Vec::new()
            }
        };

        let mut st = self.state.lock().await;
        st.hashes = records.iter().map(|r| message_hash(&r.message)).collect();
        st.records = records;
        info!(messages = st.records.len(), path = %self.path.display(), "storage initialized");
        st.records.len()
    }

    pub async fn check_duplicate(&self, msg: &Message) -> bool {
        self.state.lock().await.hashes.contains(&message_hash(msg))
    }

    /// `Ok(true)` if the message was new and has been persisted.
    pub async fn store_message(&self, msg: &Message) -> Result<bool> {
        let mut st = self.state.lock().await;
        let hash = message_hash(msg);
        if st.hashes.contains(&hash) {
            debug!(message_id = msg.id, group_id = msg.group_id, "duplicate message, skipping");
            return Ok(false);
        }

        st.records.push(StoredMessage {
            message: msg.clone(),
            stored_at: Utc::now(),
        });
        st.hashes.insert(hash.clone());

        match self.persist(&st.records).await {
            Ok(()) => {
                self.health.record_success("storage_persist");
                debug!(message_id = msg.id, total = st.records.len(), "message stored");
                Ok(true)
            }
            Err(e) => {
                st.records.pop();
                st.hashes.remove(&hash);
                self.health.record_failure("storage_persist", &e);
                error!(message_id = msg.id, error = %e, "failed to persist message");
                Err(e)
            }
        }
    }

    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, records: &[StoredMessage]) -> Result<()> {
        let body = serde_json::to_vec_pretty(records)?;
        let mut attempt = 0u32;
        loop {
            match self.swap_write(&body).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_RETRIES => {
                    let delay = self.retry_base.saturating_mul(1u32 << attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store write failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if fs::try_exists(&self.backup).await.unwrap_or(false) {
                        if let Err(re) = fs::rename(&self.backup, &self.path).await {
                            error!(error = %re, "failed to restore store backup");
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn swap_write(&self, body: &[u8]) -> Result<()> {
        if fs::try_exists(&self.backup).await? {
            // Backup from a failed attempt is the good copy; the main file may be partial.
            if fs::try_exists(&self.path).await? {
                fs::remove_file(&self.path).await?;
            }
        } else if fs::try_exists(&self.path).await? {
            fs::rename(&self.path, &self.backup).await?;
        }

        fs::write(&self.path, body).await?;

        if fs::try_exists(&self.backup).await? {
            fs::remove_file(&self.backup).await?;
        }
        Ok(())
    }

    /// Write every stored message to `path` (or a timestamped file next to
    /// the store). `Ok(None)` when there is nothing to export.
    pub async fn export_data(
        &self,
        format: ExportFormat,
        path: Option<PathBuf>,
    ) -> Result<Option<PathBuf>> {
        let records = self.messages().await;
        if records.is_empty() {
            warn!("no messages to export");
            return Ok(None);
        }

        let out = match path {
            Some(p) => p,
            None => {
                let name = format!(
                    "telegram_export_{}.{}",
                    file_stamp(Utc::now()),
                    format.extension()
                );
                match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                }
            }
        };

        let body = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(&records)?,
            ExportFormat::Csv => render_csv(&records)?,
            ExportFormat::Txt => render_txt(&records).into_bytes(),
        };

        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&out, body).await?;
        info!(path = %out.display(), format = %format, messages = records.len(), "data exported");
        Ok(Some(out))
    }

    pub async fn get_statistics(&self) -> StorageStatistics {
        let records = self.messages().await;

        let mut by_group: HashMap<i64, (&str, usize)> = HashMap::new();
        let mut media_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut range: Option<DateRange> = None;

        for r in &records {
            let m = &r.message;
            let slot = by_group.entry(m.group_id).or_insert(("", 0));
            slot.0 = m.group_name.as_str();
            slot.1 += 1;
            if m.media_type != crate::domain::MediaType::None {
                *media_types.entry(m.media_type.as_str().to_string()).or_default() += 1;
            }
            range = Some(match range {
                None => DateRange {
                    earliest: m.timestamp,
                    latest: m.timestamp,
                },
                Some(d) => DateRange {
                    earliest: d.earliest.min(m.timestamp),
                    latest: d.latest.max(m.timestamp),
                },
            });
        }

        let group_count = by_group.len();
        let mut top_groups: Vec<GroupCount> = by_group
            .into_iter()
            .map(|(id, (name, n))| GroupCount {
                group_id: id,
                group_name: name.to_string(),
                messages: n,
            })
            .collect();
        top_groups.sort_by(|a, b| {
            b.messages
                .cmp(&a.messages)
                .then_with(|| a.group_name.cmp(&b.group_name))
                .then_with(|| a.group_id.cmp(&b.group_id))
        });
        top_groups.truncate(10);

        let file_size_bytes = fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        StorageStatistics {
            total_messages: records.len(),
            groups: group_count,
            date_range: range,
            top_groups,
            media_types,
            file_size_bytes,
        }
    }
}

fn message_hash(m: &Message) -> String {
    digest_parts(&[&m.id.to_string(), &m.group_id.to_string(), &m.content])
}

/// Flat dump; columns come from the first record's keys.
fn render_csv(records: &[StoredMessage]) -> Result<Vec<u8>> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = records
        .iter()
        .map(|r| match serde_json::to_value(r) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Ok(serde_json::Map::new()),
            Err(e) => Err(Error::from(e)),
        })
        .collect::<Result<_>>()?;

    let header: Vec<String> = rows
        .first()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(&header)?;
    for row in &rows {
        w.write_record(header.iter().map(|k| csv_cell(row.get(k))))?;
    }
    w.into_inner()
        .map_err(|e| Error::External(format!("csv flush failed: {e}")))
}

fn csv_cell(v: Option<&serde_json::Value>) -> String {
    use serde_json::Value;
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| match i {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => other.to_string(),
    }
}

fn render_txt(records: &[StoredMessage]) -> String {
    let mut out = String::new();
    for r in records {
        let m = &r.message;
        let _ = writeln!(out, "Message ID: {}", m.id);
        let _ = writeln!(out, "Group: {} ({})", m.group_name, m.group_id);
        let _ = writeln!(out, "Sender: {} ({})", m.sender_username, m.sender_id);
        let _ = writeln!(out, "Time: {}", m.timestamp.to_rfc3339());
        let _ = writeln!(out, "Media: {}", m.media_type.as_str());
        let _ = writeln!(out, "Relevance: {:.2}", m.relevance_score);
        if !m.matched_criteria.is_empty() {
            let _ = writeln!(out, "Matched: {}", m.matched_criteria.join(", "));
        }
        let _ = writeln!(out, "Content:\n{}", m.content);
        if let Some(extra) = m.extracted_text.as_deref().filter(|s| !s.is_empty()) {
            let _ = writeln!(out, "Extracted Text:\n{extra}");
        }
        let _ = writeln!(out, "{}", "-".repeat(50));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaType;
    use chrono::TimeZone;

    fn msg(id: i64, group_id: i64, content: &str) -> Message {
        Message {
            id,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, id as u32 % 60).unwrap(),
            group_id,
            group_name: format!("group-{group_id}"),
            sender_id: 7,
            sender_username: "alice".into(),
            content: content.into(),
            media_type: MediaType::None,
            extracted_text: None,
            relevance_score: 1.0,
            matched_criteria: vec!["urgent".into()],
        }
    }

    fn manager(dir: &Path) -> StorageManager {
        StorageManager::new(dir.join("messages.json"), Arc::new(HealthMonitor::new()))
    }

    #[tokio::test]
    async fn duplicates_are_keyed_on_id_group_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;

        assert!(s.store_message(&msg(1, 10, "hello")).await.unwrap());
        assert!(!s.store_message(&msg(1, 10, "hello")).await.unwrap());

        let mut changed_other = msg(1, 10, "hello");
        changed_other.sender_username = "bob".into();
        changed_other.timestamp = Utc::now();
        assert!(!s.store_message(&changed_other).await.unwrap());
        assert!(s.check_duplicate(&changed_other).await);

        assert!(s.store_message(&msg(2, 10, "hello")).await.unwrap());
        assert!(s.store_message(&msg(1, 11, "hello")).await.unwrap());
        assert!(s.store_message(&msg(1, 10, "hello!")).await.unwrap());
        assert_eq!(s.len().await, 4);
    }

    #[tokio::test]
    async fn reload_reproduces_records_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;
        let mut with_media = msg(3, 20, "scan");
        with_media.media_type = MediaType::Photo;
        with_media.extracted_text = Some("ocr text".into());
        for m in [msg(1, 10, "a"), msg(2, 10, "b"), with_media] {
            s.store_message(&m).await.unwrap();
        }
        assert!(!dir.path().join("messages.json.backup").exists());

        let fresh = manager(dir.path());
        assert_eq!(fresh.initialize().await, 3);
        assert_eq!(fresh.messages().await, s.messages().await);
        assert!(fresh.check_duplicate(&msg(2, 10, "b")).await);
    }

    #[tokio::test]
    async fn corrupt_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("messages.json"), "[{broken").unwrap();
        let s = manager(dir.path());
        assert_eq!(s.initialize().await, 0);
        assert!(s.store_message(&msg(1, 1, "x")).await.unwrap());
    }

    #[tokio::test]
    async fn leftover_backup_is_restored_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;
        s.store_message(&msg(1, 1, "kept")).await.unwrap();

        let store = dir.path().join("messages.json");
        std::fs::rename(&store, dir.path().join("messages.json.backup")).unwrap();
        std::fs::write(&store, "[{partial").unwrap();

        let fresh = manager(dir.path());
        assert_eq!(fresh.initialize().await, 1);
        assert!(!dir.path().join("messages.json.backup").exists());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file").unwrap();

        let health = Arc::new(HealthMonitor::new());
        let s = StorageManager::new(blocker.join("messages.json"), health.clone())
            .with_retry_base(Duration::from_millis(1));
        s.initialize().await;

        assert!(s.store_message(&msg(1, 1, "x")).await.is_err());
        assert!(s.is_empty().await);
        assert!(!s.check_duplicate(&msg(1, 1, "x")).await);
        assert_eq!(health.get_health_status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn exports_all_formats() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;
        assert!(s.export_data(ExportFormat::Json, None).await.unwrap().is_none());

        s.store_message(&msg(1, 10, "first")).await.unwrap();
        s.store_message(&msg(2, 10, "second, with comma")).await.unwrap();

        let json = s
            .export_data(ExportFormat::Json, Some(dir.path().join("out/export.json")))
            .await
            .unwrap()
            .unwrap();
        let parsed: Vec<StoredMessage> =
            serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);

        let csv_path = s.export_data(ExportFormat::Csv, None).await.unwrap().unwrap();
        assert!(csv_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("telegram_export_"));
        let mut rdr = csv::Reader::from_path(&csv_path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert!(headers.iter().any(|h| h == "stored_at"));
        let content_col = headers.iter().position(|h| h == "content").unwrap();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(&rows[1][content_col], "second, with comma");

        let txt = s
            .export_data(ExportFormat::Txt, Some(dir.path().join("export.txt")))
            .await
            .unwrap()
            .unwrap();
        let body = std::fs::read_to_string(txt).unwrap();
        assert!(body.contains("Group: group-10 (10)"));
        assert!(body.contains("Matched: urgent"));
    }

    #[test]
    fn unknown_export_format_is_an_error() {
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(Error::UnsupportedFormat(_))
        ));
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
    }

    #[tokio::test]
    async fn statistics_summarize_store() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;
        let mut photo = msg(5, 20, "pic");
        photo.media_type = MediaType::Photo;
        for m in [msg(1, 10, "a"), msg(2, 10, "b"), photo] {
            s.store_message(&m).await.unwrap();
        }

        let st = s.get_statistics().await;
        assert_eq!(st.total_messages, 3);
        assert_eq!(st.groups, 2);
        assert_eq!(st.top_groups[0].group_name, "group-10");
        assert_eq!(st.top_groups[0].messages, 2);
        assert_eq!(st.media_types.get("photo"), Some(&1));
        assert!(!st.media_types.contains_key("none"));
        let range = st.date_range.unwrap();
        assert!(range.earliest < range.latest);
        assert!(st.file_size_bytes > 0);
    }

    #[tokio::test]
    async fn top_groups_keep_same_titled_groups_apart() {
        let dir = tempfile::tempdir().unwrap();
        let s = manager(dir.path());
        s.initialize().await;
        let mut msgs = vec![msg(1, 10, "a"), msg(2, 10, "b"), msg(3, 20, "c")];
        for m in &mut msgs {
            m.group_name = "Announcements".into();
        }
        let mut untitled = msg(4, 30, "d");
        untitled.group_name = String::new();
        let mut also_untitled = msg(5, 40, "e");
        also_untitled.group_name = String::new();
        msgs.extend([untitled, also_untitled]);
        for m in &msgs {
            s.store_message(m).await.unwrap();
        }

        let st = s.get_statistics().await;
        assert_eq!(st.groups, 4);
        assert_eq!(st.top_groups.len(), 4);
        assert_eq!(
            (st.top_groups[0].group_id, st.top_groups[0].messages),
            (10, 2)
        );
        let ids: Vec<i64> = st.top_groups.iter().map(|g| g.group_id).collect();
        assert_eq!(ids, vec![10, 30, 40, 20]);
        assert!(st.top_groups.iter().all(|g| g.messages <= 2));
    }
}
