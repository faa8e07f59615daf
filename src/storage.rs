use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::dispatch::{JobState, NotificationJob, Priority};
use crate::verify::{self, ChainReport, ChainRow};
use crate::{hash_entry, now_ms, GestureEvent, GestureLabel, SessionMetadata, TrackId};

/// Destination for confirmed events and dispatch outcomes.
///
/// Callers treat every method as fire-and-forget: errors are logged at the
/// call site and never stop frame processing or delivery.
pub trait EventSink: Send + Sync {
    fn open_session(&self, session: &SessionMetadata) -> Result<()>;

    /// Append a confirmed event. The session row is created if
    /// `open_session` was never called for it; an event stamped with a
    /// different session id is rejected.
    fn record(&self, event: &GestureEvent, session: &SessionMetadata) -> Result<()>;

    fn record_dispatch(&self, record: &DispatchRecord) -> Result<()>;

    fn record_system(&self, event: &SystemEvent) -> Result<()>;

    fn close_session(&self, session_id: &str, ended_at_ms: u64) -> Result<()>;
}

/// Terminal outcome of one notification job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub created_at_ms: u64,
    pub channel: String,
    pub session_id: String,
    pub track_id: TrackId,
    pub label: GestureLabel,
    pub priority: Priority,
    pub state: JobState,
    pub attempts: u32,
    pub detail: Option<String>,
}

impl DispatchRecord {
    pub fn from_job(job: &NotificationJob, detail: Option<String>) -> Self {
        Self {
            created_at_ms: now_ms().unwrap_or_default(),
            channel: job.channel.clone(),
            session_id: job.event.session_id().to_string(),
            track_id: job.event.track_id(),
            label: job.event.label(),
            priority: job.priority,
            state: job.state,
            attempts: job.attempts,
            detail,
        }
    }
}

fn check_session(event: &GestureEvent, session: &SessionMetadata) -> Result<()> {
    if event.session_id() != session.session_id {
        return Err(anyhow!(
            "event for session '{}' recorded under '{}'",
            event.session_id(),
            session.session_id
        ));
    }
    Ok(())
}

/// Lifecycle and alarm entries kept next to the gesture events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    SessionStarted,
    SessionStopped,
    DispatcherDrained,
    JobDropped,
}

impl SystemEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEventKind::SessionStarted => "session_started",
            SystemEventKind::SessionStopped => "session_stopped",
            SystemEventKind::DispatcherDrained => "dispatcher_drained",
            SystemEventKind::JobDropped => "job_dropped",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "session_started" => Ok(SystemEventKind::SessionStarted),
            "session_stopped" => Ok(SystemEventKind::SessionStopped),
            "dispatcher_drained" => Ok(SystemEventKind::DispatcherDrained),
            "job_dropped" => Ok(SystemEventKind::JobDropped),
            other => Err(anyhow!("unknown system event type '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(anyhow!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub created_at_ms: u64,
    pub kind: SystemEventKind,
    pub severity: Severity,
    pub data: serde_json::Value,
}

impl SystemEvent {
    pub fn new(kind: SystemEventKind, severity: Severity, data: serde_json::Value) -> Self {
        Self {
            created_at_ms: now_ms().unwrap_or_default(),
            kind,
            severity,
            data,
        }
    }
}

/// Event row as read back from the log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoggedEvent {
    pub id: i64,
    pub event: GestureEvent,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    pub total_events: u64,
    pub per_label: BTreeMap<GestureLabel, u64>,
    pub mean_confidence: Option<f32>,
}

impl SessionStats {
    pub fn unique_labels(&self) -> usize {
        self.per_label.len()
    }

    fn from_events<'a>(
        session_id: &str,
        events: impl Iterator<Item = &'a GestureEvent>,
    ) -> Self {
        let mut per_label = BTreeMap::new();
        let mut total = 0u64;
        let mut sum = 0.0f64;
        for ev in events {
            *per_label.entry(ev.label()).or_insert(0) += 1;
            total += 1;
            sum += f64::from(ev.confidence());
        }
        Self {
            session_id: session_id.to_string(),
            started_at_ms: None,
            ended_at_ms: None,
            total_events: total,
            per_label,
            mean_confidence: (total > 0).then(|| (sum / total as f64) as f32),
        }
    }
}

// -------------------- SQLite --------------------

/// Hash-chained SQLite event log.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open event log {}", db_path))?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.ensure_schema()?;
        Ok(log)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sessions (
              id TEXT PRIMARY KEY,
              started_at_ms INTEGER NOT NULL,
              ended_at_ms INTEGER,
              source TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS gesture_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              session_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              label TEXT NOT NULL,
              confidence REAL NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dispatch_outcomes (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              channel TEXT NOT NULL,
              session_id TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              label TEXT NOT NULL,
              priority TEXT NOT NULL,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              detail TEXT
            );

            CREATE TABLE IF NOT EXISTS system_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              event_type TEXT NOT NULL,
              severity TEXT NOT NULL DEFAULT 'info',
              event_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              cutoff_event_id INTEGER NOT NULL,
              chain_head_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_created ON gesture_events(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_events_session ON gesture_events(session_id);
            "#,
        )?;
        Ok(())
    }

    fn chain_tail(conn: &Connection) -> Result<[u8; 32]> {
        let last: Option<Vec<u8>> = conn
            .query_row(
                "SELECT entry_hash FROM gesture_events ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match last {
            Some(bytes) => <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| anyhow!("corrupt event log: entry_hash size")),
            None => Ok(verify::latest_checkpoint_head(conn)?.unwrap_or([0u8; 32])),
        }
    }

    /// Recompute the hash chain.
    pub fn verify(&self) -> Result<ChainReport> {
        verify::verify_chain(&*self.lock()?)
    }

    /// Prune events older than `retention`, checkpointing the chain head first.
    pub fn enforce_retention(&self, retention: Duration) -> Result<Option<i64>> {
        self.enforce_retention_at(now_ms()?, retention)
    }

    /// Returns the id of the newest pruned event, if anything was pruned.
    pub fn enforce_retention_at(&self, now_ms: u64, retention: Duration) -> Result<Option<i64>> {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = to_i64(now_ms.saturating_sub(retention_ms))?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let newest_old: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT id, entry_hash FROM gesture_events WHERE created_at_ms < ?1 ORDER BY id DESC LIMIT 1",
                params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((cutoff_id, head)) = newest_old else {
            return Ok(None);
        };
        if head.len() != 32 {
            return Err(anyhow!("corrupt event log: entry_hash size at id {}", cutoff_id));
        }

        tx.execute(
            "INSERT INTO checkpoints(created_at_ms, cutoff_event_id, chain_head_hash) VALUES (?1, ?2, ?3)",
            params![to_i64(now_ms)?, cutoff_id, head],
        )?;
        let pruned = tx.execute(
            "DELETE FROM gesture_events WHERE id <= ?1",
            params![cutoff_id],
        )?;
        tx.commit()?;
        log::info!("retention pruned {} event(s) up to id {}", pruned, cutoff_id);
        Ok(Some(cutoff_id))
    }

    /// Newest first, optionally limited to one session.
    pub fn recent_events(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<LoggedEvent>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT id, payload_json FROM gesture_events
             WHERE (?1 IS NULL OR session_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            let event: GestureEvent = serde_json::from_str(&payload)
                .with_context(|| format!("corrupt event payload at id {}", id))?;
            out.push(LoggedEvent { id, event });
        }
        Ok(out)
    }

    pub fn sessions(&self) -> Result<Vec<(SessionMetadata, Option<u64>)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at_ms, ended_at_ms, source FROM sessions ORDER BY started_at_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, started, ended, source) = row?;
            let meta = SessionMetadata {
                session_id: id,
                started_at_ms: to_u64(started)?,
                source,
            };
            out.push((meta, ended.map(to_u64).transpose()?));
        }
        Ok(out)
    }

    pub fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let conn = self.lock()?;
        let bounds: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at_ms, ended_at_ms FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT label, COUNT(*) FROM gesture_events WHERE session_id = ?1 GROUP BY label",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut per_label = BTreeMap::new();
        for row in rows {
            let (label, count) = row?;
            per_label.insert(label.parse::<GestureLabel>()?, to_u64(count)?);
        }

        let (total, mean): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(confidence) FROM gesture_events WHERE session_id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(SessionStats {
            session_id: session_id.to_string(),
            started_at_ms: bounds.map(|(s, _)| to_u64(s)).transpose()?,
            ended_at_ms: bounds.and_then(|(_, e)| e).map(to_u64).transpose()?,
            total_events: to_u64(total)?,
            per_label,
            mean_confidence: mean.map(|m| m as f32),
        })
    }

    /// Newest first.
    pub fn system_events(&self, limit: usize) -> Result<Vec<SystemEvent>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT id, created_at_ms, event_type, severity, event_data FROM system_events
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, created, kind, severity, data) = row?;
            out.push(SystemEvent {
                created_at_ms: to_u64(created)?,
                kind: SystemEventKind::parse(&kind)?,
                severity: Severity::parse(&severity)?,
                data: serde_json::from_str(&data)
                    .with_context(|| format!("corrupt system event data at id {}", id))?,
            });
        }
        Ok(out)
    }

    /// Dispatch outcomes grouped by final state, e.g. `{"delivered": 12, "dropped": 1}`.
    pub fn dispatch_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM dispatch_outcomes GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (state, count) = row?;
            out.insert(state, to_u64(count)?);
        }
        Ok(out)
    }
}

impl EventSink for SqliteEventLog {
    fn open_session(&self, session: &SessionMetadata) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO sessions(id, started_at_ms, ended_at_ms, source) VALUES (?1, ?2, NULL, ?3)",
            params![
                session.session_id,
                to_i64(session.started_at_ms)?,
                session.source
            ],
        )?;
        Ok(())
    }

    fn record(&self, event: &GestureEvent, session: &SessionMetadata) -> Result<()> {
        check_session(event, session)?;
        let payload_json = serde_json::to_string(event)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO sessions(id, started_at_ms, ended_at_ms, source) VALUES (?1, ?2, NULL, ?3)",
            params![
                session.session_id,
                to_i64(session.started_at_ms)?,
                session.source
            ],
        )?;
        let prev_hash = Self::chain_tail(&tx)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        tx.execute(
            r#"
            INSERT INTO gesture_events(created_at_ms, session_id, track_id, label, confidence, payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                to_i64(event.timestamp_ms())?,
                event.session_id(),
                to_i64(event.track_id().as_u64())?,
                event.label().as_str(),
                f64::from(event.confidence()),
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_dispatch(&self, record: &DispatchRecord) -> Result<()> {
        self.lock()?.execute(
            r#"
            INSERT INTO dispatch_outcomes(created_at_ms, channel, session_id, track_id, label, priority, state, attempts, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                to_i64(record.created_at_ms)?,
                record.channel,
                record.session_id,
                to_i64(record.track_id.as_u64())?,
                record.label.as_str(),
                record.priority.as_str(),
                record.state.as_str(),
                record.attempts,
                record.detail
            ],
        )?;
        Ok(())
    }

    fn record_system(&self, event: &SystemEvent) -> Result<()> {
        self.lock()?.execute(
            "INSERT INTO system_events(created_at_ms, event_type, severity, event_data) VALUES (?1, ?2, ?3, ?4)",
            params![
                to_i64(event.created_at_ms)?,
                event.kind.as_str(),
                event.severity.as_str(),
                serde_json::to_string(&event.data)?
            ],
        )?;
        Ok(())
    }

    fn close_session(&self, session_id: &str, ended_at_ms: u64) -> Result<()> {
        let updated = self.lock()?.execute(
            "UPDATE sessions SET ended_at_ms = ?2 WHERE id = ?1",
            params![session_id, to_i64(ended_at_ms)?],
        )?;
        if updated == 0 {
            return Err(anyhow!("unknown session '{}'", session_id));
        }
        Ok(())
    }
}

fn to_i64(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| anyhow!("value {} exceeds i64 range", v))
}

fn to_u64(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| anyhow!("negative value {} in event log", v))
}

// -------------------- In-memory --------------------

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    events: Vec<(ChainRow, GestureEvent)>,
    checkpoints: Vec<[u8; 32]>,
    sessions: BTreeMap<String, (SessionMetadata, Option<u64>)>,
    dispatches: Vec<DispatchRecord>,
    system: Vec<SystemEvent>,
}

impl InMemoryState {
    fn chain_tail(&self) -> [u8; 32] {
        self.events
            .last()
            .map(|(row, _)| row.entry_hash)
            .or_else(|| self.checkpoints.last().copied())
            .unwrap_or([0u8; 32])
    }
}

/// Same contract as `SqliteEventLog`, kept in process memory. Used by tests
/// and by runs that opt out of persistence.
#[derive(Default)]
pub struct InMemoryEventLog {
    state: Mutex<InMemoryState>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<GestureEvent> {
        self.lock()
            .map(|st| st.events.iter().map(|(_, ev)| ev.clone()).collect())
            .unwrap_or_default()
    }

    pub fn dispatch_records(&self) -> Vec<DispatchRecord> {
        self.lock()
            .map(|st| st.dispatches.clone())
            .unwrap_or_default()
    }

    /// Oldest first.
    pub fn system_events(&self) -> Vec<SystemEvent> {
        self.lock()
            .map(|st| st.system.clone())
            .unwrap_or_default()
    }

    pub fn session(&self, session_id: &str) -> Option<(SessionMetadata, Option<u64>)> {
        self.lock().ok()?.sessions.get(session_id).cloned()
    }

    pub fn verify(&self) -> Result<ChainReport> {
        let st = self.lock()?;
        let rows = st.events.iter().map(|(row, _)| row.clone());
        Ok(verify::verify_rows(st.checkpoints.last().copied(), rows))
    }

    pub fn enforce_retention_at(&self, now_ms: u64, retention: Duration) -> Result<Option<i64>> {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(retention_ms);
        let mut st = self.lock()?;
        let Some(idx) = st
            .events
            .iter()
            .rposition(|(_, ev)| ev.timestamp_ms() < cutoff)
        else {
            return Ok(None);
        };
        let (head, cutoff_id) = {
            let row = &st.events[idx].0;
            (row.entry_hash, row.id)
        };
        st.checkpoints.push(head);
        st.events.drain(..=idx);
        Ok(Some(cutoff_id))
    }

    pub fn session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let st = self.lock()?;
        let mut stats = SessionStats::from_events(
            session_id,
            st.events
                .iter()
                .map(|(_, ev)| ev)
                .filter(|ev| ev.session_id() == session_id),
        );
        if let Some((meta, ended)) = st.sessions.get(session_id) {
            stats.started_at_ms = Some(meta.started_at_ms);
            stats.ended_at_ms = *ended;
        }
        Ok(stats)
    }
}

impl EventSink for InMemoryEventLog {
    fn open_session(&self, session: &SessionMetadata) -> Result<()> {
        self.lock()?
            .sessions
            .entry(session.session_id.clone())
            .or_insert_with(|| (session.clone(), None));
        Ok(())
    }

    fn record(&self, event: &GestureEvent, session: &SessionMetadata) -> Result<()> {
        check_session(event, session)?;
        let payload_json = serde_json::to_string(event)?;
        let mut st = self.lock()?;
        st.sessions
            .entry(session.session_id.clone())
            .or_insert_with(|| (session.clone(), None));
        let prev_hash = st.chain_tail();
        st.next_id += 1;
        let row = ChainRow {
            id: st.next_id,
            entry_hash: hash_entry(&prev_hash, payload_json.as_bytes()),
            payload_json,
            prev_hash,
        };
        st.events.push((row, event.clone()));
        Ok(())
    }

    fn record_dispatch(&self, record: &DispatchRecord) -> Result<()> {
        self.lock()?.dispatches.push(record.clone());
        Ok(())
    }

    fn record_system(&self, event: &SystemEvent) -> Result<()> {
        self.lock()?.system.push(event.clone());
        Ok(())
    }

    fn close_session(&self, session_id: &str, ended_at_ms: u64) -> Result<()> {
        let mut st = self.lock()?;
        let entry = st
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session '{}'", session_id))?;
        entry.1 = Some(ended_at_ms);
        Ok(())
    }
}
