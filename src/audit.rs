//! Append-only audit trail.
//!
//! Two sinks: a bounded in-memory ring buffer for queries and a
//! date-partitioned JSONL file for forensics. Recording never fails the
//! operation being audited; sink errors degrade to a tracing warning.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecuteStart,
    ExecuteEnd,
    ExecuteBlocked,
    ExecuteError,
    ExecuteTimeout,
    InstallStart,
    InstallEnd,
    InstallBlocked,
    CacheHit,
    CacheMiss,
    CachePrune,
    SessionCreate,
    SessionDestroy,
    SessionPause,
    SessionResume,
    SessionExtend,
    PoolAcquire,
    PoolRelease,
    PoolEvict,
    PoolBackfill,
    PoolUnhealthy,
    CleanIncomplete,
    SecurityViolation,
    FileRead,
    FileWrite,
    FileDelete,
    FileList,
    RateLimited,
    Shutdown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteStart => "EXECUTE_START",
            Self::ExecuteEnd => "EXECUTE_END",
            Self::ExecuteBlocked => "EXECUTE_BLOCKED",
            Self::ExecuteError => "EXECUTE_ERROR",
            Self::ExecuteTimeout => "EXECUTE_TIMEOUT",
            Self::InstallStart => "INSTALL_START",
            Self::InstallEnd => "INSTALL_END",
            Self::InstallBlocked => "INSTALL_BLOCKED",
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::CachePrune => "CACHE_PRUNE",
            Self::SessionCreate => "SESSION_CREATE",
            Self::SessionDestroy => "SESSION_DESTROY",
            Self::SessionPause => "SESSION_PAUSE",
            Self::SessionResume => "SESSION_RESUME",
            Self::SessionExtend => "SESSION_EXTEND",
            Self::PoolAcquire => "POOL_ACQUIRE",
            Self::PoolRelease => "POOL_RELEASE",
            Self::PoolEvict => "POOL_EVICT",
            Self::PoolBackfill => "POOL_BACKFILL",
            Self::PoolUnhealthy => "POOL_UNHEALTHY",
            Self::CleanIncomplete => "CLEAN_INCOMPLETE",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::FileRead => "FILE_READ",
            Self::FileWrite => "FILE_WRITE",
            Self::FileDelete => "FILE_DELETE",
            Self::FileList => "FILE_LIST",
            Self::RateLimited => "RATE_LIMITED",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Severity inferred when the event does not carry one explicitly.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::SecurityViolation => Severity::Critical,
            Self::ExecuteBlocked | Self::InstallBlocked | Self::RateLimited => Severity::Warn,
            Self::ExecuteError | Self::ExecuteTimeout => Severity::Error,
            _ => Severity::Info,
        }
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// New successful event with inferred severity.
    pub fn new(event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            event_type,
            severity: event_type.default_severity(),
            language: None,
            session_id: None,
            container_id: None,
            details: serde_json::Map::new(),
            duration_ms: None,
            success: true,
            error: None,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn duration_ms(mut self, millis: u64) -> Self {
        self.duration_ms = Some(millis);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Mark failed with an error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Filter for ring-buffer queries.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub language: Option<String>,
}

impl EventFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(event_type) = self.event_type
            && event.event_type != event_type
        {
            return false;
        }
        if let Some(severity) = self.severity
            && event.severity != severity
        {
            return false;
        }
        if let Some(ref language) = self.language
            && event.language.as_deref() != Some(language.as_str())
        {
            return false;
        }
        true
    }
}

/// Aggregate view over the ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_events: usize,
    pub by_type: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
    pub violations: usize,
    pub blocked_executions: usize,
    pub avg_execute_duration_ms: f64,
    pub events_last_hour: usize,
}

struct FileSink {
    date: String,
    file: File,
}

/// Append-only audit log with an in-memory ring and a JSONL file sink.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    log_dir: PathBuf,
    sink: Mutex<Option<FileSink>>,
}

impl AuditLog {
    /// Create a log writing JSONL files under `log_dir`.
    pub fn new(log_dir: PathBuf, capacity: usize) -> Self {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            warn!("Cannot create audit log directory {:?}: {}", log_dir, e);
        }

        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            log_dir,
            sink: Mutex::new(None),
        }
    }

    /// Record an event in both sinks. Never fails; sink errors are logged.
    pub fn record(&self, event: AuditEvent) {
        self.append_file(&event);

        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    fn append_file(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot serialize audit event: {}", e);
                return;
            }
        };

        let today = event.timestamp.format("%Y-%m-%d").to_string();
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Roll the file when the date changes
        let needs_open = sink.as_ref().map(|s| s.date != today).unwrap_or(true);
        if needs_open {
            let path = self.log_dir.join(format!("audit-{today}.jsonl"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    *sink = Some(FileSink { date: today, file });
                }
                Err(e) => {
                    warn!("Cannot open audit log {:?}: {}", path, e);
                    *sink = None;
                    return;
                }
            }
        }

        if let Some(ref mut s) = *sink
            && let Err(e) = writeln!(s.file, "{line}")
        {
            warn!("Cannot append audit event: {}", e);
        }
    }

    /// Most recent `n` events, newest first, optionally filtered.
    pub fn recent(&self, n: usize, filter: Option<&EventFilter>) -> Vec<AuditEvent> {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.iter()
            .rev()
            .filter(|event| filter.map(|f| f.matches(event)).unwrap_or(true))
            .take(n)
            .cloned()
            .collect()
    }

    /// Most recent `n` security-relevant events (violations and blocks).
    pub fn security_events(&self, n: usize) -> Vec<AuditEvent> {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.iter()
            .rev()
            .filter(|event| {
                matches!(
                    event.event_type,
                    EventType::SecurityViolation
                        | EventType::ExecuteBlocked
                        | EventType::InstallBlocked
                )
            })
            .take(n)
            .cloned()
            .collect()
    }

    /// Aggregate statistics over the ring buffer.
    pub fn stats(&self) -> AuditStats {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        let mut violations = 0;
        let mut blocked_executions = 0;
        let mut execute_durations: Vec<u64> = Vec::new();
        let mut events_last_hour = 0;
        let hour_ago = Utc::now() - Duration::hours(1);

        for event in ring.iter() {
            *by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
            *by_severity
                .entry(event.severity.as_str().to_string())
                .or_insert(0) += 1;

            if event.event_type == EventType::SecurityViolation {
                violations += 1;
            }
            if event.event_type == EventType::ExecuteBlocked {
                blocked_executions += 1;
            }
            if event.event_type == EventType::ExecuteEnd
                && let Some(duration) = event.duration_ms
            {
                execute_durations.push(duration);
            }
            if event.timestamp > hour_ago {
                events_last_hour += 1;
            }
        }

        let avg_execute_duration_ms = if execute_durations.is_empty() {
            0.0
        } else {
            execute_durations.iter().sum::<u64>() as f64 / execute_durations.len() as f64
        };

        AuditStats {
            total_events: ring.len(),
            by_type,
            by_severity,
            violations,
            blocked_executions,
            avg_execute_duration_ms,
            events_last_hour,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log(capacity: usize) -> (AuditLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().to_path_buf(), capacity);
        (log, dir)
    }

    #[test]
    fn test_severity_inference() {
        assert_eq!(
            EventType::SecurityViolation.default_severity(),
            Severity::Critical
        );
        assert_eq!(EventType::ExecuteBlocked.default_severity(), Severity::Warn);
        assert_eq!(EventType::ExecuteTimeout.default_severity(), Severity::Error);
        assert_eq!(EventType::ExecuteEnd.default_severity(), Severity::Info);
    }

    #[test]
    fn test_ring_bounded() {
        let (log, _dir) = test_log(3);
        for i in 0..10 {
            log.record(AuditEvent::new(EventType::ExecuteStart).detail("seq", i));
        }
        let events = log.recent(100, None);
        assert_eq!(events.len(), 3);
        // Newest first
        assert_eq!(events[0].details["seq"], 9);
        assert_eq!(events[2].details["seq"], 7);
    }

    #[test]
    fn test_filtered_queries() {
        let (log, _dir) = test_log(100);
        log.record(AuditEvent::new(EventType::ExecuteStart).language("python"));
        log.record(AuditEvent::new(EventType::ExecuteEnd).language("python").duration_ms(40));
        log.record(AuditEvent::new(EventType::ExecuteBlocked).language("bash"));

        let filter = EventFilter {
            language: Some("python".to_string()),
            ..Default::default()
        };
        assert_eq!(log.recent(10, Some(&filter)).len(), 2);

        let filter = EventFilter {
            severity: Some(Severity::Warn),
            ..Default::default()
        };
        assert_eq!(log.recent(10, Some(&filter)).len(), 1);
    }

    #[test]
    fn test_security_view() {
        let (log, _dir) = test_log(100);
        log.record(AuditEvent::new(EventType::ExecuteEnd));
        log.record(AuditEvent::new(EventType::SecurityViolation).failed("path traversal"));
        log.record(AuditEvent::new(EventType::InstallBlocked).failed("blocked package"));

        let security = log.security_events(10);
        assert_eq!(security.len(), 2);
        assert!(security.iter().all(|e| !e.success));
    }

    #[test]
    fn test_stats_aggregation() {
        let (log, _dir) = test_log(100);
        log.record(AuditEvent::new(EventType::ExecuteStart));
        log.record(AuditEvent::new(EventType::ExecuteEnd).duration_ms(100));
        log.record(AuditEvent::new(EventType::ExecuteEnd).duration_ms(300));
        log.record(AuditEvent::new(EventType::SecurityViolation));
        log.record(AuditEvent::new(EventType::ExecuteBlocked));

        let stats = log.stats();
        assert_eq!(stats.total_events, 5);
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.blocked_executions, 1);
        assert_eq!(stats.avg_execute_duration_ms, 200.0);
        assert_eq!(stats.events_last_hour, 5);
        assert_eq!(stats.by_type["EXECUTE_END"], 2);
        assert_eq!(stats.by_severity["CRITICAL"], 1);
    }

    #[test]
    fn test_jsonl_file_written() {
        let (log, dir) = test_log(10);
        log.record(AuditEvent::new(EventType::ExecuteStart).container("abc123"));

        let today = Utc::now().format("%Y-%m-%d");
        let path = dir.path().join(format!("audit-{today}.jsonl"));
        let contents = std::fs::read_to_string(path).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["event_type"], "EXECUTE_START");
        assert_eq!(line["container_id"], "abc123");
    }
}
