use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use time::{format_description::well_known, OffsetDateTime};

/// Classification label assigned to one tested slug.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Active,
    InactiveError,
    InactiveUnknown,
    Timeout,
    ConnectionError,
    BrowserError,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 6] = [
        ScanStatus::Active,
        ScanStatus::InactiveError,
        ScanStatus::InactiveUnknown,
        ScanStatus::Timeout,
        ScanStatus::ConnectionError,
        ScanStatus::BrowserError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Active => "ACTIVE",
            ScanStatus::InactiveError => "INACTIVE_ERROR",
            ScanStatus::InactiveUnknown => "INACTIVE_UNKNOWN",
            ScanStatus::Timeout => "TIMEOUT",
            ScanStatus::ConnectionError => "CONNECTION_ERROR",
            ScanStatus::BrowserError => "BROWSER_ERROR",
        }
    }

    /// True for statuses produced by a failed fetch rather than by content inspection.
    /// These are the slugs worth feeding into a later retry run.
    pub fn is_fetch_error(self) -> bool {
        matches!(
            self,
            ScanStatus::Timeout | ScanStatus::ConnectionError | ScanStatus::BrowserError
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which fetcher produced a response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchMethod {
    Http,
    Browser,
}

/// Content retrieved for one candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status_code: u16,
    pub final_url: String,
    pub title: String,
    pub body_text: String,
    pub content_length: usize,
    pub elapsed: Duration,
    pub method: FetchMethod,
}

/// One record per tested slug. Created once and never mutated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub slug: String,
    #[serde(default)]
    pub url: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub business_name: String,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub business_hits: u32,
    #[serde(default)]
    pub error_hits: u32,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub final_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub method: Option<FetchMethod>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub timestamp: String,
}

/// Running counters persisted with every checkpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub tested: u64,
    pub found: u64,
    pub skipped: u64,
}

/// Lifecycle of one scan run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Init,
    Running,
    Checkpointing,
    Done,
    Interrupted,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Init => "init",
            ScanState::Running => "running",
            ScanState::Checkpointing => "checkpointing",
            ScanState::Done => "done",
            ScanState::Interrupted => "interrupted",
        }
    }
}

/// Aggregate record of one scan process's lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionLog {
    pub session_id: String,
    pub instance_id: String,
    pub source: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub state: ScanState,
    pub counts: ScanCounts,
    pub by_status: BTreeMap<ScanStatus, u64>,
    pub results: Vec<ScanResult>,
}

impl SessionLog {
    pub fn new(session_id: String, instance_id: String, source: String) -> Self {
        Self {
            session_id,
            instance_id,
            source,
            started_at: now_rfc3339(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, result: ScanResult) {
        *self.by_status.entry(result.status).or_insert(0) += 1;
        self.results.push(result);
    }

    pub fn count(&self, status: ScanStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// RFC3339 UTC timestamp.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// `YYYYMMDD_HHMMSS` in UTC, used to keep per-session file names unique.
pub fn compact_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake() {
        let s = serde_json::to_string(&ScanStatus::InactiveError).unwrap();
        assert_eq!(s, "\"INACTIVE_ERROR\"");
        let back: ScanStatus = serde_json::from_str("\"CONNECTION_ERROR\"").unwrap();
        assert_eq!(back, ScanStatus::ConnectionError);
    }

    #[test]
    fn fetch_error_statuses() {
        let errs: Vec<_> = ScanStatus::ALL
            .into_iter()
            .filter(|s| s.is_fetch_error())
            .collect();
        assert_eq!(
            errs,
            vec![
                ScanStatus::Timeout,
                ScanStatus::ConnectionError,
                ScanStatus::BrowserError
            ]
        );
    }

    #[test]
    fn compact_timestamp_shape() {
        let ts = compact_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(&ts[8..9], "_");
    }
}
