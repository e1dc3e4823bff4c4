//! Result persistence for one scan session.
//!
//! Every committed result is appended to a JSONL log immediately; the CSV and
//! JSON files are views rebuilt wholesale from memory on `flush`.

use crate::database::outranks;
use crate::types::{FetchMethod, ScanResult, ScanStatus, SessionLog};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Version tag written on every JSONL line.
pub const LOG_SCHEMA_VERSION: u32 = 1;

const CSV_HEADER: [&str; 13] = [
    "slug",
    "status",
    "business_name",
    "url",
    "final_url",
    "title",
    "http_status",
    "method",
    "content_length",
    "latency_ms",
    "timestamp",
    "error_detail",
    "services",
];

#[derive(Serialize)]
struct LogLine<'a> {
    v: u32,
    #[serde(flatten)]
    result: &'a ScanResult,
}

#[derive(Deserialize)]
struct OwnedLogLine {
    #[serde(default)]
    v: u32,
    #[serde(flatten)]
    result: ScanResult,
}

/// File names for one session, all sharing the `SESSION_<id>` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub jsonl: PathBuf,
    pub csv: PathBuf,
    pub json: PathBuf,
    pub session: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: &Path, session_id: &str) -> Self {
        let file = |suffix: &str| dir.join(format!("SESSION_{session_id}_{suffix}"));
        Self {
            jsonl: file("results.jsonl"),
            csv: file("results.csv"),
            json: file("results.json"),
            session: file("session.json"),
        }
    }
}

/// Write `bytes` to a temp sibling and rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub struct ResultSink {
    paths: SessionPaths,
    log: BufWriter<File>,
    results: Vec<ScanResult>,
}

impl ResultSink {
    /// Open (append mode) the session's JSONL log, creating the directory if needed.
    pub fn create(paths: SessionPaths) -> Result<Self> {
        if let Some(dir) = paths.jsonl.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create output dir: {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.jsonl)
            .with_context(|| format!("failed to open result log: {}", paths.jsonl.display()))?;
        Ok(Self {
            paths,
            log: BufWriter::new(file),
            results: Vec::new(),
        })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }

    /// Record one result: append its log line (flushed to the OS) and keep it in memory.
    pub fn append(&mut self, result: ScanResult) -> Result<()> {
        let line = LogLine {
            v: LOG_SCHEMA_VERSION,
            result: &result,
        };
        serde_json::to_writer(&mut self.log, &line)?;
        self.log.write_all(b"\n")?;
        self.log
            .flush()
            .with_context(|| format!("failed to append to {}", self.paths.jsonl.display()))?;
        self.results.push(result);
        Ok(())
    }

    /// Rewrite the CSV and JSON views from memory.
    pub fn flush(&mut self) -> Result<()> {
        write_atomic(&self.paths.csv, &results_csv(&self.results)?)?;
        write_atomic(&self.paths.json, &serde_json::to_vec_pretty(&self.results)?)?;
        debug!(results = self.results.len(), "result views flushed");
        Ok(())
    }

    pub fn save_session(&self, session: &SessionLog) -> Result<()> {
        write_atomic(&self.paths.session, &serde_json::to_vec_pretty(session)?)
    }
}

/// Render results as CSV with a fixed header, in the given order.
pub fn results_csv(results: &[ScanResult]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(CSV_HEADER)?;
    for r in results {
        let http_status = r.http_status.map(|s| s.to_string()).unwrap_or_default();
        let method = match r.method {
            Some(FetchMethod::Http) => "HTTP",
            Some(FetchMethod::Browser) => "BROWSER",
            None => "",
        };
        let content_length = r.content_length.to_string();
        let latency_ms = r.latency_ms.to_string();
        let services = r.services.join("; ");
        wtr.write_record([
            r.slug.as_str(),
            r.status.as_str(),
            r.business_name.as_str(),
            r.url.as_str(),
            r.final_url.as_str(),
            r.title.as_str(),
            http_status.as_str(),
            method,
            content_length.as_str(),
            latency_ms.as_str(),
            r.timestamp.as_str(),
            r.error_detail.as_deref().unwrap_or(""),
            services.as_str(),
        ])?;
    }
    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish CSV: {e}"))
}

/// Parse a JSONL result log. Blank lines are skipped; malformed lines are errors.
pub fn parse_result_log(content: &str) -> Result<Vec<ScanResult>> {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: OwnedLogLine = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid result record", idx + 1))?;
        if parsed.v > LOG_SCHEMA_VERSION {
            bail!("line {}: unsupported log schema version {}", idx + 1, parsed.v);
        }
        out.push(parsed.result);
    }
    Ok(out)
}

/// Read results from any file this tool writes: a JSONL log, a results JSON
/// array, a session log (`results`) or a master database (`all_slugs`).
pub fn read_result_file(path: &Path) -> Result<Vec<ScanResult>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read result file: {}", path.display()))?;
    if path.extension().is_some_and(|e| e == "jsonl") {
        return parse_result_log(&content)
            .with_context(|| format!("in {}", path.display()));
    }

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let list = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => match map
            .remove("all_slugs")
            .or_else(|| map.remove("results"))
        {
            Some(list) => list,
            None => bail!(
                "{}: expected an `all_slugs` or `results` list",
                path.display()
            ),
        },
        _ => bail!("{}: unrecognised result file layout", path.display()),
    };
    serde_json::from_value(list).with_context(|| format!("invalid result records in {}", path.display()))
}

/// Slugs settled by earlier runs, rebuilt from result files.
///
/// Records for one slug are ranked the way the master database merges them:
/// ACTIVE wins, otherwise the newest. A slug whose winning record is a
/// fetch-layer failure is not settled, so a later scan retests it.
#[derive(Debug, Clone, Default)]
pub struct TestedIndex {
    latest: HashMap<String, (ScanStatus, String)>,
}

impl TestedIndex {
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut index = Self::default();
        for path in paths {
            let path = path.as_ref();
            let results = read_result_file(path)?;
            debug!(path = %path.display(), records = results.len(), "loaded tested results");
            index.extend(results);
        }
        if !paths.is_empty() && index.is_empty() {
            warn!("tested databases contained no records");
        }
        Ok(index)
    }

    pub fn extend<I: IntoIterator<Item = ScanResult>>(&mut self, results: I) {
        for r in results {
            let keep = self
                .latest
                .get(&r.slug)
                .is_some_and(|(status, ts)| !outranks((r.status, r.timestamp.as_str()), (*status, ts.as_str())));
            if !keep {
                self.latest.insert(r.slug, (r.status, r.timestamp));
            }
        }
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.latest
            .get(slug)
            .is_some_and(|(status, _)| !status.is_fetch_error())
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
