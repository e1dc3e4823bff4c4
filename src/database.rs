//! Offline tools over result files: merge many logs into one master database
//! and pull out the slugs that deserve another attempt.

use crate::sink::{read_result_file, write_atomic};
use crate::slugspace::decode_numeric;
use crate::types::{now_rfc3339, ScanResult, ScanStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DB_SCHEMA_VERSION: u32 = 1;

/// Union of many result logs, one record per slug, sorted by slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterDatabase {
    pub schema_version: u32,
    pub generated_at: String,
    pub all_slugs: Vec<ScanResult>,
}

impl MasterDatabase {
    pub fn from_results<I: IntoIterator<Item = ScanResult>>(results: I) -> Self {
        Self {
            schema_version: DB_SCHEMA_VERSION,
            generated_at: now_rfc3339(),
            all_slugs: merge_results(results),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read master database: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid master database: {}", path.display()))
    }

    /// Temp file + rename: readers never see a partial database.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn active(&self) -> impl Iterator<Item = &ScanResult> {
        self.all_slugs
            .iter()
            .filter(|r| r.status == ScanStatus::Active)
    }

    pub fn by_status(&self) -> BTreeMap<ScanStatus, u64> {
        let mut counts = BTreeMap::new();
        for r in &self.all_slugs {
            *counts.entry(r.status).or_insert(0) += 1;
        }
        counts
    }

    /// CSV of ACTIVE records; base64-numeric slugs also get their decoded id.
    pub fn active_csv(&self) -> Result<Vec<u8>> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(["slug", "numeric_id", "business_name", "url", "timestamp"])?;
        for r in self.active() {
            let numeric = decode_numeric(&r.slug)
                .map(|n| n.to_string())
                .unwrap_or_default();
            wtr.write_record([
                r.slug.as_str(),
                numeric.as_str(),
                r.business_name.as_str(),
                r.url.as_str(),
                r.timestamp.as_str(),
            ])?;
        }
        wtr.into_inner()
            .map_err(|e| anyhow::anyhow!("failed to finish CSV: {e}"))
    }
}

/// `true` when a record with `(status, timestamp)` should replace an earlier-read one
/// for the same slug: ACTIVE beats everything, then the newer timestamp.
pub fn outranks(candidate: (ScanStatus, &str), existing: (ScanStatus, &str)) -> bool {
    let cand_active = candidate.0 == ScanStatus::Active;
    let prev_active = existing.0 == ScanStatus::Active;
    match (cand_active, prev_active) {
        (true, false) => true,
        (false, true) => false,
        // later input wins ties, including records without timestamps
        _ => candidate.1 >= existing.1,
    }
}

fn supersedes(candidate: &ScanResult, existing: &ScanResult) -> bool {
    outranks(
        (candidate.status, candidate.timestamp.as_str()),
        (existing.status, existing.timestamp.as_str()),
    )
}

/// One record per slug: ACTIVE beats any other status, otherwise the newest record wins.
pub fn merge_results<I: IntoIterator<Item = ScanResult>>(results: I) -> Vec<ScanResult> {
    let mut by_slug: HashMap<String, ScanResult> = HashMap::new();
    for r in results {
        match by_slug.get(&r.slug) {
            Some(existing) if !supersedes(&r, existing) => {}
            _ => {
                by_slug.insert(r.slug.clone(), r);
            }
        }
    }
    let mut out: Vec<ScanResult> = by_slug.into_values().collect();
    out.sort_by(|a, b| a.slug.cmp(&b.slug));
    out
}

fn read_all(inputs: &[PathBuf]) -> Result<Vec<ScanResult>> {
    let mut all = Vec::new();
    for path in inputs {
        let results = read_result_file(path)?;
        debug!(path = %path.display(), records = results.len(), "read result file");
        all.extend(results);
    }
    Ok(all)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub files: usize,
    pub records_read: usize,
    pub unique_slugs: usize,
    pub active: usize,
    pub by_status: BTreeMap<ScanStatus, u64>,
}

/// Merge `inputs` (plus the existing database at `output` when `include_existing`)
/// into `output`, optionally writing the ACTIVE CSV to `active_csv`.
pub fn merge_files(
    inputs: &[PathBuf],
    output: &Path,
    active_csv: Option<&Path>,
    include_existing: bool,
) -> Result<MergeReport> {
    let mut sources: Vec<PathBuf> = Vec::with_capacity(inputs.len() + 1);
    if include_existing && output.exists() {
        sources.push(output.to_path_buf());
    }
    sources.extend(inputs.iter().cloned());

    let records = read_all(&sources)?;
    let records_read = records.len();
    let db = MasterDatabase::from_results(records);
    db.save(output)?;
    if let Some(csv_path) = active_csv {
        write_atomic(csv_path, &db.active_csv()?)?;
    }

    let report = MergeReport {
        files: sources.len(),
        records_read,
        unique_slugs: db.all_slugs.len(),
        active: db.active().count(),
        by_status: db.by_status(),
    };
    info!(
        files = report.files,
        records = report.records_read,
        unique = report.unique_slugs,
        active = report.active,
        "master database written to {}",
        output.display()
    );
    Ok(report)
}

/// Slugs whose merged record is a fetch-layer failure, sorted.
pub fn retry_list(inputs: &[PathBuf]) -> Result<Vec<String>> {
    let merged = merge_results(read_all(inputs)?);
    Ok(merged
        .into_iter()
        .filter(|r| r.status.is_fetch_error())
        .map(|r| r.slug)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ResultSink, SessionPaths};

    fn rec(slug: &str, status: ScanStatus, ts: &str) -> ScanResult {
        ScanResult {
            slug: slug.into(),
            url: String::new(),
            status,
            business_name: if status == ScanStatus::Active {
                "Glow Spa".into()
            } else {
                String::new()
            },
            content_length: 0,
            latency_ms: 0,
            business_hits: 0,
            error_hits: 0,
            services: Vec::new(),
            http_status: None,
            final_url: String::new(),
            title: String::new(),
            method: None,
            error_detail: None,
            timestamp: ts.into(),
        }
    }

    #[test]
    fn active_beats_newer_inactive() {
        let merged = merge_results([
            rec("ab", ScanStatus::Active, "2025-01-01T00:00:00Z"),
            rec("ab", ScanStatus::Timeout, "2025-02-01T00:00:00Z"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, ScanStatus::Active);
    }

    #[test]
    fn newest_wins_otherwise() {
        let merged = merge_results([
            rec("cd", ScanStatus::InactiveError, "2025-03-01T00:00:00Z"),
            rec("cd", ScanStatus::ConnectionError, "2025-01-01T00:00:00Z"),
            rec("ab", ScanStatus::Timeout, "2025-01-01T00:00:00Z"),
            rec("ab", ScanStatus::InactiveUnknown, "2025-01-02T00:00:00Z"),
        ]);
        let statuses: Vec<_> = merged.iter().map(|r| (r.slug.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("ab", ScanStatus::InactiveUnknown),
                ("cd", ScanStatus::InactiveError)
            ]
        );
    }

    #[test]
    fn merge_files_writes_database_and_active_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::create(SessionPaths::new(dir.path(), "m_1")).unwrap();
        sink.append(rec("MQ==", ScanStatus::Active, "2025-01-01T00:00:00Z")).unwrap();
        sink.append(rec("Mg==", ScanStatus::Timeout, "2025-01-01T00:00:01Z")).unwrap();
        let log = sink.paths().jsonl.clone();

        let out = dir.path().join("master.json");
        let csv = dir.path().join("active.csv");
        let report = merge_files(&[log.clone()], &out, Some(&csv), true).unwrap();
        assert_eq!(report.unique_slugs, 2);
        assert_eq!(report.active, 1);

        let db = MasterDatabase::load(&out).unwrap();
        assert_eq!(db.schema_version, DB_SCHEMA_VERSION);
        let csv_text = std::fs::read_to_string(&csv).unwrap();
        assert!(csv_text.contains("MQ==,1,Glow Spa"));
        assert!(!csv_text.contains("Mg=="));

        // re-merging folds in the existing database without duplicating
        let report = merge_files(&[log], &out, None, true).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.unique_slugs, 2);
    }

    #[test]
    fn retry_list_takes_fetch_errors_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let results = vec![
            rec("aaaaa", ScanStatus::Timeout, "1"),
            rec("aaaab", ScanStatus::BrowserError, "1"),
            rec("aaaac", ScanStatus::InactiveError, "1"),
            rec("aaaad", ScanStatus::ConnectionError, "1"),
            rec("aaaad", ScanStatus::InactiveUnknown, "2"),
        ];
        std::fs::write(&path, serde_json::to_vec(&results).unwrap()).unwrap();
        assert_eq!(retry_list(&[path]).unwrap(), vec!["aaaaa", "aaaab"]);
    }
}
