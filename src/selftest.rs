//! Accuracy check of the live fetch and classify pipeline.
//!
//! A handful of known-active slugs and slugs known to show the error page are
//! fetched exactly like scan candidates. Each verdict is compared with the
//! expected outcome and the run is summarised as an accuracy figure.

use crate::classify::Classifier;
use crate::config::TargetSettings;
use crate::database::merge_results;
use crate::fetch::Fetcher;
use crate::scanner::{Probe, RateLimiter};
use crate::sink::write_atomic;
use crate::types::{compact_timestamp, now_rfc3339, ScanResult, ScanStatus};
use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Slugs that have always shown the error page, used when the result
/// databases offer too few inactive samples.
pub const FALLBACK_INACTIVE: &[&str] = &[
    "aaaaa", "aaaab", "aaaac", "aaaad", "aaaae", "zzzzz", "zzzzy", "zzzzx", "zzzzw", "zzzzv",
    "00000", "00001", "00002", "00003", "00004", "bbbbb", "ccccc", "ddddd", "eeeee", "fffff",
];

/// Pools smaller than this are topped up from [`FALLBACK_INACTIVE`].
const MIN_INACTIVE_POOL: usize = 20;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Expectation {
    Active,
    Inactive,
}

impl Expectation {
    /// Inactive slugs must show the error page; an unknown page or a failed fetch is a miss.
    pub fn matches(self, status: ScanStatus) -> bool {
        match self {
            Expectation::Active => status == ScanStatus::Active,
            Expectation::Inactive => status == ScanStatus::InactiveError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestCase {
    pub slug: String,
    pub expected: Expectation,
}

/// Slugs whose merged record is INACTIVE_ERROR, minus the known-active ones.
pub fn known_inactive(records: Vec<ScanResult>, known_active: &[String]) -> Vec<String> {
    let known: HashSet<&str> = known_active.iter().map(String::as_str).collect();
    merge_results(records)
        .into_iter()
        .filter(|r| r.status == ScanStatus::InactiveError && !known.contains(r.slug.as_str()))
        .map(|r| r.slug)
        .collect()
}

/// Up to `per_kind` active and `per_kind` inactive cases, shuffled together.
pub fn pick_cases<R: Rng + ?Sized>(
    rng: &mut R,
    known_active: &[String],
    inactive: &[String],
    per_kind: usize,
) -> Vec<SelfTestCase> {
    let mut pool: Vec<&str> = inactive.iter().map(String::as_str).collect();
    if pool.len() < MIN_INACTIVE_POOL {
        for slug in FALLBACK_INACTIVE {
            if !pool.contains(slug) && !known_active.iter().any(|k| k == slug) {
                pool.push(*slug);
            }
        }
    }

    let mut cases: Vec<SelfTestCase> = known_active
        .choose_multiple(rng, per_kind)
        .map(|slug| SelfTestCase {
            slug: slug.clone(),
            expected: Expectation::Active,
        })
        .collect();
    cases.extend(pool.choose_multiple(rng, per_kind).map(|slug| SelfTestCase {
        slug: slug.to_string(),
        expected: Expectation::Inactive,
    }));
    cases.shuffle(rng);
    cases
}

#[derive(Serialize, Debug, Clone)]
pub struct SelfTestEntry {
    pub expected: Expectation,
    pub passed: bool,
    #[serde(flatten)]
    pub result: ScanResult,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindScore {
    pub tested: u64,
    pub passed: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct SelfTestReport {
    pub instance_id: String,
    pub started_at: String,
    pub ended_at: String,
    pub total: u64,
    pub passed: u64,
    /// Fraction of cases that matched, `0.0..=1.0`. Zero when nothing ran.
    pub accuracy: f64,
    pub active: KindScore,
    pub inactive: KindScore,
    pub entries: Vec<SelfTestEntry>,
}

impl SelfTestReport {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            started_at: now_rfc3339(),
            ended_at: String::new(),
            total: 0,
            passed: 0,
            accuracy: 0.0,
            active: KindScore::default(),
            inactive: KindScore::default(),
            entries: Vec::new(),
        }
    }

    fn record(&mut self, expected: Expectation, result: ScanResult) {
        let passed = expected.matches(result.status);
        let score = match expected {
            Expectation::Active => &mut self.active,
            Expectation::Inactive => &mut self.inactive,
        };
        score.tested += 1;
        score.passed += u64::from(passed);
        self.total += 1;
        self.passed += u64::from(passed);
        self.entries.push(SelfTestEntry {
            expected,
            passed,
            result,
        });
    }

    fn finish(&mut self) {
        self.ended_at = now_rfc3339();
        self.accuracy = if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        };
    }

    /// `SELFTEST_<instance>_<ts>.json` under `dir`, written atomically.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!(
            "SELFTEST_{}_{}.json",
            self.instance_id,
            compact_timestamp()
        ));
        write_atomic(&path, &serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

/// Runs `cases` one at a time through `fetcher` and `classifier`, then shuts the fetcher down.
/// Cancellation stops before the next case; the report covers what ran.
pub async fn run_self_test(
    instance_id: &str,
    cases: Vec<SelfTestCase>,
    fetcher: Arc<dyn Fetcher>,
    classifier: Arc<dyn Classifier>,
    target: TargetSettings,
    rate_per_sec: f64,
    cancel: &CancellationToken,
) -> SelfTestReport {
    let probe = Probe {
        fetcher: fetcher.clone(),
        classifier,
        target,
        limiter: RateLimiter::per_second(rate_per_sec),
    };
    let mut report = SelfTestReport::new(instance_id);
    let total = cases.len();

    for (i, case) in cases.into_iter().enumerate() {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(ran = i, total, "self-test interrupted");
                break;
            }
            result = probe.test(case.slug) => result,
        };
        let passed = case.expected.matches(result.status);
        info!(
            slug = %result.slug,
            expected = ?case.expected,
            actual = %result.status,
            passed,
            "self-test case {}/{}",
            i + 1,
            total
        );
        report.record(case.expected, result);
    }

    fetcher.shutdown().await;
    report.finish();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::KeywordClassifier;
    use crate::fetch::FetchError;
    use crate::types::{FetchMethod, RawResponse};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const ACTIVE_BODY: &str = "Welcome to Glow Wellness. Select service: IV therapy, hydration. Book now.";
    const ERROR_BODY: &str = "401\nNothing left to do here\nGo to homepage";

    /// Renders a tenant page for `active`, the error page for everything else.
    struct Widget {
        active: Vec<&'static str>,
        unreachable: Vec<&'static str>,
    }

    #[async_trait]
    impl Fetcher for Widget {
        async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError> {
            let slug = url.rsplit('/').next().unwrap_or_default();
            if self.unreachable.iter().any(|s| *s == slug) {
                return Err(FetchError::Connection("refused".into()));
            }
            let (title, body) = if self.active.iter().any(|s| *s == slug) {
                ("Glow Wellness | Booking", ACTIVE_BODY)
            } else {
                ("", ERROR_BODY)
            };
            Ok(RawResponse {
                status_code: 0,
                final_url: url.to_string(),
                title: title.to_string(),
                body_text: body.to_string(),
                content_length: body.len(),
                elapsed: Duration::from_millis(2),
                method: FetchMethod::Browser,
            })
        }
    }

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    fn target() -> TargetSettings {
        TargetSettings {
            url_template: "https://mock.test/widget-business/{slug}".into(),
        }
    }

    fn record(slug: &str, status: ScanStatus) -> ScanResult {
        serde_json::from_value(serde_json::json!({ "slug": slug, "status": status })).unwrap()
    }

    #[test]
    fn picks_both_kinds_and_tops_up_inactive() {
        let known = strings(&["ad31y", "mj42f", "os27m", "lp56a", "zb74k", "ym99l"]);
        let mut rng = StdRng::seed_from_u64(11);
        let cases = pick_cases(&mut rng, &known, &strings(&["qqqqq"]), 5);
        assert_eq!(cases.len(), 10);

        let active: Vec<_> = cases.iter().filter(|c| c.expected == Expectation::Active).collect();
        assert_eq!(active.len(), 5);
        assert!(active.iter().all(|c| known.contains(&c.slug)));
        assert!(cases
            .iter()
            .filter(|c| c.expected == Expectation::Inactive)
            .all(|c| !known.contains(&c.slug)));
    }

    #[test]
    fn small_known_sets_yield_fewer_cases() {
        let mut rng = StdRng::seed_from_u64(1);
        let cases = pick_cases(&mut rng, &strings(&["ad31y"]), &[], 5);
        assert_eq!(cases.len(), 6);
    }

    #[test]
    fn inactive_pool_comes_from_merged_records() {
        let records = vec![
            record("aaaaa", ScanStatus::InactiveError),
            record("ad31y", ScanStatus::InactiveError),
            record("bbbbb", ScanStatus::Timeout),
            record("ccccc", ScanStatus::InactiveError),
            record("ccccc", ScanStatus::Active),
        ];
        let pool = known_inactive(records, &strings(&["ad31y"]));
        assert_eq!(pool, vec!["aaaaa"]);
    }

    #[tokio::test]
    async fn accuracy_counts_misses_and_fetch_failures() {
        let widget = Arc::new(Widget {
            // "mj42f" renders the error page although it is expected active
            active: vec!["ad31y"],
            unreachable: vec!["zzzzz"],
        });
        let cases = vec![
            SelfTestCase { slug: "ad31y".into(), expected: Expectation::Active },
            SelfTestCase { slug: "mj42f".into(), expected: Expectation::Active },
            SelfTestCase { slug: "aaaaa".into(), expected: Expectation::Inactive },
            SelfTestCase { slug: "zzzzz".into(), expected: Expectation::Inactive },
        ];
        let report = run_self_test(
            "st",
            cases,
            widget,
            Arc::new(KeywordClassifier::default()),
            target(),
            1000.0,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.total, 4);
        assert_eq!(report.passed, 2);
        assert!((report.accuracy - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.active, KindScore { tested: 2, passed: 1 });
        assert_eq!(report.inactive, KindScore { tested: 2, passed: 1 });
        let failed: Vec<_> = report
            .entries
            .iter()
            .filter(|e| !e.passed)
            .map(|e| (e.result.slug.as_str(), e.result.status))
            .collect();
        assert_eq!(
            failed,
            vec![
                ("mj42f", ScanStatus::InactiveError),
                ("zzzzz", ScanStatus::ConnectionError)
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_run_reports_nothing_and_saves_summary() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run_self_test(
            "st",
            vec![SelfTestCase { slug: "ad31y".into(), expected: Expectation::Active }],
            Arc::new(Widget { active: vec![], unreachable: vec![] }),
            Arc::new(KeywordClassifier::default()),
            target(),
            1000.0,
            &cancel,
        )
        .await;
        assert_eq!(report.total, 0);
        assert_eq!(report.accuracy, 0.0);

        let dir = tempfile::tempdir().unwrap();
        let path = report.save(dir.path()).unwrap();
        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["instance_id"], "st");
        assert_eq!(saved["total"], 0);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("SELFTEST_st_"));
    }
}
