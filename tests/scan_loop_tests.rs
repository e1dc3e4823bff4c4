use async_trait::async_trait;
use slug_scan_rs::checkpoint::Checkpoint;
use slug_scan_rs::classify::KeywordClassifier;
use slug_scan_rs::config::TargetSettings;
use slug_scan_rs::fetch::{FetchError, Fetcher};
use slug_scan_rs::known::KnownSetFilter;
use slug_scan_rs::scanner::{ScanLoop, ScanSettings, SharedProgress};
use slug_scan_rs::sink::{read_result_file, TestedIndex};
use slug_scan_rs::slugspace::{Alphabet, CandidateSource, SlugRange};
use slug_scan_rs::types::{
    FetchMethod, RawResponse, ScanCounts, ScanResult, ScanState, ScanStatus,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ACTIVE_TITLE: &str = "Glow Wellness Clinic - Booking";
const ACTIVE_BODY: &str =
    "Welcome to Glow Wellness. Select service: IV therapy, hydration, weight loss. Book now.";
const ERROR_BODY: &str = "401\nNothing left to do here\nGo to homepage";

#[derive(Default)]
struct MockSite {
    active: Vec<&'static str>,
    timeouts: Vec<&'static str>,
    delays: HashMap<&'static str, u64>,
    cancel_on: Option<(&'static str, CancellationToken)>,
    calls: Mutex<Vec<String>>,
}

impl MockSite {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockSite {
    async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError> {
        let slug = url.rsplit('/').next().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(slug.clone());
        if let Some(ms) = self.delays.get(slug.as_str()) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if let Some((trigger, token)) = &self.cancel_on {
            if *trigger == slug {
                token.cancel();
            }
        }
        if self.timeouts.iter().any(|s| *s == slug) {
            return Err(FetchError::Timeout("page load exceeded 15s".into()));
        }
        let (title, body) = if self.active.iter().any(|s| *s == slug) {
            (ACTIVE_TITLE, ACTIVE_BODY)
        } else {
            ("", ERROR_BODY)
        };
        Ok(RawResponse {
            status_code: 200,
            final_url: url.to_string(),
            title: title.to_string(),
            body_text: body.to_string(),
            content_length: body.len(),
            elapsed: Duration::from_millis(3),
            method: FetchMethod::Browser,
        })
    }
}

fn settings(dir: &Path) -> ScanSettings {
    ScanSettings {
        instance_id: "t1".into(),
        out_dir: dir.to_path_buf(),
        target: TargetSettings {
            url_template: "https://mock.test/b/{slug}".into(),
        },
        workers: 1,
        rate_per_sec: 1000.0,
        checkpoint_every: 2,
        flush_every: 25,
        resume: true,
    }
}

fn five_slugs() -> CandidateSource {
    CandidateSource::List {
        label: "fixtures".into(),
        slugs: ["act01", "err01", "act02", "err02", "err03"]
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

fn scan_loop(site: Arc<MockSite>, source: CandidateSource, settings: ScanSettings) -> ScanLoop {
    ScanLoop::new(source, settings, site, Arc::new(KeywordClassifier::default()))
}

fn statuses(results: &[ScanResult]) -> Vec<(&str, ScanStatus)> {
    results.iter().map(|r| (r.slug.as_str(), r.status)).collect()
}

#[tokio::test]
async fn end_to_end_two_active_three_errors() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite {
        active: vec!["act01", "act02"],
        ..MockSite::default()
    });
    let scan = scan_loop(site.clone(), five_slugs(), settings(dir.path()));
    let store = scan.checkpoint_store();

    let outcome = scan.run(CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.state, ScanState::Done);
    assert_eq!(outcome.session.count(ScanStatus::Active), 2);
    assert_eq!(outcome.session.count(ScanStatus::InactiveError), 3);
    assert_eq!(
        outcome.counts,
        ScanCounts {
            tested: 5,
            found: 2,
            skipped: 0
        }
    );
    let cp = outcome.checkpoint.as_ref().unwrap();
    assert_eq!(cp.last_candidate, "err03");
    assert!(!store.path().exists(), "checkpoint removed after completion");

    let active = &outcome.session.results[0];
    assert_eq!(active.business_name, "Glow Wellness Clinic");
    assert_eq!(active.url, "https://mock.test/b/act01");
    assert_eq!(active.http_status, Some(200));

    let logged = read_result_file(&outcome.paths.jsonl).unwrap();
    assert_eq!(logged, outcome.session.results);
    let viewed = read_result_file(&outcome.paths.json).unwrap();
    assert_eq!(viewed, outcome.session.results);
    assert!(outcome.paths.csv.exists());
    let session = read_result_file(&outcome.paths.session).unwrap();
    assert_eq!(session.len(), 5);
}

#[tokio::test]
async fn concurrent_fetches_commit_in_candidate_order() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite {
        active: vec!["act02"],
        delays: HashMap::from([("act01", 60), ("err01", 40), ("act02", 5)]),
        ..MockSite::default()
    });
    let mut cfg = settings(dir.path());
    cfg.workers = 4;
    let outcome = scan_loop(site, five_slugs(), cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let order: Vec<&str> = outcome.session.results.iter().map(|r| r.slug.as_str()).collect();
    assert_eq!(order, vec!["act01", "err01", "act02", "err02", "err03"]);
    assert_eq!(outcome.counts.found, 1);
}

#[tokio::test]
async fn resume_tests_only_the_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite::default());
    let range = SlugRange::full(Alphabet::new("ab").unwrap(), 2).unwrap();
    let scan = scan_loop(site.clone(), CandidateSource::Range(range), settings(dir.path()));
    scan.checkpoint_store()
        .save(&Checkpoint::new(
            "t1",
            "range aa..=bb",
            "ab",
            ScanCounts {
                tested: 2,
                found: 0,
                skipped: 0,
            },
        ))
        .unwrap();

    let outcome = scan.run(CancellationToken::new()).await.unwrap();

    assert_eq!(site.calls(), vec!["ba", "bb"]);
    assert_eq!(outcome.session.counts.tested, 2);
    assert_eq!(outcome.counts.tested, 4);
    assert_eq!(outcome.state, ScanState::Done);
}

#[tokio::test]
async fn no_resume_ignores_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite::default());
    let range = SlugRange::full(Alphabet::new("ab").unwrap(), 2).unwrap();
    let mut cfg = settings(dir.path());
    cfg.resume = false;
    let scan = scan_loop(site.clone(), CandidateSource::Range(range), cfg);
    scan.checkpoint_store()
        .save(&Checkpoint::new("t1", "x", "ba", ScanCounts::default()))
        .unwrap();

    scan.run(CancellationToken::new()).await.unwrap();
    assert_eq!(site.calls(), vec!["aa", "ab", "ba", "bb"]);
}

#[tokio::test]
async fn interrupted_scan_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let site = Arc::new(MockSite {
        active: vec!["act01", "act02"],
        cancel_on: Some(("act02", cancel.clone())),
        ..MockSite::default()
    });
    let scan = scan_loop(site.clone(), five_slugs(), settings(dir.path()));
    let store = scan.checkpoint_store();

    let first = scan.run(cancel).await.unwrap();
    assert_eq!(first.state, ScanState::Interrupted);
    assert_eq!(first.checkpoint.as_ref().unwrap().last_candidate, "act02");
    assert_eq!(store.load().unwrap().unwrap().counts.found, 2);

    let site2 = Arc::new(MockSite::default());
    let second = scan_loop(site2.clone(), five_slugs(), settings(dir.path()))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(site2.calls(), vec!["err02", "err03"]);
    assert_eq!(second.state, ScanState::Done);
    assert_eq!(second.counts.tested, 5);
    assert_eq!(second.counts.found, 2);
    assert!(!store.path().exists());
    assert_ne!(first.paths.jsonl, second.paths.jsonl);
}

#[tokio::test]
async fn known_and_tested_slugs_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite::default());
    let mut tested = TestedIndex::default();
    tested.extend(
        read_result_file_fixture("err02", ScanStatus::InactiveError)
            .into_iter()
            .chain(read_result_file_fixture("err03", ScanStatus::Timeout)),
    );

    let progress = SharedProgress::new();
    let outcome = scan_loop(site.clone(), five_slugs(), settings(dir.path()))
        .with_known(KnownSetFilter::new(["act01"]))
        .with_tested(tested)
        .with_progress(progress.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    // err03 only timed out before, so it is tested again
    assert_eq!(site.calls(), vec!["err01", "act02", "err03"]);
    assert_eq!(outcome.counts.skipped, 2);
    assert_eq!(outcome.counts.tested, 3);
    assert_eq!(outcome.checkpoint.unwrap().last_candidate, "err03");

    let snap = progress.snapshot().await;
    assert_eq!(snap.state, ScanState::Done);
    assert_eq!(snap.total, 5);
    assert_eq!(snap.skipped, 2);
}

#[tokio::test]
async fn fetch_failures_are_recorded_and_do_not_stop_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let site = Arc::new(MockSite {
        active: vec!["act02"],
        timeouts: vec!["err01"],
        ..MockSite::default()
    });
    let outcome = scan_loop(site, five_slugs(), settings(dir.path()))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        statuses(&outcome.session.results),
        vec![
            ("act01", ScanStatus::InactiveError),
            ("err01", ScanStatus::Timeout),
            ("act02", ScanStatus::Active),
            ("err02", ScanStatus::InactiveError),
            ("err03", ScanStatus::InactiveError),
        ]
    );
    let timed_out = &outcome.session.results[1];
    assert_eq!(timed_out.content_length, 0);
    assert!(timed_out.business_name.is_empty());
    assert!(timed_out.error_detail.as_deref().unwrap().contains("15s"));
    assert_eq!(timed_out.method, None);
}

#[tokio::test]
async fn empty_source_finishes_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let source = CandidateSource::List {
        label: "empty".into(),
        slugs: vec![],
    };
    let outcome = scan_loop(Arc::new(MockSite::default()), source, settings(dir.path()))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.state, ScanState::Done);
    assert!(outcome.checkpoint.is_none());
    assert!(outcome.session.results.is_empty());
}

fn read_result_file_fixture(slug: &str, status: ScanStatus) -> Vec<ScanResult> {
    let json = format!(r#"[{{"slug":"{slug}","status":"{}"}}]"#, status.as_str());
    serde_json::from_str(&json).unwrap()
}
