use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classify::Classifier;
use crate::config::{ScanConfig, TargetSettings};
use crate::fetch::Fetcher;
use crate::known::KnownSetFilter;
use crate::sink::{ResultSink, SessionPaths, TestedIndex};
use crate::slugspace::CandidateSource;
use crate::types::{
    compact_timestamp, now_rfc3339, RawResponse, ScanCounts, ScanResult, ScanState, ScanStatus,
    SessionLog,
};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one scan run.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub instance_id: String,
    pub out_dir: PathBuf,
    pub target: TargetSettings,
    pub workers: usize,
    pub rate_per_sec: f64,
    pub checkpoint_every: u64,
    pub flush_every: u64,
    /// Continue from this source's checkpoint file when one exists.
    pub resume: bool,
}

impl ScanSettings {
    pub fn from_config(config: &ScanConfig, instance_id: &str, out_dir: &Path) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            out_dir: out_dir.to_path_buf(),
            target: config.target.clone(),
            workers: config.scan.workers,
            rate_per_sec: config.scan.rate_per_sec,
            checkpoint_every: config.scan.checkpoint_every,
            flush_every: config.scan.flush_every,
            resume: true,
        }
    }
}

/// Live counters shared with the status server.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub total: Arc<AtomicU64>,
    pub tested: Arc<AtomicU64>,
    pub found: Arc<AtomicU64>,
    pub skipped: Arc<AtomicU64>,
    pub found_entries: Arc<Mutex<Vec<ScanResult>>>,
    state: Arc<Mutex<ScanState>>,
    last_candidate: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub state: ScanState,
    pub total: u64,
    pub tested: u64,
    pub found: u64,
    pub skipped: u64,
    pub last_candidate: Option<String>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            state: *self.state.lock().await,
            total: self.total.load(Ordering::Relaxed),
            tested: self.tested.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            last_candidate: self.last_candidate.lock().await.clone(),
        }
    }

    pub async fn found(&self) -> Vec<ScanResult> {
        self.found_entries.lock().await.clone()
    }

    async fn set_state(&self, state: ScanState) {
        *self.state.lock().await = state;
    }

    fn store_counts(&self, counts: &ScanCounts) {
        self.tested.store(counts.tested, Ordering::Relaxed);
        self.found.store(counts.found, Ordering::Relaxed);
        self.skipped.store(counts.skipped, Ordering::Relaxed);
    }
}

/// Minimum spacing between fetch starts, shared by all workers.
#[derive(Debug)]
pub struct RateLimiter {
    next_slot: Mutex<Instant>,
    min_delay: Duration,
}

impl RateLimiter {
    pub fn per_second(rate: f64) -> Self {
        let min_delay = if rate.is_finite() && rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            next_slot: Mutex::new(Instant::now()),
            min_delay,
        }
    }

    /// Wait for this caller's start slot and reserve the next one.
    pub async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_delay;
            slot
        };
        if slot > Instant::now() {
            time::sleep_until(slot).await;
        }
    }
}

/// How a run ended, with everything it persisted.
#[derive(Debug)]
pub struct ScanOutcome {
    pub state: ScanState,
    /// Last checkpoint written; `None` when no candidate was ever committed.
    pub checkpoint: Option<Checkpoint>,
    /// Totals including candidates committed by resumed-from runs.
    pub counts: ScanCounts,
    pub session: SessionLog,
    pub paths: SessionPaths,
}

enum Step {
    Skipped(String),
    Tested(ScanResult),
}

/// Fetch and classify one candidate.
pub(crate) struct Probe {
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) classifier: Arc<dyn Classifier>,
    pub(crate) target: TargetSettings,
    pub(crate) limiter: RateLimiter,
}

impl Probe {
    pub(crate) async fn test(&self, slug: String) -> ScanResult {
        self.limiter.wait().await;
        let url = self.target.url_for(&slug);
        let start = Instant::now();
        let outcome = self.fetcher.fetch(&url).await;
        let verdict = self.classifier.assess(&outcome);

        let mut result = ScanResult {
            slug,
            url,
            status: verdict.status,
            business_name: verdict.business_name,
            content_length: 0,
            latency_ms: start.elapsed().as_millis() as u64,
            business_hits: verdict.business_hits,
            error_hits: verdict.error_hits,
            services: verdict.services,
            http_status: None,
            final_url: String::new(),
            title: String::new(),
            method: None,
            error_detail: None,
            timestamp: now_rfc3339(),
        };
        match outcome {
            Ok(RawResponse {
                status_code,
                final_url,
                title,
                content_length,
                elapsed,
                method,
                ..
            }) => {
                result.content_length = content_length as u64;
                result.latency_ms = elapsed.as_millis() as u64;
                result.http_status = (status_code != 0).then_some(status_code);
                result.final_url = final_url;
                result.title = title;
                result.method = Some(method);
            }
            Err(e) => result.error_detail = Some(e.to_string()),
        }
        result
    }
}

/// Drives one candidate source through fetch, classify and persist.
///
/// Up to `workers` fetches run at once but results are committed strictly in
/// candidate order, so the checkpoint always marks a prefix of the source that
/// is fully done.
pub struct ScanLoop {
    source: CandidateSource,
    settings: ScanSettings,
    fetcher: Arc<dyn Fetcher>,
    classifier: Arc<dyn Classifier>,
    known: KnownSetFilter,
    tested: TestedIndex,
    progress: SharedProgress,
}

impl ScanLoop {
    pub fn new(
        source: CandidateSource,
        settings: ScanSettings,
        fetcher: Arc<dyn Fetcher>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            source,
            settings,
            fetcher,
            classifier,
            known: KnownSetFilter::default(),
            tested: TestedIndex::default(),
            progress: SharedProgress::new(),
        }
    }

    pub fn with_known(mut self, known: KnownSetFilter) -> Self {
        self.known = known;
        self
    }

    pub fn with_tested(mut self, tested: TestedIndex) -> Self {
        self.tested = tested;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::for_session(
            &self.settings.out_dir,
            &self.settings.instance_id,
            &self.source.fingerprint(),
        )
    }

    /// Run until the source is exhausted (`Done`) or `cancel` fires (`Interrupted`).
    ///
    /// Per-candidate fetch failures are recorded as results. Persistence errors
    /// abort the run after a best-effort save of what was committed.
    pub async fn run(self, cancel: CancellationToken) -> Result<ScanOutcome> {
        let store = self.checkpoint_store();
        let resumed = if self.settings.resume {
            store.load()?
        } else {
            None
        };
        if let Some(cp) = &resumed {
            info!(
                last = %cp.last_candidate,
                tested = cp.counts.tested,
                found = cp.counts.found,
                "resuming from checkpoint"
            );
        }

        let session_id = unique_session_id(&self.settings.out_dir, &self.settings.instance_id);
        let sink = ResultSink::create(SessionPaths::new(&self.settings.out_dir, &session_id))?;
        let session = SessionLog::new(
            session_id,
            self.settings.instance_id.clone(),
            self.source.describe(),
        );
        let resume_slug = resumed.as_ref().map(|cp| cp.last_candidate.clone());
        let mut committer = Committer {
            instance_id: self.settings.instance_id.clone(),
            source: self.source.describe(),
            store,
            sink,
            session,
            counts: resumed.map(|cp| cp.counts).unwrap_or_default(),
            last: resume_slug.clone(),
            progress: self.progress.clone(),
            checkpoint_every: self.settings.checkpoint_every.max(1),
            flush_every: self.settings.flush_every.max(1),
            since_checkpoint: 0,
            since_flush: 0,
        };

        self.progress
            .total
            .store(self.source.len(), Ordering::Relaxed);
        self.progress.store_counts(&committer.counts);
        self.progress.set_state(ScanState::Running).await;
        committer.session.state = ScanState::Running;
        info!(
            source = %self.source.describe(),
            total = self.source.len(),
            workers = self.settings.workers,
            rate = self.settings.rate_per_sec,
            "scan started"
        );

        let driven = self
            .drive(&mut committer, resume_slug.as_deref(), &cancel)
            .await;
        self.fetcher.shutdown().await;

        match driven {
            Ok(state) => committer.finish(state).await,
            Err(e) => {
                committer.salvage().await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        committer: &mut Committer,
        resume: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ScanState> {
        let candidates = self.source.candidates_after(resume)?;
        let probe = Arc::new(Probe {
            fetcher: self.fetcher.clone(),
            classifier: self.classifier.clone(),
            target: self.settings.target.clone(),
            limiter: RateLimiter::per_second(self.settings.rate_per_sec),
        });
        let known = &self.known;
        let tested = &self.tested;

        let steps = stream::iter(candidates)
            .map(|slug| {
                let skip = known.is_known(&slug) || tested.contains(&slug);
                let probe = probe.clone();
                async move {
                    if skip {
                        Step::Skipped(slug)
                    } else {
                        Step::Tested(probe.test(slug).await)
                    }
                }
            })
            .buffered(self.settings.workers.max(1));
        let mut steps = std::pin::pin!(steps);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("scan cancelled; dropping in-flight fetches");
                    return Ok(ScanState::Interrupted);
                }
                next = steps.next() => match next {
                    Some(step) => committer.commit(step).await?,
                    None => return Ok(ScanState::Done),
                },
            }
        }
    }
}

/// `<instance>_<timestamp>`, suffixed when a session with that name already exists.
fn unique_session_id(out_dir: &Path, instance_id: &str) -> String {
    let base = format!("{}_{}", instance_id, compact_timestamp());
    let mut id = base.clone();
    let mut n = 1;
    while SessionPaths::new(out_dir, &id).jsonl.exists() {
        n += 1;
        id = format!("{base}_{n}");
    }
    id
}

/// Ordered commit side of the loop: counts, sink, session log and checkpoints.
struct Committer {
    instance_id: String,
    source: String,
    store: CheckpointStore,
    sink: ResultSink,
    session: SessionLog,
    counts: ScanCounts,
    last: Option<String>,
    progress: SharedProgress,
    checkpoint_every: u64,
    flush_every: u64,
    since_checkpoint: u64,
    since_flush: u64,
}

impl Committer {
    async fn commit(&mut self, step: Step) -> Result<()> {
        match step {
            Step::Skipped(slug) => {
                debug!(slug = %slug, "skipping known or already tested slug");
                self.counts.skipped += 1;
                self.session.counts.skipped += 1;
                self.last = Some(slug);
            }
            Step::Tested(result) => {
                let active = result.status == ScanStatus::Active;
                info!(
                    slug = %result.slug,
                    status = %result.status,
                    latency_ms = result.latency_ms,
                    business = %result.business_name,
                    "candidate tested"
                );
                self.counts.tested += 1;
                self.session.counts.tested += 1;
                if active {
                    self.counts.found += 1;
                    self.session.counts.found += 1;
                    info!(slug = %result.slug, business = %result.business_name, url = %result.url, "ACTIVE tenant found");
                    self.progress.found_entries.lock().await.push(result.clone());
                }
                self.last = Some(result.slug.clone());
                self.sink.append(result.clone())?;
                self.session.record(result);

                self.since_flush += 1;
                if active || self.since_flush >= self.flush_every {
                    self.sink.flush()?;
                    self.since_flush = 0;
                }
            }
        }

        self.progress.store_counts(&self.counts);
        *self.progress.last_candidate.lock().await = self.last.clone();

        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_every {
            self.progress.set_state(ScanState::Checkpointing).await;
            self.session.state = ScanState::Checkpointing;
            self.save_checkpoint()?;
            self.sink.save_session(&self.session)?;
            self.session.state = ScanState::Running;
            self.progress.set_state(ScanState::Running).await;
            self.since_checkpoint = 0;
        }
        Ok(())
    }

    fn save_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let Some(last) = &self.last else {
            return Ok(None);
        };
        let cp = Checkpoint::new(&self.instance_id, &self.source, last, self.counts);
        self.store.save(&cp)?;
        debug!(last = %last, tested = self.counts.tested, "checkpoint saved");
        Ok(Some(cp))
    }

    async fn finish(mut self, state: ScanState) -> Result<ScanOutcome> {
        self.session.state = state;
        self.session.ended_at = Some(now_rfc3339());
        let checkpoint = self.save_checkpoint()?;
        self.sink.flush()?;
        self.sink.save_session(&self.session)?;
        if state == ScanState::Done {
            self.store.clear()?;
        }
        self.progress.set_state(state).await;

        info!(
            state = state.as_str(),
            tested = self.session.counts.tested,
            found = self.session.counts.found,
            skipped = self.session.counts.skipped,
            "scan finished"
        );
        Ok(ScanOutcome {
            state,
            checkpoint,
            counts: self.counts,
            paths: self.sink.paths().clone(),
            session: self.session,
        })
    }

    /// Persist whatever was committed, ignoring further errors.
    async fn salvage(&mut self) {
        self.session.state = ScanState::Interrupted;
        self.session.ended_at = Some(now_rfc3339());
        if let Err(e) = self.save_checkpoint() {
            warn!("best-effort checkpoint failed: {e:#}");
        }
        if let Err(e) = self.sink.flush() {
            warn!("best-effort result flush failed: {e:#}");
        }
        if let Err(e) = self.sink.save_session(&self.session) {
            warn!("best-effort session log failed: {e:#}");
        }
        self.progress.set_state(ScanState::Interrupted).await;
    }
}
