use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slug_scan_rs::classify::KeywordClassifier;
use slug_scan_rs::config::ScanConfig;
use slug_scan_rs::database;
use slug_scan_rs::fetch::{BrowserFetcher, Fetcher, HttpFetcher, HybridFetcher};
use slug_scan_rs::known::{load_slug_list, KnownSetFilter};
use slug_scan_rs::scanner::{ScanLoop, ScanOutcome, ScanSettings, SharedProgress};
use slug_scan_rs::server::{self, AppState};
use slug_scan_rs::selftest::{self, Expectation};
use slug_scan_rs::sink::{read_result_file, TestedIndex};
use slug_scan_rs::slugspace::{
    sample_uniform, Alphabet, Base64Range, CandidateSource, PatternModel, SlugRange,
    DEFAULT_LENGTH,
};
use slug_scan_rs::types::{ScanState, ScanStatus};

/// slug-scan-rs: checkpointed slug-space scanner for booking-widget tenants.
#[derive(Debug, Parser)]
#[command(
    name = "slug-scan-rs",
    version,
    about = "Discover active booking-widget tenants by scanning short slugs, with checkpoint/resume.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug logging (RUST_LOG takes precedence when set).
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch and classify candidates, persisting results and checkpoints.
    Scan(ScanArgs),
    /// Print or write candidates from any source without fetching them.
    Generate(GenerateArgs),
    /// Union result logs into a master database (plus a CSV of ACTIVE tenants).
    Merge(MergeArgs),
    /// List slugs whose latest status is a fetch-layer error.
    RetryList(RetryArgs),
    /// Check detection accuracy on known-active and known-inactive slugs.
    SelfTest(SelfTestArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FetcherKind {
    Http,
    Browser,
    Hybrid,
}

/// Candidate source selection. Exactly one of file / range / predefined /
/// sample / smart-sample / base64 may be given; `--shard` narrows a range.
#[derive(Debug, Clone, Args)]
struct SourceArgs {
    /// Slug list file (one per line, `#` comments).
    #[arg(long)]
    file: Option<PathBuf>,

    /// First slug of an exhaustive range (inclusive).
    #[arg(long, requires = "end_range")]
    start_range: Option<String>,

    /// Last slug of an exhaustive range (inclusive).
    #[arg(long, requires = "start_range")]
    end_range: Option<String>,

    /// Classic shard of the 5-character space: 1 = 00000-99999, 2 = aaaaa-mzzzz, 3 = naaaa-zzzzz.
    #[arg(long)]
    predefined: Option<u8>,

    /// 1-based shard index of the selected range (or the whole space).
    #[arg(long, requires = "shards")]
    shard: Option<usize>,

    /// Number of equal shards to split the range into.
    #[arg(long, requires = "shard")]
    shards: Option<usize>,

    /// Uniformly sample this many random slugs.
    #[arg(long)]
    sample: Option<usize>,

    /// Sample this many slugs weighted by the known-active patterns.
    #[arg(long)]
    smart_sample: Option<usize>,

    /// First integer of a base64-numeric range.
    #[arg(long)]
    base64_start: Option<u64>,

    /// Last integer of a base64-numeric range.
    #[arg(long)]
    base64_end: Option<u64>,

    /// Slug length for exhaustive and sampled sources.
    #[arg(long, default_value_t = DEFAULT_LENGTH)]
    length: usize,

    /// RNG seed for sampling. Reuse the logged seed to resume a sampled scan.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name for this process; part of every output and checkpoint file name.
    #[arg(long, default_value = "scan")]
    instance_id: String,

    /// Directory for session logs and checkpoints.
    #[arg(long, default_value = "logs")]
    out_dir: PathBuf,

    #[command(flatten)]
    source: SourceArgs,

    #[arg(long, value_enum, default_value_t = FetcherKind::Browser)]
    fetcher: FetcherKind,

    /// Concurrent fetches (overrides config).
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum fetch starts per second (overrides config).
    #[arg(long)]
    rate: Option<f64>,

    /// Candidates between checkpoints (overrides config).
    #[arg(long)]
    checkpoint_every: Option<u64>,

    /// Result files of earlier runs whose slugs are skipped (repeatable).
    #[arg(long = "tested-db")]
    tested_db: Vec<PathBuf>,

    /// Ignore an existing checkpoint and start from the beginning.
    #[arg(long, default_value_t = false)]
    no_resume: bool,

    /// Serve the live status API on this address, e.g. 127.0.0.1:8080.
    #[arg(long = "serve-ui")]
    serve_ui: Option<String>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// TOML configuration file (for the known-active slugs).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    source: SourceArgs,

    /// Stop after this many candidates.
    #[arg(long)]
    limit: Option<u64>,

    /// Leave out known-active slugs.
    #[arg(long, default_value_t = false)]
    skip_known: bool,

    /// Write to this file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Result files: JSONL logs, results/session JSON, or other master databases.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Master database path.
    #[arg(long, default_value = "logs/master_database.json")]
    out: PathBuf,

    /// Also write a CSV of ACTIVE tenants here.
    #[arg(long)]
    active_csv: Option<PathBuf>,

    /// Do not fold in the existing master database.
    #[arg(long, default_value_t = false)]
    fresh: bool,
}

#[derive(Debug, Args)]
struct RetryArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write the slug list here instead of stdout (usable as `scan --file`).
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SelfTestArgs {
    /// TOML configuration file (target, classifier and known-active slugs).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "selftest")]
    instance_id: String,

    /// Directory for the summary JSON.
    #[arg(long, default_value = "logs")]
    out_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = FetcherKind::Browser)]
    fetcher: FetcherKind,

    /// Active and inactive slugs to test (each).
    #[arg(long, default_value_t = 5)]
    per_kind: usize,

    /// RNG seed for picking the slugs.
    #[arg(long)]
    seed: Option<u64>,

    /// Result files whose INACTIVE_ERROR slugs may be picked as inactive cases (repeatable).
    #[arg(long = "tested-db")]
    tested_db: Vec<PathBuf>,

    /// Fail when accuracy falls below this fraction.
    #[arg(long, default_value_t = 0.95)]
    min_accuracy: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Generate(args) => run_generate(args),
        Command::Merge(args) => run_merge(args),
        Command::RetryList(args) => run_retry_list(args),
        Command::SelfTest(args) => run_self_test(args).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .with(filter)
        .init();
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let mut config = ScanConfig::load_with_env(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.scan.workers = workers;
    }
    if let Some(rate) = args.rate {
        config.scan.rate_per_sec = rate;
    }
    if let Some(every) = args.checkpoint_every {
        config.scan.checkpoint_every = every;
    }
    config.validate()?;

    let known = KnownSetFilter::new(config.known_slugs.iter().cloned());
    let source = build_source(&args.source, &config.known_slugs, &known)?;
    let tested = TestedIndex::load(&args.tested_db)?;
    let classifier = KeywordClassifier::new(config.classifier.clone());
    let fetcher = build_fetcher(args.fetcher, &config, &classifier)?;

    let mut settings = ScanSettings::from_config(&config, &args.instance_id, &args.out_dir);
    settings.resume = !args.no_resume;

    println!("slug-scan-rs configuration:");
    println!("  instance     : {}", args.instance_id);
    println!("  source       : {} ({} candidates)", source.describe(), source.len());
    println!("  fetcher      : {:?}", args.fetcher);
    println!("  target       : {}", config.target.url_template);
    println!("  workers      : {}", config.scan.workers);
    println!("  rate/s       : {}", config.scan.rate_per_sec);
    println!("  known slugs  : {}", known.len());
    println!("  tested db    : {} slugs", tested.len());
    println!("  out dir      : {}", args.out_dir.display());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let progress = SharedProgress::new();
    let server_stop = CancellationToken::new();
    if let Some(bind) = args.serve_ui.clone() {
        let state = AppState::new(progress.clone(), &args.instance_id, &source.describe());
        let stop = server_stop.clone();
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state, stop).await {
                warn!("status server error: {e:#}");
            }
        });
    }

    let scan = ScanLoop::new(source, settings, fetcher, Arc::new(classifier))
        .with_known(known)
        .with_tested(tested)
        .with_progress(progress);
    let outcome = scan.run(cancel).await;
    server_stop.cancel();

    let outcome = outcome.context("scan aborted")?;
    print_summary(&outcome);
    Ok(())
}

fn build_fetcher(
    kind: FetcherKind,
    config: &ScanConfig,
    classifier: &KeywordClassifier,
) -> Result<Arc<dyn Fetcher>> {
    let fetcher: Arc<dyn Fetcher> = match kind {
        FetcherKind::Http => Arc::new(HttpFetcher::new(&config.http)?),
        FetcherKind::Browser => Arc::new(BrowserFetcher::new(config.browser.clone())),
        FetcherKind::Hybrid => Arc::new(HybridFetcher::new(
            Arc::new(HttpFetcher::new(&config.http)?),
            Arc::new(BrowserFetcher::new(config.browser.clone())),
            classifier.clone(),
            config.hybrid.clone(),
        )),
    };
    Ok(fetcher)
}

fn build_source(
    args: &SourceArgs,
    known_slugs: &[String],
    known: &KnownSetFilter,
) -> Result<CandidateSource> {
    let range_given = args.start_range.is_some() || args.predefined.is_some() || args.shard.is_some();
    let base64_given = args.base64_start.is_some() || args.base64_end.is_some();
    let selected = [
        args.file.is_some(),
        range_given,
        args.sample.is_some(),
        args.smart_sample.is_some(),
        base64_given,
    ]
    .iter()
    .filter(|s| **s)
    .count();
    if selected > 1 {
        bail!("choose one candidate source: --file, a range, --sample, --smart-sample or --base64-*");
    }
    if args.start_range.is_some() && args.predefined.is_some() {
        bail!("--start-range and --predefined are mutually exclusive");
    }

    if let Some(path) = &args.file {
        let slugs = load_slug_list(path)?;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        return Ok(CandidateSource::List { label, slugs });
    }

    if range_given {
        let alphabet = Alphabet::default();
        let mut range = match (&args.start_range, &args.end_range, args.predefined) {
            (Some(start), Some(end), _) => SlugRange::between(alphabet, start, end)?,
            (_, _, Some(n)) => SlugRange::predefined(n)?,
            _ => SlugRange::full(alphabet, args.length)?,
        };
        if let (Some(index), Some(count)) = (args.shard, args.shards) {
            range = range.shard(index, count)?;
        }
        return Ok(CandidateSource::Range(range));
    }

    if let Some(count) = args.sample.or(args.smart_sample) {
        let seed = args.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let alphabet = Alphabet::default();
        let (kind, slugs) = if args.smart_sample.is_some() {
            let model = PatternModel::learn(
                known_slugs.iter().map(String::as_str),
                &alphabet,
                args.length,
            )?;
            ("smart", model.sample(&mut rng, count, known.as_set())?)
        } else {
            (
                "sample",
                sample_uniform(&mut rng, &alphabet, args.length, count, known.as_set())?,
            )
        };
        info!(seed, count = slugs.len(), "{kind} candidates drawn");
        return Ok(CandidateSource::List {
            label: format!("{kind}-{count}-seed{seed}"),
            slugs,
        });
    }

    if base64_given {
        let Some(end) = args.base64_end else {
            bail!("--base64-end is required for a base64-numeric range");
        };
        let range = Base64Range::new(args.base64_start.unwrap_or(1), end)?;
        return Ok(CandidateSource::Base64(range));
    }

    bail!("no candidate source selected (use --file, --start-range/--end-range, --predefined, --shard/--shards, --sample, --smart-sample or --base64-end)")
}

/// Cancel `cancel` on Ctrl-C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested; saving progress");
    cancel.cancel();
}

fn print_summary(outcome: &ScanOutcome) {
    let session = &outcome.session;
    println!("\nScan {}: {}", session.session_id, outcome.state.as_str());
    println!(
        "  this session : tested {}  found {}  skipped {}",
        session.counts.tested, session.counts.found, session.counts.skipped
    );
    println!(
        "  cumulative   : tested {}  found {}  skipped {}",
        outcome.counts.tested, outcome.counts.found, outcome.counts.skipped
    );
    for status in ScanStatus::ALL {
        let n = session.count(status);
        if n > 0 {
            println!("  {:<17}: {}", status.as_str(), n);
        }
    }

    let active: Vec<_> = session
        .results
        .iter()
        .filter(|r| r.status == ScanStatus::Active)
        .collect();
    if !active.is_empty() {
        let slug_w = active.iter().map(|r| r.slug.len()).max().unwrap_or(4).max(4);
        let name_w = active
            .iter()
            .map(|r| r.business_name.chars().count().min(40))
            .max()
            .unwrap_or(8)
            .max(8);
        println!("\nActive tenants:");
        println!("{:<slug_w$}  {:<name_w$}  url", "slug", "business");
        println!("{:-<slug_w$}  {:-<name_w$}  ---", "", "");
        for r in active {
            let name: String = r.business_name.chars().take(40).collect();
            println!("{:<slug_w$}  {:<name_w$}  {}", r.slug, name, r.url);
        }
    }

    println!("\nResults : {}", outcome.paths.csv.display());
    println!("Log     : {}", outcome.paths.jsonl.display());
    println!("Session : {}", outcome.paths.session.display());
    if outcome.state == ScanState::Interrupted {
        if let Some(cp) = &outcome.checkpoint {
            println!(
                "Interrupted after {}; run the same command again to resume.",
                cp.last_candidate
            );
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let config = ScanConfig::load_with_env(args.config.as_deref())?;
    let known = KnownSetFilter::new(config.known_slugs.iter().cloned());
    let source = build_source(&args.source, &config.known_slugs, &known)?;

    let mut out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let limit = args.limit.unwrap_or(u64::MAX);
    let mut written = 0u64;
    for slug in source.candidates_after(None)? {
        if written >= limit {
            break;
        }
        if args.skip_known && known.is_known(&slug) {
            continue;
        }
        writeln!(out, "{slug}")?;
        written += 1;
    }
    out.flush()?;
    info!(written, source = %source.describe(), "candidates generated");
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let report =
        database::merge_files(&args.inputs, &args.out, args.active_csv.as_deref(), !args.fresh)?;
    println!("Merged {} files ({} records) into {}", report.files, report.records_read, args.out.display());
    println!("  unique slugs : {}", report.unique_slugs);
    for (status, n) in &report.by_status {
        println!("  {:<17}: {}", status.as_str(), n);
    }
    if let Some(csv) = &args.active_csv {
        println!("Active CSV: {} ({} tenants)", csv.display(), report.active);
    }
    Ok(())
}

fn run_retry_list(args: RetryArgs) -> Result<()> {
    let slugs = database::retry_list(&args.inputs)?;
    let mut text = format!("# {} slugs with fetch errors\n", slugs.len());
    for slug in &slugs {
        text.push_str(slug);
        text.push('\n');
    }
    match &args.out {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {} slugs to {}", slugs.len(), path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

async fn run_self_test(args: SelfTestArgs) -> Result<()> {
    let config = ScanConfig::load_with_env(args.config.as_deref())?;
    config.validate()?;

    let mut records = Vec::new();
    for path in &args.tested_db {
        records.extend(read_result_file(path)?);
    }
    let inactive = selftest::known_inactive(records, &config.known_slugs);
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let cases = selftest::pick_cases(&mut rng, &config.known_slugs, &inactive, args.per_kind);
    info!(seed, cases = cases.len(), inactive_pool = inactive.len(), "self-test cases picked");

    let classifier = KeywordClassifier::new(config.classifier.clone());
    let fetcher = build_fetcher(args.fetcher, &config, &classifier)?;
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let report = selftest::run_self_test(
        &args.instance_id,
        cases,
        fetcher,
        Arc::new(classifier),
        config.target.clone(),
        config.scan.rate_per_sec,
        &cancel,
    )
    .await;

    println!("\nSelf-test {}:", args.instance_id);
    println!("{:<8}  {:<8}  {:<17}  {:<4}  business", "slug", "expected", "actual", "ok");
    for e in &report.entries {
        let expected = match e.expected {
            Expectation::Active => "ACTIVE",
            Expectation::Inactive => "INACTIVE",
        };
        let name: String = e.result.business_name.chars().take(40).collect();
        println!(
            "{:<8}  {:<8}  {:<17}  {:<4}  {}",
            e.result.slug,
            expected,
            e.result.status.as_str(),
            if e.passed { "yes" } else { "NO" },
            name
        );
    }
    println!(
        "  active   : {}/{}",
        report.active.passed, report.active.tested
    );
    println!(
        "  inactive : {}/{}",
        report.inactive.passed, report.inactive.tested
    );
    println!("  accuracy : {:.1}%", report.accuracy * 100.0);

    let path = report.save(&args.out_dir)?;
    println!("Summary : {}", path.display());

    if report.accuracy < args.min_accuracy {
        bail!(
            "self-test accuracy {:.1}% is below the required {:.1}%",
            report.accuracy * 100.0,
            args.min_accuracy * 100.0
        );
    }
    Ok(())
}
