//! Cohort CLI - Command-line driver for Cohort Lens
//!
//! Commands:
//! - pipeline: register → collect → analyze → report → list, continuing past phase errors
//! - register / collect / analyze / report: run a single phase
//! - studies / significant / export: read persisted state
//! - seed: write synthetic voice and PHQ-9 data into the store
//! - doctor: diagnose store and configuration
//!
//! All commands operate on a JSON store snapshot (`--store`).

use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cohort_lens::catalog::{find_template, PRECONFIGURED_STUDIES};
use cohort_lens::report::render_text;
use cohort_lens::types::{RawRecord, Study, SubjectRecord, VariableSource};
use cohort_lens::{
    AnalysisOptions, CancellationToken, MemoryStore, PairingRule, Progress, ResearchConfig,
    ResearchEngine, ResearchError, RunContext, StoreError, ENGINE_VERSION, PRODUCER_NAME,
};

/// Cohort - de-identified longitudinal cohorts and lag-correlation analysis
#[derive(Parser)]
#[command(name = "cohort")]
#[command(author = "Synheart AI Inc")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Run clinical research studies over pseudonymized cohorts", long_about = None)]
struct Cli {
    /// Store snapshot file (created if missing)
    #[arg(long, global = true, default_value = "cohort-store.json")]
    store: PathBuf,

    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker threads for per-subject and per-lag work (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Abandon long-running phases after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every phase for one study, logging and continuing past phase errors
    Pipeline {
        /// Study code
        #[arg(long, default_value = "EVA-VOICE-PHQ9-001")]
        study: String,

        /// Predictor variable (defaults to the study's primary pair)
        #[arg(long)]
        x: Option<String>,

        /// Outcome variable (defaults to the study's primary pair)
        #[arg(long)]
        y: Option<String>,

        /// Largest lag to test, in days
        #[arg(long, default_value = "14")]
        max_lag: u32,
    },

    /// Register the preconfigured studies
    Register,

    /// Build the cohort if needed, then anonymize it
    Collect {
        /// Study code
        code: String,

        /// Rebuild the cohort even if it was built before
        #[arg(long)]
        rebuild: bool,
    },

    /// Run a lag-correlation sweep between two variables
    Analyze {
        /// Study code
        code: String,

        /// Predictor variable
        x: String,

        /// Outcome variable
        y: String,

        /// Largest lag to test, in days
        #[arg(long, default_value = "14")]
        max_lag: u32,

        /// Per-lag significance threshold
        #[arg(long)]
        alpha: Option<f64>,

        /// Minimum pooled pairs for a significant lag
        #[arg(long)]
        min_sample: Option<usize>,

        /// Timestamp matching tolerance in minutes
        #[arg(long)]
        tolerance_minutes: Option<i64>,

        /// Pairing rule for shifted timestamps
        #[arg(long, value_enum)]
        pairing: Option<Pairing>,
    },

    /// Generate the study report
    Report {
        /// Study code
        code: String,
    },

    /// List registered studies
    Studies,

    /// Per-lag significant correlations from the latest runs
    Significant {
        /// Study code
        code: String,
    },

    /// Export the latest anonymized collection as NDJSON
    Export {
        /// Study code
        code: String,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Write synthetic subjects with voice pitch and PHQ-9 records into the store
    Seed {
        /// Number of subjects
        #[arg(long, default_value = "40")]
        subjects: usize,

        /// Days between PHQ-9 assessments and the voice sample they follow
        #[arg(long, default_value = "7")]
        lag_days: i64,
    },

    /// Diagnose store and configuration
    Doctor,
}

#[derive(Clone, Copy, ValueEnum)]
enum Pairing {
    /// Closest Y observation in either direction
    Nearest,
    /// First Y observation at or after the shifted timestamp
    FirstAtOrAfter,
}

impl From<Pairing> for PairingRule {
    fn from(p: Pairing) -> Self {
        match p {
            Pairing::Nearest => PairingRule::Nearest,
            Pairing::FirstAtOrAfter => PairingRule::FirstAtOrAfter,
        }
    }
}

fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        if let Ok(d) = "cohort_lens=info".parse() {
            filter = filter.add_directive(d);
        }
        if let Ok(d) = "cohort=info".parse() {
            filter = filter.add_directive(d);
        }
    }

    fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CohortCliError> {
    let config = load_config(cli.config.as_deref(), cli.concurrency)?;

    if let Commands::Doctor = cli.command {
        return cmd_doctor(&cli.store, cli.config.as_deref(), &config, cli.json);
    }

    let store = open_store(&cli.store)?;
    let engine = ResearchEngine::new(store, config)?;
    let ctx = run_context(cli.timeout_secs);

    let result = match cli.command {
        Commands::Pipeline {
            study,
            x,
            y,
            max_lag,
        } => {
            cmd_pipeline(&engine, &ctx, &study, x, y, max_lag, cli.json);
            Ok(())
        }
        Commands::Register => cmd_register(&engine, cli.json),
        Commands::Collect { code, rebuild } => cmd_collect(&engine, &ctx, &code, rebuild, cli.json),
        Commands::Analyze {
            code,
            x,
            y,
            max_lag,
            alpha,
            min_sample,
            tolerance_minutes,
            pairing,
        } => {
            let options = AnalysisOptions {
                significance_threshold: alpha,
                min_sample_size: min_sample,
                match_tolerance_minutes: tolerance_minutes,
                pairing_rule: pairing.map(PairingRule::from),
                concurrency: None,
            };
            cmd_analyze(&engine, &ctx, &code, &x, &y, max_lag, &options, cli.json)
        }
        Commands::Report { code } => cmd_report(&engine, &code, cli.json),
        Commands::Studies => cmd_studies(&engine, cli.json),
        Commands::Significant { code } => cmd_significant(&engine, &code, cli.json),
        Commands::Export { code, output } => cmd_export(&engine, &code, &output),
        Commands::Seed { subjects, lag_days } => cmd_seed(&engine, subjects, lag_days, cli.json),
        Commands::Doctor => Ok(()),
    };

    // Phases already persisted their effects in the engine's store; keep them even
    // when the requested command failed afterwards
    engine.store().save(&cli.store).map_err(CohortCliError::Store)?;
    result
}

fn load_config(
    path: Option<&Path>,
    concurrency: Option<usize>,
) -> Result<ResearchConfig, CohortCliError> {
    let mut config = match path {
        Some(path) => ResearchConfig::from_file(path)?,
        None => ResearchConfig::default(),
    };
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    config.validate()?;
    Ok(config)
}

fn open_store(path: &Path) -> Result<MemoryStore, CohortCliError> {
    if path.exists() {
        let store = MemoryStore::load(path).map_err(CohortCliError::Store)?;
        debug!(path = %path.display(), subjects = store.subject_count(), "store loaded");
        Ok(store)
    } else {
        warn!(path = %path.display(), "store snapshot not found, starting empty");
        Ok(MemoryStore::new())
    }
}

fn run_context(timeout_secs: Option<u64>) -> RunContext {
    let ctx = RunContext::new().with_progress(|p: Progress| {
        debug!(phase = %p.phase, processed = p.processed, total = p.total, "progress");
    });
    match timeout_secs {
        Some(secs) => ctx.with_cancellation(CancellationToken::with_timeout(
            std::time::Duration::from_secs(secs),
        )),
        None => ctx,
    }
}

fn cmd_pipeline(
    engine: &ResearchEngine<MemoryStore>,
    ctx: &RunContext,
    study: &str,
    x: Option<String>,
    y: Option<String>,
    max_lag: u32,
    json: bool,
) {
    let primary = find_template(PRECONFIGURED_STUDIES, study).map(|t| t.primary_pair);
    let x = x.or_else(|| primary.map(|p| p.0.to_string()));
    let y = y.or_else(|| primary.map(|p| p.1.to_string()));

    info!("phase 1: registering preconfigured studies");
    if let Err(e) = engine.create_preconfigured_studies(PRECONFIGURED_STUDIES) {
        error!(error = %e, "registration failed");
    }

    info!(study, "phase 2: collecting data");
    match engine.collect_data_for_cohort(study, ctx) {
        Ok(summary) => info!(
            enrolled = summary.enrolled,
            anonymized = summary.anonymized,
            skipped = summary.skipped.len(),
            "collection finished"
        ),
        Err(e) => error!(error = %e, retryable = e.is_retryable(), "collection failed"),
    }

    info!(study, "phase 3: lag correlation analysis");
    match (x, y) {
        (Some(x), Some(y)) => {
            match engine.run_lag_correlation_analysis(
                study,
                &x,
                &y,
                max_lag,
                &AnalysisOptions::default(),
                ctx,
            ) {
                Ok(run) => match &run.best_lag {
                    Some(best) => info!(
                        lag = best.lag_days,
                        r = best.coefficient,
                        p = best.p_value,
                        "analysis finished"
                    ),
                    None => info!("analysis finished without a significant lag"),
                },
                Err(e) => error!(error = %e, retryable = e.is_retryable(), "analysis failed"),
            }
        }
        _ => error!("no variable pair given and study has no primary pair"),
    }

    info!(study, "phase 4: study report");
    match engine.generate_study_report(study) {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{}", text),
                    Err(e) => error!(error = %e, "report serialization failed"),
                }
            } else {
                println!("{}", render_text(&report));
            }
        }
        Err(e) => error!(error = %e, "report failed"),
    }

    info!("phase 5: registered studies");
    match engine.get_all_studies() {
        Ok(studies) => match render_studies(&studies, json) {
            Ok(text) => println!("{}", text),
            Err(e) => error!(error = %e, "study list serialization failed"),
        },
        Err(e) => error!(error = %e, "listing studies failed"),
    }
}

fn cmd_register(engine: &ResearchEngine<MemoryStore>, json: bool) -> Result<(), CohortCliError> {
    let outcome = engine.create_preconfigured_studies(PRECONFIGURED_STUDIES)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for code in &outcome.registered {
            println!("registered {}", code);
        }
        for code in &outcome.existing {
            println!("already registered {}", code);
        }
    }
    Ok(())
}

fn cmd_collect(
    engine: &ResearchEngine<MemoryStore>,
    ctx: &RunContext,
    code: &str,
    rebuild: bool,
    json: bool,
) -> Result<(), CohortCliError> {
    if rebuild {
        let outcome = engine.build_cohort(code, ctx)?;
        if !json {
            println!(
                "Cohort rebuilt: {} enrolled (+{} / -{})",
                outcome.enrolled, outcome.added, outcome.removed
            );
        }
    }

    let summary = engine.collect_data_for_cohort(code, ctx)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Collection {}", summary.collection_id);
        println!("  Enrolled:     {}", summary.enrolled);
        println!("  Anonymized:   {}", summary.anonymized);
        println!("  Skipped:      {}", summary.skipped.len());
        println!("  Observations: {}", summary.observations);
        if summary.out_of_range > 0 {
            println!("  Out of range: {}", summary.out_of_range);
        }
        for skipped in &summary.skipped {
            println!("  [SKIP] {}: {}", skipped.subject_id, skipped.reason);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_analyze(
    engine: &ResearchEngine<MemoryStore>,
    ctx: &RunContext,
    code: &str,
    x: &str,
    y: &str,
    max_lag: u32,
    options: &AnalysisOptions,
    json: bool,
) -> Result<(), CohortCliError> {
    let run = engine.run_lag_correlation_analysis(code, x, y, max_lag, options, ctx)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!("Run {} ({} -> {})", run.run_id, run.variable_x, run.variable_y);
    println!("  lag      n   subj        r          p  sig");
    for r in &run.results {
        println!(
            "  {:>3} {:>6} {:>6} {:>8.3} {:>10.2e}  {}",
            r.lag_days,
            r.sample_size,
            r.subjects,
            r.coefficient,
            r.p_value,
            if r.significant { "*" } else { "" }
        );
    }
    match &run.best_lag {
        Some(best) => println!(
            "Best lag: {} days (r={:.3}, p={:.2e})",
            best.lag_days, best.coefficient, best.p_value
        ),
        None => println!("Best lag: none significant"),
    }
    Ok(())
}

fn cmd_report(
    engine: &ResearchEngine<MemoryStore>,
    code: &str,
    json: bool,
) -> Result<(), CohortCliError> {
    let report = engine.generate_study_report(code)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_text(&report));
    }
    Ok(())
}

fn cmd_studies(engine: &ResearchEngine<MemoryStore>, json: bool) -> Result<(), CohortCliError> {
    let studies = engine.get_all_studies()?;
    println!("{}", render_studies(&studies, json)?);
    Ok(())
}

/// Study list as pretty JSON or one table row per study
fn render_studies(studies: &[Study], json: bool) -> Result<String, serde_json::Error> {
    if json {
        return serde_json::to_string_pretty(studies);
    }
    if studies.is_empty() {
        return Ok("No studies registered".to_string());
    }
    let rows: Vec<String> = studies
        .iter()
        .map(|study| {
            let size = study.cohort_build.as_ref().map(|b| b.size).unwrap_or(0);
            format!(
                "{:<26} {:<11} cohort {:>4} / target {:>4}  {}",
                study.code(),
                study.status.as_str(),
                size,
                study.definition.target_subjects,
                study.definition.name
            )
        })
        .collect();
    Ok(rows.join("\n"))
}

fn cmd_significant(
    engine: &ResearchEngine<MemoryStore>,
    code: &str,
    json: bool,
) -> Result<(), CohortCliError> {
    let results = engine.get_significant_correlations(code)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No significant correlations");
    } else {
        for r in &results {
            println!(
                "{} -> {} lag {}d: r={:.3} p={:.2e} n={}",
                r.variable_x, r.variable_y, r.lag_days, r.coefficient, r.p_value, r.sample_size
            );
        }
    }
    Ok(())
}

fn cmd_export(
    engine: &ResearchEngine<MemoryStore>,
    code: &str,
    output: &Path,
) -> Result<(), CohortCliError> {
    let rows = if output.to_string_lossy() == "-" {
        let stdout = io::stdout();
        engine.export_dataset(code, stdout.lock())?
    } else {
        let file = fs::File::create(output)?;
        engine.export_dataset(code, io::BufWriter::new(file))?
    };
    info!(rows, "export finished");
    Ok(())
}

/// Deterministic synthetic population: PHQ-9 falls as voice pitch rises, observed
/// `lag_days` after each voice sample
fn cmd_seed(
    engine: &ResearchEngine<MemoryStore>,
    subjects: usize,
    lag_days: i64,
    json: bool,
) -> Result<(), CohortCliError> {
    let store = engine.store();
    let pitch = VariableSource::new("voice_prosody_features", "pitch_mean_hz");
    let phq9 = VariableSource::new("clinical_assessments", "phq9_score");
    let enrolled_at = Utc::now() - Duration::days(150);
    let mut records = 0;

    for i in 0..subjects {
        let subject_id = format!("idoso-{:04}", i);
        let birth_year = 1936 + (i * 7 % 28) as i32;
        let mut flags = std::collections::BTreeSet::new();
        if i % 10 == 9 {
            flags.insert("severe_hearing_impairment".to_string());
        }
        store
            .add_subject(SubjectRecord {
                subject_id: subject_id.clone(),
                full_name: format!("Synthetic Subject {}", i),
                document_number: Some(format!("{:011}", 10_000_000_000u64 + i as u64)),
                contact: None,
                birth_date: NaiveDate::from_ymd_opt(birth_year, 1 + (i % 12) as u32, 1)
                    .unwrap_or_default(),
                enrolled_at,
                flags,
            })
            .map_err(CohortCliError::Store)?;

        for visit in 0..12i64 {
            let at = enrolled_at + Duration::days(visit * 10) + Duration::hours((i % 5) as i64);
            let phase = i as f64 + visit as f64 * 0.7;
            let pitch_value = 180.0 + 15.0 * phase.sin();
            let noise = ((i * 31 + visit as usize * 17) % 7) as f64 - 3.0;
            let phq9_value = (12.0 - (pitch_value - 180.0) / 2.0 + noise).clamp(0.0, 27.0).round();

            store
                .add_raw_record(RawRecord {
                    subject_id: subject_id.clone(),
                    source: pitch.clone(),
                    recorded_at: at,
                    value: pitch_value,
                    label: None,
                })
                .map_err(CohortCliError::Store)?;
            store
                .add_raw_record(RawRecord {
                    subject_id: subject_id.clone(),
                    source: phq9.clone(),
                    recorded_at: at + Duration::days(lag_days),
                    value: phq9_value,
                    label: None,
                })
                .map_err(CohortCliError::Store)?;
            records += 2;
        }
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "subjects": subjects, "records": records })
        );
    } else {
        println!("Seeded {} subjects with {} raw records", subjects, records);
    }
    Ok(())
}

fn cmd_doctor(
    store_path: &Path,
    config_path: Option<&Path>,
    config: &ResearchConfig,
    json: bool,
) -> Result<(), CohortCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "engine_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Cohort Lens version {}", ENGINE_VERSION),
    });

    checks.push(DoctorCheck {
        name: "config".to_string(),
        status: CheckStatus::Ok,
        message: match config_path {
            Some(path) => format!(
                "{} (alpha {}, min sample {}, tolerance {} min, {} workers)",
                path.display(),
                config.significance_threshold,
                config.min_sample_size,
                config.match_tolerance_minutes,
                config.concurrency
            ),
            None => "defaults".to_string(),
        },
    });

    if config.collection_salt == ResearchConfig::default().collection_salt {
        checks.push(DoctorCheck {
            name: "collection_salt".to_string(),
            status: CheckStatus::Warning,
            message: "Using the built-in collection salt; set collection_salt for real data"
                .to_string(),
        });
    }

    if store_path.exists() {
        match MemoryStore::load(store_path) {
            Ok(store) => checks.push(DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Store snapshot valid ({} subjects)",
                    store.subject_count()
                ),
            }),
            Err(e) => checks.push(DoctorCheck {
                name: "store".to_string(),
                status: CheckStatus::Error,
                message: format!("Cannot load store snapshot: {}", e),
            }),
        }
    } else {
        checks.push(DoctorCheck {
            name: "store".to_string(),
            status: CheckStatus::Warning,
            message: "Store snapshot does not exist".to_string(),
        });
    }

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ENGINE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Cohort Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(CohortCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum CohortCliError {
    Io(io::Error),
    Research(ResearchError),
    Json(serde_json::Error),
    Store(StoreError),
    DoctorFailed,
}

impl From<io::Error> for CohortCliError {
    fn from(e: io::Error) -> Self {
        CohortCliError::Io(e)
    }
}

impl From<ResearchError> for CohortCliError {
    fn from(e: ResearchError) -> Self {
        CohortCliError::Research(e)
    }
}

impl From<serde_json::Error> for CohortCliError {
    fn from(e: serde_json::Error) -> Self {
        CohortCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<CohortCliError> for CliError {
    fn from(e: CohortCliError) -> Self {
        match e {
            CohortCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            CohortCliError::Research(e) => research_error(e),
            CohortCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            CohortCliError::Store(e) => CliError {
                code: "STORE_UNAVAILABLE".to_string(),
                message: e.to_string(),
                hint: Some("Check the --store path; run 'cohort doctor' for details".to_string()),
            },
            CohortCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

fn research_error(e: ResearchError) -> CliError {
    let (code, hint) = match &e {
        ResearchError::DuplicateStudy(_) => ("DUPLICATE_STUDY", None),
        ResearchError::InvalidDefinition(_) => ("INVALID_DEFINITION", None),
        ResearchError::StudyNotFound(_) => {
            ("STUDY_NOT_FOUND", Some("Run 'cohort studies' to list registered studies"))
        }
        ResearchError::EmptyCohort(_) => {
            ("EMPTY_COHORT", Some("No subject meets the study criteria"))
        }
        ResearchError::InsufficientData(_) => ("INSUFFICIENT_DATA", None),
        ResearchError::PhaseOrder { .. } => (
            "PHASE_ORDER",
            Some("Run the earlier phases first: register, collect, analyze, report"),
        ),
        ResearchError::Cancelled { .. } => ("CANCELLED", None),
        ResearchError::DeadlineExceeded { .. } => {
            ("DEADLINE_EXCEEDED", Some("Retry with a larger --timeout-secs"))
        }
        ResearchError::Store { .. } | ResearchError::SubjectFetch { .. } => {
            ("STORE_ERROR", Some("Transient failure; retry the command"))
        }
        ResearchError::JsonError(_) => ("JSON_ERROR", None),
        ResearchError::Config(_) => ("CONFIG_ERROR", Some("Check the --config file")),
        ResearchError::Io(_) => ("IO_ERROR", Some("Check file paths and permissions")),
    };
    CliError {
        code: code.to_string(),
        message: e.to_string(),
        hint: hint.map(str::to_string),
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_lens::types::StudyStatus;

    fn registered_studies() -> Vec<Study> {
        let engine = ResearchEngine::new(MemoryStore::new(), ResearchConfig::default()).unwrap();
        engine
            .create_preconfigured_studies(PRECONFIGURED_STUDIES)
            .unwrap();
        engine.get_all_studies().unwrap()
    }

    #[test]
    fn test_study_list_renders_as_json() {
        let studies = registered_studies();
        let text = render_studies(&studies, true).unwrap();
        let parsed: Vec<Study> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), studies.len());
        assert!(parsed.iter().all(|s| s.status == StudyStatus::Draft));
        assert!(parsed.iter().any(|s| s.code() == "EVA-VOICE-PHQ9-001"));
    }

    #[test]
    fn test_study_list_renders_as_table() {
        let studies = registered_studies();
        let text = render_studies(&studies, false).unwrap();
        assert_eq!(text.lines().count(), studies.len());
        assert!(text.contains("EVA-VOICE-PHQ9-001"));
        assert_eq!(render_studies(&[], false).unwrap(), "No studies registered");
    }
}
