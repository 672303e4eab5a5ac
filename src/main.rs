use anyhow::Result;
use clap::{CommandFactory, Parser, error::ErrorKind};
use colored::Colorize;
use colored::control::set_override as set_color_override;
use dsverify::backend::{Engine, ExternalEngine};
use dsverify::command::{DEFAULT_ENGINE, Platform, engine_for};
use dsverify::compare::diff_test;
use dsverify::i18n;
use dsverify::plan::{DEFAULT_THREAD_COUNT, Invocation, TestKind, WorkItem, load_plans, select_plans};
use dsverify::replay::{ReplayOptions, load_failed_tests, regroup};
use dsverify::report::{ReportAggregator, print_phase_summary, render_totals};
use dsverify::scheduler::{Halt, Scheduler, SchedulerOptions};
use dsverify::{t, t_args};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug, Clone)]
#[command(version, author, about = t!("cli-about"))]
struct Cli {
    // PLANS: YAML plan files or directories holding them
    #[arg(value_name = "PLANS")]
    plans: Vec<PathBuf>,

    // Datasources to run, comma separated, or "all"
    #[arg(long = "run", value_name = "DS", default_value = "all", help = t!("cli-run"))]
    run: String,

    // Logical test sets only, optionally filtered by config name
    #[arg(
        short = 'q',
        long = "logical",
        value_name = "FILTER",
        num_args = 0..=1,
        default_missing_value = "*",
        help = t!("cli-logical")
    )]
    logical: Option<String>,

    #[arg(
        short = 'e',
        long = "expression",
        value_name = "FILTER",
        num_args = 0..=1,
        default_missing_value = "*",
        help = t!("cli-expression")
    )]
    expression: Option<String>,

    #[arg(
        short = 't',
        long = "threads",
        value_name = "N",
        default_value_t = DEFAULT_THREAD_COUNT,
        help = t!("cli-threads")
    )]
    threads: usize,

    #[arg(
        long = "engine",
        value_name = "PATH",
        env = "DSVERIFY_ENGINE_PATH",
        default_value = DEFAULT_ENGINE,
        help = t!("cli-engine")
    )]
    engine: String,

    // Smoke tests only
    #[arg(long = "verify", help = t!("cli-verify"))]
    verify: bool,

    #[arg(long = "require-smoke-test", help = t!("cli-require-smoke-test"))]
    require_smoke_test: bool,

    #[arg(long = "force-run", help = t!("cli-force-run"))]
    force_run: bool,

    #[arg(long = "no-clean", help = t!("cli-no-clean"))]
    no_clean: bool,

    #[arg(long = "compare-sql", help = t!("cli-compare-sql"))]
    compare_sql: bool,

    #[arg(long = "nocompare-tuples", help = t!("cli-nocompare-tuples"))]
    nocompare_tuples: bool,

    #[arg(long = "compare-error", help = t!("cli-compare-error"))]
    compare_error: bool,

    #[arg(long = "tolerance", value_name = "EPSILON", help = t!("cli-tolerance"))]
    tolerance: Option<f64>,

    #[arg(long = "always-generate-expected", help = t!("cli-always-generate-expected"))]
    always_generate_expected: bool,

    // Replay the failed tests of a previous JSON report
    #[arg(
        short = 'f',
        long = "run-file",
        value_name = "JSON",
        conflicts_with = "diff",
        help = t!("cli-run-file")
    )]
    run_file: Option<PathBuf>,

    // Diff an existing actual file against its expected files
    #[arg(long = "diff", value_name = "TEST", help = t!("cli-diff"))]
    diff: Option<PathBuf>,

    #[arg(long = "list", help = t!("cli-list"))]
    list: bool,

    // Suite root used to resolve replayed fixtures and TDS files
    #[arg(long = "root", value_name = "DIR", help = t!("cli-root"))]
    root: Option<PathBuf>,

    #[arg(long = "output-dir", value_name = "DIR", help = t!("cli-output-dir"))]
    output_dir: Option<PathBuf>,

    #[arg(long = "temp-dir", value_name = "DIR", help = t!("cli-temp-dir"))]
    temp_dir: Option<PathBuf>,

    #[arg(long = "noheader", help = t!("cli-noheader"))]
    noheader: bool,

    #[arg(short = 'v', long = "verbose", help = t!("cli-verbose"))]
    verbose: bool,

    #[arg(long = "no-color", help = t!("cli-no-color"))]
    no_color: bool,
}

/// Makes CLI flags bold
fn format_flags_bold(text: &str) -> String {
    let Ok(flag_regex) = Regex::new(r"(?m)^(\s*)(--?\w+(?:-\w+[^<\n]*)*)") else {
        return text.to_string();
    };
    flag_regex
        .replace_all(text, |caps: &regex::Captures| {
            format!("{}{}", &caps[1], caps[2].bold())
        })
        .to_string()
}

fn format_clap_error(error: &clap::Error) -> String {
    let mut msg = error.to_string();
    msg = msg.replace("Usage:", &format!("{}", t!("cli-error-usage").bold().underline()));
    msg = msg.replace("For more information, try '--help'.", &t!("cli-error-help-info"));
    msg = msg.replace("error:", &format!("{}", t!("cli-error-label").red().bold()));
    msg = msg.replace("tip:", &t!("cli-tip-label"));
    msg = msg.replace("dsverify", &format!("{}", "dsverify".bold()));
    format_flags_bold(&msg)
}

fn create_custom_help() -> String {
    let mut help_text = Cli::command().render_long_help().to_string();
    help_text = help_text.replace("Usage:", &format!("{}", t!("cli-error-usage").bold().underline()));
    help_text = help_text.replace("Arguments:", &format!("{}", t!("cli-help-arguments").bold().underline()));
    help_text = help_text.replace("Options:", &format!("{}", t!("cli-help-options").bold().underline()));
    help_text = help_text.replace("Print help", &t!("cli-help-print-help"));
    help_text = help_text.replace("Print version", &t!("cli-help-print-version"));
    help_text = help_text.replace("dsverify", &format!("{}", "dsverify".bold()));
    format_flags_bold(&help_text)
}

fn invocation_template(cli: &Cli) -> Invocation {
    Invocation {
        tested_sql: cli.compare_sql,
        tested_tuples: !cli.nocompare_tuples,
        tested_error: cli.compare_error,
        verbose: cli.verbose,
        noheader: cli.noheader,
        thread_count: cli.threads,
        leave_temp_dir: cli.no_clean,
        custom_output_dir: cli.temp_dir.clone(),
        tolerance: cli.tolerance,
        always_generate_expected: cli.always_generate_expected,
        ..Invocation::default()
    }
}

fn run_diff(cli: &Cli, fixture: &Path) -> Result<i32> {
    let kind = if cli.logical.is_some() { TestKind::Logical } else { TestKind::Expression };
    let output_dir = match &cli.output_dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    let counts = diff_test(fixture, kind, &output_dir, &invocation_template(cli))?;
    for (path, count) in &counts {
        println!("{}", t_args!("diff-line", "file" => path.display(), "count" => count));
    }
    Ok(if counts.iter().any(|(_, c)| *c == 0) { 0 } else { 1 })
}

fn list_plans(cli: &Cli) -> Result<()> {
    let plans = load_plans(&cli.plans)?;
    for plan in select_plans(&plans, &cli.run)? {
        println!("{}", t_args!("list-plan", "ds" => plan.name.bold(), "root" => plan.root_dir.display()));
        for ts in &plan.test_sets {
            let mut flags = Vec::new();
            if ts.smoke_test {
                flags.push("smoke");
            }
            if !ts.enabled {
                flags.push("disabled");
            }
            if plan.run_time.run_as_perf {
                flags.push("perf");
            }
            println!(
                "{}",
                t_args!("list-test-set",
                    "name" => ts.config_name,
                    "kind" => ts.kind.label(),
                    "tds" => ts.tds_name,
                    "flags" => flags.join(",")
                )
            );
        }
    }
    Ok(())
}

fn plan_items(cli: &Cli, threads: &mut usize) -> Result<Vec<WorkItem>> {
    let plans = load_plans(&cli.plans)?;
    let template = invocation_template(cli);
    let mut items = Vec::new();
    for plan in select_plans(&plans, &cli.run)? {
        if plan.run_time.max_threads > 0 {
            *threads = (*threads).min(plan.run_time.max_threads);
        }
        items.extend(plan.work_items(&template, cli.logical.as_deref(), cli.expression.as_deref()));
    }
    Ok(items)
}

fn replay_items(cli: &Cli, run_file: &Path) -> Result<Vec<WorkItem>> {
    let root = match &cli.root {
        Some(r) => r.clone(),
        None => std::env::current_dir()?,
    };
    let failed = load_failed_tests(run_file)?;
    info!("{}", t_args!("replay-found", "count" => failed.failed_tests.len()));
    let options = ReplayOptions {
        thread_count: Some(cli.threads),
        leave_temp_dir: cli.no_clean,
        timeout_seconds: None,
    };
    Ok(regroup(&failed, &root, &options))
}

fn run(cli: &Cli) -> Result<i32> {
    if let Some(fixture) = &cli.diff {
        return run_diff(cli, fixture);
    }
    if cli.list {
        list_plans(cli)?;
        return Ok(0);
    }

    let mut threads = cli.threads.max(1);
    let items = match &cli.run_file {
        Some(run_file) => replay_items(cli, run_file)?,
        None => {
            if cli.plans.is_empty() {
                error!("{}", t!("error-no-plans"));
                return Ok(2);
            }
            plan_items(cli, &mut threads)?
        }
    };
    if items.is_empty() {
        error!("{}", t!("error-no-tests"));
        return Ok(2);
    }

    let platform = Platform::current();
    let mut engine = ExternalEngine::new(cli.engine.clone());
    engine.quiet = !cli.verbose;
    // plan level engine overrides are not validated up front
    if items.iter().any(|i| engine_for(&cli.engine, platform, &i.invocation) == cli.engine) {
        if let Err(e) = engine.validate() {
            error!("{:#}", e);
            return Ok(1);
        }
    }

    let scheduler = Scheduler::new(SchedulerOptions {
        max_workers: threads,
        require_smoke_test: cli.require_smoke_test,
        force_run: cli.force_run,
        smoke_only: cli.verify,
        engine_path: cli.engine.clone(),
        platform,
    });
    let report = scheduler.run(items, &engine);

    if !report.smoke.completed.is_empty() {
        print_phase_summary(&t!("phase-smoke"), &report.smoke);
    }
    if !report.main.completed.is_empty() {
        print_phase_summary(&t!("phase-main"), &report.main);
    }
    match report.halted {
        Some(Halt::SmokeTestFailed) => error!("{}", t!("halt-smoke-failed")),
        Some(Halt::NoSmokeTests) => error!("{}", t!("halt-no-smoke-tests")),
        Some(Halt::SmokeOnly) => info!("{}", t!("halt-smoke-only")),
        Some(Halt::NothingToRun) => warn!("{}", t!("error-no-tests")),
        None => {}
    }

    let totals = report.totals();
    let halted_without_results = report.halted == Some(Halt::NoSmokeTests);

    let output_root = match &cli.output_dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    let aggregator = ReportAggregator::new(output_root);
    if cli.run_file.is_none() {
        aggregator.reset()?;
    }
    let merged = aggregator.merge(report.into_completed())?;
    for dir in &merged.kept_dirs {
        println!("{}", t_args!("kept-temp-dir", "dir" => dir.display()));
    }

    println!("{}", render_totals(&totals));
    if totals.failed > 0 {
        let csv = aggregator.csv_path();
        let json = aggregator.json_path();
        println!("{}", t_args!("artifacts", "csv" => csv.display(), "json" => json.display()));
    }

    if halted_without_results {
        return Ok(1);
    }
    Ok(i32::try_from(totals.failed.min(255)).unwrap_or(255))
}

fn main() -> Result<()> {
    i18n::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp => {
                println!("{}", create_custom_help());
                std::process::exit(0);
            }
            ErrorKind::DisplayVersion => {
                println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => {
                eprintln!("{}", format_clap_error(&error));
                std::process::exit(2);
            }
        },
    };

    // RUST_LOG overrides the verbosity flag
    let filter = if cli.verbose {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "dsverify=info".to_string())
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "dsverify=warn".to_string())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    set_color_override(!cli.no_color);

    let code = run(&cli)?;
    std::process::exit(code);
}
