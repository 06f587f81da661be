use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use backlog_gfm_core::backlog::{BacklogClient, BacklogClientConfig};
use backlog_gfm_core::config::{
    DEFAULT_CONFIG_FILENAME, EnvLookup, FileConfig, MigrationConfig, load_config,
    normalize_project_code, parse_dry_run_answer, process_env, validate_api_key,
    validate_space_host,
};
use backlog_gfm_core::headers::{has_unspaced_headers, normalize_headers};
use backlog_gfm_core::migrate::{
    BatchProgress, BatchReport, DEFAULT_WRITE_INTERVAL, ItemKind, ItemOutcome, ItemResult,
    MigrationOptions, MigrationReport, NoProgress, ProcessingStats, RunMode, run_migration,
};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use indicatif::{ProgressBar, ProgressStyle};
use similar::TextDiff;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILE: &str = "migration.log";

#[derive(Debug, Parser)]
#[command(
    name = "backlog-gfm",
    version,
    about = "Rewrite Backlog issue and wiki headers into GFM syntax (`#Title` -> `# Title`)"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "TOML config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Fix headers in every issue and wiki page of a project")]
    Migrate(MigrateArgs),
    #[command(about = "Preview header fixes for a local Markdown file")]
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, value_name = "HOST", help = "Backlog space, e.g. yourspace.backlog.com")]
    space: Option<String>,
    #[arg(long, value_name = "CODE", help = "Project code")]
    project: Option<String>,
    #[arg(long, conflicts_with = "execute", help = "Preview changes without updating")]
    dry_run: bool,
    #[arg(long, help = "Write fixed content back to Backlog")]
    execute: bool,
    #[arg(long, value_enum, help = "Only process one kind of content")]
    only: Option<OnlyKind>,
    #[arg(long, value_name = "MS", help = "Pause after each update (default 1000)")]
    write_interval_ms: Option<u64>,
    #[arg(long, value_name = "PATH", help = "Diagnostic log file")]
    log_file: Option<PathBuf>,
    #[arg(long, help = "Print the final report as JSON")]
    json: bool,
    #[arg(long, help = "Disable progress bars")]
    no_progress: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnlyKind {
    Issues,
    Wikis,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(value_name = "PATH", help = "Markdown file, or `-` for stdin")]
    path: PathBuf,
    #[arg(long, help = "Rewrite the file in place")]
    write: bool,
    #[arg(long, help = "Exit non-zero when any header needs fixing")]
    fail_on_change: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(cli.config.as_deref(), args),
        Some(Commands::Check(args)) => run_check(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_migrate(config_path: Option<&Path>, args: MigrateArgs) -> Result<()> {
    let log_path = args
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    init_logging(&log_path)?;

    let result = migrate(config_path, &args, &log_path);
    if let Err(err) = &result {
        error!("migration failed: {err:#}");
    }
    result
}

fn migrate(config_path: Option<&Path>, args: &MigrateArgs, log_path: &Path) -> Result<()> {
    if !args.json {
        println!("Backlog to GFM Markdown Migration Tool");
        println!("{}", "=".repeat(42));
    }
    info!("starting Backlog to GFM migration");

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let file_config = load_config(&config_path)?;
    let config =
        resolve_migration_config(args, &file_config, &process_env, &mut TerminalPrompter)?;
    info!(
        project = %config.project_code,
        dry_run = config.dry_run,
        "processing project"
    );

    let mode = RunMode::from_dry_run(config.dry_run);
    let write_interval = args
        .write_interval_ms
        .map(Duration::from_millis)
        .or_else(|| file_config.write_interval(&process_env))
        .unwrap_or(DEFAULT_WRITE_INTERVAL);
    let options = MigrationOptions::new(mode).with_write_interval(write_interval);
    let kinds = match args.only {
        Some(OnlyKind::Issues) => vec![ItemKind::Issue],
        Some(OnlyKind::Wikis) => vec![ItemKind::Wiki],
        None => ItemKind::ALL.to_vec(),
    };

    let client_config = BacklogClientConfig::resolve(&config, &file_config, &process_env);
    let mut client = BacklogClient::new(client_config)?;
    if !args.json {
        println!();
        println!("Validating project {} on {}...", config.project_code, config.host);
        if mode.is_dry_run() {
            println!("DRY-RUN MODE: analyzing items that need header fixes (nothing is written)");
        } else {
            println!("EXECUTE MODE: fixed content will be written back to Backlog");
        }
    }

    let report = if args.json || args.no_progress {
        run_migration(
            &mut client,
            &config.project_code,
            &kinds,
            &options,
            &mut NoProgress,
        )?
    } else {
        let mut progress = BarProgress::new(mode);
        run_migration(
            &mut client,
            &config.project_code,
            &kinds,
            &options,
            &mut progress,
        )?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, log_path);
    }
    Ok(())
}

/// flag > env > config file > interactive prompt.
fn resolve_migration_config(
    args: &MigrateArgs,
    file: &FileConfig,
    env: &EnvLookup,
    prompter: &mut impl Prompter,
) -> Result<MigrationConfig> {
    let host = match args.space.clone().or_else(|| file.space(env)) {
        Some(value) => validate_space_host(&value)?,
        None => prompt_until(
            prompter,
            "Enter your Backlog space (e.g., yourspace.backlog.com):",
            false,
            validate_space_host,
        )?,
    };
    let api_key = match file.api_key(env) {
        Some(value) => value,
        None => prompt_until(
            prompter,
            "Enter your Backlog API key:",
            true,
            validate_api_key,
        )?,
    };
    let project_code = match args.project.clone().or_else(|| file.project(env)) {
        Some(value) => normalize_project_code(&value)?,
        None => prompt_until(
            prompter,
            "Enter the project code:",
            false,
            normalize_project_code,
        )?,
    };
    let dry_run = if args.dry_run {
        true
    } else if args.execute {
        false
    } else {
        match file.dry_run(env)? {
            Some(value) => value,
            None => prompt_until(
                prompter,
                "Run in dry-run mode? (Preview changes without updating) [Y/n]:",
                false,
                parse_dry_run_answer,
            )?,
        }
    };

    MigrationConfig::new(&host, &api_key, &project_code, dry_run)
}

/// Source of answers for settings nobody supplied.
trait Prompter {
    /// Returns `None` once input is exhausted. `secret` answers are not echoed.
    fn answer(&mut self, message: &str, secret: bool) -> Result<Option<String>>;
}

/// Ask until `validate` accepts the answer; fails when input runs out.
fn prompt_until<T>(
    prompter: &mut impl Prompter,
    message: &str,
    secret: bool,
    validate: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    loop {
        let Some(input) = prompter.answer(message, secret)? else {
            bail!("input closed while waiting for: {message}");
        };
        match validate(&input) {
            Ok(value) => return Ok(value),
            Err(err) => eprintln!("  {err}"),
        }
    }
}

/// Prompts on stderr so `--json` output on stdout stays clean.
struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn answer(&mut self, message: &str, secret: bool) -> Result<Option<String>> {
        eprint!("{message} ");
        io::stderr().flush()?;

        let stdin = io::stdin();
        if secret && stdin.is_terminal() {
            return read_hidden_line();
        }
        let mut input = String::new();
        let read = stdin
            .read_line(&mut input)
            .context("failed to read answer from stdin")?;
        Ok((read > 0).then_some(input))
    }
}

fn read_hidden_line() -> Result<Option<String>> {
    enable_raw_mode().context("failed to switch terminal to raw mode")?;
    let result = read_hidden_keys();
    disable_raw_mode().context("failed to restore terminal mode")?;
    eprintln!();
    result
}

fn read_hidden_keys() -> Result<Option<String>> {
    let mut input = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Enter => return Ok(Some(input)),
            KeyCode::Char('c') if ctrl => bail!("cancelled"),
            KeyCode::Char('d') if ctrl => return Ok(None),
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(ch) if !ctrl => input.push(ch),
            _ => {}
        }
    }
}

fn init_logging(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

struct BarProgress {
    mode: RunMode,
    bar: Option<ProgressBar>,
}

impl BarProgress {
    fn new(mode: RunMode) -> Self {
        Self { mode, bar: None }
    }
}

impl BatchProgress for BarProgress {
    fn start(&mut self, kind: ItemKind, total: usize) {
        let verb = if self.mode.is_dry_run() {
            "Analyzing"
        } else {
            "Processing"
        };
        println!();
        println!("Found {total} {}.", kind.plural());

        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{prefix:<17} |{bar:40}| {percent}% | {pos}/{len} | {eta}",
        ) {
            bar.set_style(style.progress_chars("\u{2588}\u{2591}"));
        }
        bar.set_prefix(format!("{verb} {}", title_case(kind.plural())));
        self.bar = Some(bar);
    }

    fn advance(&mut self, _result: &ItemResult) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn finish(&mut self, _kind: ItemKind, _stats: &ProcessingStats) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

fn print_report(report: &MigrationReport, log_path: &Path) {
    println!();
    println!(
        "Project: {} ({}, id {})",
        report.project.name, report.project.key, report.project.id
    );

    for batch in &report.batches {
        match report.mode {
            RunMode::DryRun => print_dry_run_batch(batch),
            RunMode::Execute => print_execute_batch(batch),
        }
        print_failures(batch);
    }

    let totals = report.totals();
    println!();
    match report.mode {
        RunMode::DryRun => {
            println!("DRY-RUN SUMMARY");
            println!("{}", "=".repeat(50));
            println!("Total items analyzed: {}", totals.total);
            println!("Items needing header fixes: {}", totals.updated);
            println!("Analysis errors: {}", totals.errors);
            println!("API requests: {}", report.request_count);
            println!();
            println!("To apply these changes, run again with --execute (or answer \"n\" to dry-run).");
        }
        RunMode::Execute => {
            println!("Migration completed!");
            println!(
                "Summary: {} items updated, {} errors ({} analyzed, {} API requests)",
                totals.updated, totals.errors, totals.total, report.request_count
            );
        }
    }
    println!("Check {} for detailed logs", log_path.display());
}

fn print_dry_run_batch(batch: &BatchReport) {
    let label = title_case(batch.kind.plural());
    println!();
    if batch.stats.total == 0 {
        println!("No {} found in the project", batch.kind.plural());
        return;
    }
    let pending = batch.pending().collect::<Vec<_>>();
    if pending.is_empty() {
        println!("No {} require header fixes!", batch.kind.plural());
        return;
    }

    println!("{label} requiring header fixes ({}):", pending.len());
    println!("{}", "-".repeat(80));
    for (index, item) in pending.iter().enumerate() {
        match batch.kind {
            ItemKind::Issue => println!("{}. {}: {}", index + 1, item.display_key, item.title),
            ItemKind::Wiki => println!("{}. {}", index + 1, item.display_key),
        }
        if let Some(count) = item.outcome.change_count() {
            println!("   {count} header(s) need fixing");
        }
    }
}

fn print_execute_batch(batch: &BatchReport) {
    println!();
    println!(
        "{} processed: {}, Updated: {}, Errors: {}",
        title_case(batch.kind.plural()),
        batch.stats.total,
        batch.stats.updated,
        batch.stats.errors
    );
}

fn print_failures(batch: &BatchReport) {
    let failures = batch.failures().collect::<Vec<_>>();
    if failures.is_empty() {
        return;
    }
    println!("{} failed:", failures.len());
    for item in failures {
        if let ItemOutcome::Failed { error } = &item.outcome {
            println!("  - {}: {error}", item.display_key);
        }
    }
}

fn run_check(args: CheckArgs) -> Result<()> {
    let stdout = io::stdout();
    check_markdown(&args, &mut io::stdin().lock(), &mut stdout.lock())
}

/// Reports (and with `--write`, applies) header fixes for one file or stdin.
fn check_markdown(args: &CheckArgs, stdin: &mut impl Read, out: &mut impl Write) -> Result<()> {
    let from_stdin = args.path.as_os_str() == "-";
    if from_stdin && args.write {
        bail!("--write cannot be used when reading from stdin");
    }

    let original = if from_stdin {
        let mut buffer = String::new();
        stdin
            .read_to_string(&mut buffer)
            .context("failed to read stdin")?;
        buffer
    } else {
        fs::read_to_string(&args.path)
            .with_context(|| format!("failed to read {}", args.path.display()))?
    };
    let display_name = if from_stdin {
        "<stdin>".to_string()
    } else {
        normalize_path(&args.path)
    };

    writeln!(out, "file: {display_name}")?;
    if !has_unspaced_headers(&original) {
        writeln!(out, "headers_to_fix: 0")?;
        return Ok(());
    }

    let result = normalize_headers(&original);
    writeln!(out, "headers_to_fix: {}", result.change_count)?;
    let diff = TextDiff::from_lines(original.as_str(), result.content.as_str());
    write!(
        out,
        "{}",
        diff.unified_diff()
            .context_radius(1)
            .header(&display_name, &display_name)
    )?;

    if args.write {
        fs::write(&args.path, &result.content)
            .with_context(|| format!("failed to write {}", args.path.display()))?;
        writeln!(out, "wrote: {display_name}")?;
    } else if args.fail_on_change {
        bail!(
            "{} header(s) need fixing in {display_name}",
            result.change_count
        );
    }
    Ok(())
}

fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
