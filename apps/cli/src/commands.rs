//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use coursesmith_backend::{OpenAiAssistants, OpenAiOptions};
use coursesmith_core::pipeline::{DiscoveryOptions, LessonRef, Pipeline, PipelineRun, Stage};
use coursesmith_core::{
    Answer, ProgressReporter, claim_run, database_path, export_markdown, load_latest, load_run,
    prompts, save_and_release, save_run, write_export,
};
use coursesmith_ingest::IngestOptions;
use coursesmith_shared::{
    AppConfig, ErrorKind, GenerationProfile, GenerationSettings, IntakeForm, RunId, init_config,
    load_config, resolve_api_key,
};
use coursesmith_storage::Storage;

use crate::render;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// coursesmith: generate a course outline step by step with a language model.
#[derive(Parser)]
#[command(
    name = "coursesmith",
    version,
    about = "Generate a course (overview, sections, lessons, content and quizzes) one reviewed stage at a time.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Run to act on (defaults to the most recently updated run).
    #[arg(long, global = true)]
    pub run: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start a run from an intake file and generate the course overview.
    New {
        /// Intake form (TOML).
        #[arg(short, long)]
        input: PathBuf,

        /// Reference document (repeatable).
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Output profile: strict-structure or freeform-markdown.
        #[arg(short, long)]
        profile: Option<GenerationProfile>,

        /// Skip building a searchable document index from the files.
        #[arg(long)]
        no_index: bool,
    },

    /// Show the run's current stage and output.
    Show {
        /// Print the full run snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Produce the current stage's output if it is missing.
    Generate {
        /// Skip building a document index when structure discovery is retried.
        #[arg(long)]
        no_index: bool,
    },

    /// Accept the current stage's output and advance.
    Confirm,

    /// Replace the current stage's output.
    Regenerate,

    /// Step back one stage, discarding the output of the stage being left.
    Revert,

    /// Clear the run and return it to intake.
    Reset,

    /// Write (or show) the full content of a lesson.
    Lesson {
        /// Lesson position as SECTION.LESSON, e.g. 2.1.
        lesson: LessonRef,

        /// Extra instruction for the writer.
        #[arg(long)]
        instruction: Option<String>,

        /// Replace existing content.
        #[arg(long)]
        regenerate: bool,
    },

    /// Write (or show) the quiz for a lesson.
    Quiz {
        /// Lesson position as SECTION.LESSON.
        lesson: LessonRef,

        /// Replace the existing quiz.
        #[arg(long)]
        regenerate: bool,

        /// Clear all answers (no model call needed).
        #[arg(long, conflicts_with = "regenerate")]
        reset: bool,
    },

    /// Answer one quiz question.
    Answer {
        /// Lesson position as SECTION.LESSON.
        lesson: LessonRef,

        /// Question number (1-based).
        #[arg(short, long)]
        question: usize,

        /// Option number (1-based) or true/false.
        #[arg(short, long)]
        choice: String,
    },

    /// Export the course as Markdown.
    Export {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List saved runs.
    List,

    /// Delete a saved run (requires --run).
    Delete,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "coursesmith=info",
        1 => "coursesmith=debug",
        _ => "coursesmith=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let run = cli.run.as_deref();
    match cli.command {
        Command::New {
            input,
            files,
            profile,
            no_index,
        } => cmd_new(run, &input, files, profile, no_index).await,
        Command::Show { json } => cmd_show(run, json).await,
        Command::Generate { no_index } => cmd_generate(run, no_index).await,
        Command::Confirm => cmd_confirm(run).await,
        Command::Regenerate => cmd_regenerate(run).await,
        Command::Revert => cmd_revert(run).await,
        Command::Reset => cmd_reset(run).await,
        Command::Lesson {
            lesson,
            instruction,
            regenerate,
        } => cmd_lesson(run, lesson, instruction.as_deref(), regenerate).await,
        Command::Quiz {
            lesson,
            regenerate,
            reset,
        } => cmd_quiz(run, lesson, regenerate, reset).await,
        Command::Answer {
            lesson,
            question,
            choice,
        } => cmd_answer(run, lesson, question, &choice).await,
        Command::Export { out } => cmd_export(run, out).await,
        Command::List => cmd_list().await,
        Command::Delete => cmd_delete(run).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Workspace: config + storage + pipeline for one invocation
// ---------------------------------------------------------------------------

struct Workspace {
    config: AppConfig,
    storage: Storage,
    pipeline: Arc<Pipeline>,
}

impl Workspace {
    /// Open the run database, claim the selected run and resume it.
    async fn open(run: Option<&str>) -> Result<Self> {
        let config = load_config()?;
        let backend = connect(&config)?;
        let storage = open_storage(&config).await?;
        let settings = GenerationSettings::from(&config);
        let snapshot = claim(&storage, run, &settings).await?;
        Ok(Self::assemble(config, storage, snapshot, settings, backend))
    }

    /// Wrap an already claimed run.
    fn assemble(
        config: AppConfig,
        storage: Storage,
        run: PipelineRun,
        settings: GenerationSettings,
        backend: Arc<OpenAiAssistants>,
    ) -> Self {
        let pipeline = Arc::new(
            Pipeline::resume(run, backend.clone(), settings)
                .with_index(backend)
                .with_progress(Arc::new(CliProgress::new())),
        );
        watch_ctrl_c(pipeline.clone());

        Self {
            config,
            storage,
            pipeline,
        }
    }

    fn discovery_options(&self, no_index: bool) -> DiscoveryOptions {
        DiscoveryOptions {
            ingest: IngestOptions::from(&self.config.ingest),
            build_index: !no_index,
        }
    }

    /// Persist and release the run, then surface the action's outcome.
    /// Called once, after the invocation's last action.
    async fn commit<T>(&self, outcome: coursesmith_shared::Result<T>) -> Result<T> {
        finish(&self.storage, &self.pipeline.snapshot(), outcome).await
    }
}

/// Model client for the configured account.
fn connect(config: &AppConfig) -> Result<Arc<OpenAiAssistants>> {
    let api_key = resolve_api_key(config)?;
    let options = OpenAiOptions::new(api_key, &config.openai)
        .with_instructions(prompts::ASSISTANT_INSTRUCTIONS);
    Ok(Arc::new(OpenAiAssistants::new(options)?))
}

/// Lease holder name for this process.
fn lease_holder() -> String {
    format!("coursesmith pid {}", std::process::id())
}

/// Age after which a lease counts as abandoned: comfortably longer than one
/// invocation's model waits.
fn lease_stale_after(settings: &GenerationSettings) -> Duration {
    let index_wait = settings
        .poll_interval
        .saturating_mul(settings.index_max_polls);
    settings
        .stage_timeout
        .map_or(Duration::from_secs(3600), |t| t.saturating_mul(3))
        .saturating_add(index_wait)
}

/// Claim the selected run for this process and load its latest snapshot.
async fn claim(
    storage: &Storage,
    run: Option<&str>,
    settings: &GenerationSettings,
) -> Result<PipelineRun> {
    let selected = select_run(storage, run).await?;
    Ok(claim_run(
        storage,
        selected.id,
        &lease_holder(),
        lease_stale_after(settings),
    )
    .await?)
}

/// Save and release a claimed run, then surface the action's outcome.
async fn finish<T>(
    storage: &Storage,
    run: &PipelineRun,
    outcome: coursesmith_shared::Result<T>,
) -> Result<T> {
    save_and_release(storage, run, &lease_holder()).await?;
    if let Err(e) = &outcome {
        warn!(kind = ?e.kind(), "step failed");
        if matches!(e.kind(), ErrorKind::Backend | ErrorKind::Normalization) {
            eprintln!("The run was left as it was before this step; run the command again to retry.");
        }
    }
    Ok(outcome?)
}

/// Apply an action that needs no model call to the claimed run and save it.
/// Works without an API key.
async fn with_offline_run<T>(
    run: Option<&str>,
    action: impl FnOnce(&mut PipelineRun) -> coursesmith_shared::Result<T>,
) -> Result<(PipelineRun, T)> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let settings = GenerationSettings::from(&config);
    let mut snapshot = claim(&storage, run, &settings).await?;
    let outcome = action(&mut snapshot);
    let value = finish(&storage, &snapshot, outcome).await?;
    Ok((snapshot, value))
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = database_path(config)?;
    Ok(Storage::open(&path).await?)
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Storage> {
    let path = database_path(config)?;
    Ok(Storage::open_readonly(&path).await?)
}

async fn select_run(storage: &Storage, run: Option<&str>) -> Result<PipelineRun> {
    match run {
        Some(id) => {
            let id: RunId = id
                .parse()
                .map_err(|e| eyre!("invalid run id '{id}': {e}"))?;
            Ok(load_run(storage, id).await?)
        }
        None => Ok(load_latest(storage).await?),
    }
}

/// Ctrl-C stops waiting on the in-flight step; the run is saved as it was.
fn watch_ctrl_c(pipeline: Arc<Pipeline>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling the current step");
            pipeline.cancel();
        }
    });
}

/// Run structure discovery if the run is still there, then fill in the
/// current stage's output.
async fn discover_and_generate(ws: &Workspace, no_index: bool) -> coursesmith_shared::Result<()> {
    if ws.pipeline.stage() == Stage::StructureDiscovery {
        ws.pipeline
            .discover_structure(&ws.discovery_options(no_index))
            .await?;
    }
    ws.pipeline.generate().await
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_new(
    run: Option<&str>,
    input: &Path,
    files: Vec<PathBuf>,
    profile: Option<GenerationProfile>,
    no_index: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read intake file '{}': {e}", input.display()))?;
    let form: IntakeForm = toml::from_str(&content)
        .map_err(|e| eyre!("invalid intake file '{}': {e}", input.display()))?;

    let config = load_config()?;
    let backend = connect(&config)?;
    let storage = open_storage(&config).await?;
    let mut settings = GenerationSettings::from(&config);
    if let Some(profile) = profile {
        settings.profile = profile;
    }

    // `--run` reuses a run that was reset back to intake.
    let snapshot = match run {
        Some(_) => {
            let mut existing = claim(&storage, run, &settings).await?;
            if existing.stage != Stage::Intake {
                save_and_release(&storage, &existing, &lease_holder()).await?;
                return Err(eyre!(
                    "run {} is in stage {}; reset it before starting over",
                    existing.id,
                    existing.stage
                ));
            }
            existing.profile = settings.profile;
            existing
        }
        None => {
            let fresh = PipelineRun::new(settings.profile);
            save_run(&storage, &fresh).await?;
            claim_run(&storage, fresh.id, &lease_holder(), lease_stale_after(&settings)).await?
        }
    };

    let ws = Workspace::assemble(config, storage, snapshot, settings, backend);
    info!(run_id = %ws.pipeline.id(), files = files.len(), "starting run");

    let outcome = match ws.pipeline.submit_intake(&form, files) {
        Ok(()) => discover_and_generate(&ws, no_index).await,
        Err(e) => Err(e),
    };
    ws.commit(outcome).await?;

    render::show(&ws.pipeline.snapshot());
    Ok(())
}

async fn cmd_show(run: Option<&str>, json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let snapshot = select_run(&storage, run).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        render::show(&snapshot);
    }
    Ok(())
}

async fn cmd_generate(run: Option<&str>, no_index: bool) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = discover_and_generate(&ws, no_index).await;
    ws.commit(outcome).await?;
    render::show(&ws.pipeline.snapshot());
    Ok(())
}

async fn cmd_confirm(run: Option<&str>) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = ws.pipeline.confirm().await;
    let stage = ws.commit(outcome).await?;
    info!(%stage, "confirmed");
    render::show(&ws.pipeline.snapshot());
    Ok(())
}

async fn cmd_regenerate(run: Option<&str>) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = ws.pipeline.regenerate().await;
    ws.commit(outcome).await?;
    render::show(&ws.pipeline.snapshot());
    Ok(())
}

async fn cmd_revert(run: Option<&str>) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = ws.pipeline.revert();
    ws.commit(outcome).await?;
    render::show(&ws.pipeline.snapshot());
    Ok(())
}

async fn cmd_reset(run: Option<&str>) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = ws.pipeline.reset().await;
    ws.commit(outcome).await?;
    println!(
        "Run {} reset. Start it again with `coursesmith new --run {} --input <FILE>`.",
        ws.pipeline.id(),
        ws.pipeline.id()
    );
    Ok(())
}

async fn cmd_lesson(
    run: Option<&str>,
    lesson: LessonRef,
    instruction: Option<&str>,
    regenerate: bool,
) -> Result<()> {
    let ws = Workspace::open(run).await?;
    let outcome = ws
        .pipeline
        .generate_lesson_detail(lesson, instruction, regenerate)
        .await;
    let detail = ws.commit(outcome).await?;

    let snapshot = ws.pipeline.snapshot();
    let (_, outline) = snapshot.lesson(lesson)?;
    render::lesson_detail(lesson, outline, &detail);
    Ok(())
}

async fn cmd_quiz(run: Option<&str>, lesson: LessonRef, regenerate: bool, reset: bool) -> Result<()> {
    if reset {
        let (_, quiz) = with_offline_run(run, |r| r.reset_quiz(lesson).cloned()).await?;
        render::quiz(lesson, &quiz);
        return Ok(());
    }

    let ws = Workspace::open(run).await?;
    let outcome = ws.pipeline.generate_quiz(lesson, regenerate).await;
    let quiz = ws.commit(outcome).await?;
    render::quiz(lesson, &quiz);
    Ok(())
}

async fn cmd_answer(run: Option<&str>, lesson: LessonRef, question: usize, choice: &str) -> Result<()> {
    if question == 0 {
        return Err(eyre!("question numbers start at 1"));
    }
    let answer = parse_answer(choice)?;

    let (snapshot, (state, progress)) =
        with_offline_run(run, |r| r.answer_quiz(lesson, question - 1, answer)).await?;

    let (_, outline) = snapshot.lesson(lesson)?;
    let explanation = snapshot
        .artifact
        .quiz_for_lesson(outline.id)
        .and_then(|q| q.questions.get(question - 1))
        .and_then(|q| q.explanation().map(str::to_string));
    render::answer(state, explanation.as_deref(), progress);
    Ok(())
}

/// `true`/`false`, or a 1-based option number.
fn parse_answer(choice: &str) -> Result<Answer> {
    match choice.trim().to_ascii_lowercase().as_str() {
        "true" | "t" => Ok(Answer::TrueFalse(true)),
        "false" | "f" => Ok(Answer::TrueFalse(false)),
        other => match other.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Answer::Choice(n - 1)),
            _ => Err(eyre!(
                "invalid choice '{choice}': expected an option number or true/false"
            )),
        },
    }
}

async fn cmd_export(run: Option<&str>, out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let snapshot = select_run(&storage, run).await?;
    let markdown = export_markdown(&snapshot);

    match out {
        Some(path) => {
            write_export(&path, &markdown)?;
            println!("Course exported to {}", path.display());
        }
        None => print!("{markdown}"),
    }
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let runs = storage.list_runs().await?;
    info!(count = runs.len(), "listing runs");
    render::run_list(&runs);
    Ok(())
}

async fn cmd_delete(run: Option<&str>) -> Result<()> {
    let id = run.ok_or_else(|| eyre!("delete needs an explicit --run <ID>"))?;
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let settings = GenerationSettings::from(&config);
    let snapshot = claim(&storage, Some(id), &settings).await?;
    storage.delete_run(&snapshot.id.to_string()).await?;
    println!("Run {} deleted.", snapshot.id);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter: one spinner per model interaction.
struct CliProgress {
    spinner: Mutex<Option<ProgressBar>>,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        self.spinner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.set_message(name.to_string());
        spinner.enable_steady_tick(Duration::from_millis(80));
        if let Some(previous) = self.slot().replace(spinner) {
            previous.finish_and_clear();
        }
    }

    fn done(&self, name: &str, ok: bool) {
        if let Some(spinner) = self.slot().take() {
            spinner.finish_and_clear();
        }
        eprintln!("{} {name}", if ok { "✓" } else { "✗" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_parse() {
        assert_eq!(parse_answer("2").unwrap(), Answer::Choice(1));
        assert_eq!(parse_answer("True").unwrap(), Answer::TrueFalse(true));
        assert_eq!(parse_answer("f").unwrap(), Answer::TrueFalse(false));
        assert!(parse_answer("0").is_err());
        assert!(parse_answer("maybe").is_err());
    }

    #[test]
    fn cli_parses_lesson_commands() {
        let cli = Cli::try_parse_from([
            "coursesmith",
            "answer",
            "2.1",
            "--question",
            "3",
            "--choice",
            "true",
        ])
        .unwrap();
        match cli.command {
            Command::Answer {
                lesson, question, ..
            } => {
                assert_eq!(lesson, LessonRef { section: 1, lesson: 0 });
                assert_eq!(question, 3);
            }
            _ => panic!("expected answer command"),
        }

        assert!(Cli::try_parse_from(["coursesmith", "lesson", "x"]).is_err());
    }

    #[test]
    fn cli_parses_new_with_profile() {
        let cli = Cli::try_parse_from([
            "coursesmith",
            "new",
            "--input",
            "intake.toml",
            "--file",
            "a.md",
            "--file",
            "b.html",
            "--profile",
            "freeform",
            "--no-index",
        ])
        .unwrap();
        match cli.command {
            Command::New {
                files,
                profile,
                no_index,
                ..
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(profile, Some(GenerationProfile::FreeformMarkdown));
                assert!(no_index);
            }
            _ => panic!("expected new command"),
        }
    }

    #[test]
    fn lease_outlives_the_longest_wait() {
        let mut settings = GenerationSettings::default();
        settings.stage_timeout = Some(Duration::from_secs(600));
        settings.poll_interval = Duration::from_secs(2);
        settings.index_max_polls = 30;
        assert_eq!(lease_stale_after(&settings), Duration::from_secs(1860));

        settings.stage_timeout = None;
        assert_eq!(lease_stale_after(&settings), Duration::from_secs(3660));
    }
}
