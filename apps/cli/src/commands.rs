//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use learnline_core::{
    KnowledgeStateTracker, Lexicon, Pipeline, ProgressReporter, Services, engagement,
    validate_interaction,
};
use learnline_discovery::{ChatAnsweringClient, CitationSearch, PageFetcher};
use learnline_extract::HtmlExtractor;
use learnline_shared::{
    AppConfig, Interaction, InteractionKind, LineId, ProgressEvent, RunOutcome, init_config,
    load_config, validate_api_key,
};
use learnline_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Learnline: recommendations that follow how you learn.
#[derive(Parser)]
#[command(
    name = "learnline",
    version,
    about = "Ask questions, and get reading recommendations shaped by your learning moment.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Ask a question and get recommendations.
    Ask {
        /// User identifier.
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        /// The question.
        query: String,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Record an interaction with recommended content.
    Interact {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        /// Content id from a recommendation.
        #[arg(long)]
        content_id: String,

        /// Interaction type.
        #[arg(long = "type", value_enum)]
        kind: InteractionType,

        /// Section read (read-start).
        #[arg(long)]
        section: Option<String>,

        /// Seconds spent reading (read-end).
        #[arg(long, default_value_t = 0)]
        seconds: u64,

        /// The page was read to the end (read-end).
        #[arg(long)]
        completed: bool,

        /// Highlighted text, reference text, or follow-up question.
        #[arg(long)]
        text: Option<String>,

        /// Text around a highlight.
        #[arg(long)]
        context: Option<String>,

        /// Clicked reference URL (click-reference).
        #[arg(long)]
        url: Option<String>,

        /// Reading progress in [0, 1] (progress-update).
        #[arg(long)]
        progress: Option<f64>,
    },

    /// List query lines.
    Lines {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        /// Include closed lines.
        #[arg(long)]
        all: bool,
    },

    /// Show demonstrated and exposed concepts.
    Knowledge {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        /// Only concepts related to this topic.
        #[arg(long)]
        topic: Option<String>,
    },

    /// Summarize how a user engaged with one piece of content.
    Engagement {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        #[arg(long)]
        content_id: String,
    },

    /// Show recent recommendation runs.
    History {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Stop a line from being continued.
    CloseLine {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        /// Line id.
        #[arg(long)]
        line: String,
    },

    /// Reset how well a concept is understood.
    Forget {
        #[arg(short, long, env = "LEARNLINE_USER")]
        user: String,

        #[arg(long)]
        concept: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum InteractionType {
    ReadStart,
    ReadEnd,
    Highlight,
    ClickReference,
    ProgressUpdate,
    FollowUpQuery,
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
        0 => "learnline=info",
        1 => "learnline=debug",
        _ => "learnline=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

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
    match cli.command {
        Command::Ask { user, query, json } => cmd_ask(&user, &query, json).await,
        Command::Interact {
            user,
            content_id,
            kind,
            section,
            seconds,
            completed,
            text,
            context,
            url,
            progress,
        } => {
            let kind = match kind {
                InteractionType::ReadStart => InteractionKind::ReadStart { section },
                InteractionType::ReadEnd => InteractionKind::ReadEnd {
                    read_duration_seconds: seconds,
                    completed,
                },
                InteractionType::Highlight => InteractionKind::Highlight {
                    highlighted_text: text.ok_or_else(|| eyre!("--text is required"))?,
                    surrounding_context: context,
                },
                InteractionType::ClickReference => InteractionKind::ClickReference {
                    reference_url: url.ok_or_else(|| eyre!("--url is required"))?,
                    reference_text: text.unwrap_or_default(),
                },
                InteractionType::ProgressUpdate => InteractionKind::ProgressUpdate {
                    progress: progress.ok_or_else(|| eyre!("--progress is required"))?,
                },
                InteractionType::FollowUpQuery => InteractionKind::FollowUpQuery {
                    query: text.ok_or_else(|| eyre!("--text is required"))?,
                },
            };
            cmd_interact(Interaction {
                user_id: user,
                content_id,
                kind,
                timestamp: Utc::now(),
            })
            .await
        }
        Command::Lines { user, all } => cmd_lines(&user, all).await,
        Command::Knowledge { user, topic } => cmd_knowledge(&user, topic.as_deref()).await,
        Command::Engagement { user, content_id } => cmd_engagement(&user, &content_id).await,
        Command::History { user, limit } => cmd_history(&user, limit).await,
        Command::CloseLine { user, line } => cmd_close_line(&user, &line).await,
        Command::Forget { user, concept } => cmd_forget(&user, &concept).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = config.storage.resolved_db_path()?;
    Ok(Storage::open(&path).await?)
}

/// Read-only handle, or `None` when nothing has been stored yet.
async fn open_storage_readonly(config: &AppConfig) -> Result<Option<Storage>> {
    let path: PathBuf = config.storage.resolved_db_path()?;
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Storage::open_readonly(&path).await?))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ask(user: &str, query: &str, json: bool) -> Result<()> {
    let config = load_config()?;
    let api_key = validate_api_key(&config)?;

    let answering = Arc::new(ChatAnsweringClient::new(&config.answering, api_key)?);
    let fetcher = PageFetcher::new(&config.discovery)?;
    let services = Services {
        answering: answering.clone(),
        search: Arc::new(CitationSearch::new(answering, fetcher, &config.discovery)),
        extractor: Arc::new(HtmlExtractor::new()),
    };
    let storage = open_storage(&config).await?;
    let pipeline = Pipeline::new(config, storage, services)?;

    info!(user, "asking");
    let reporter = CliProgress::new();
    let outcome = pipeline.run(user, query, &reporter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!();
    match &outcome {
        RunOutcome::RecommendationsReady(result) => {
            print_moment(result.moment.as_ref());
            println!("  Line:   {}", result.line_id);
            println!("  Goal:   {}", result.line_analysis.inferred_goal);
            println!("  Focus:  {}", result.line_analysis.current_focus);
            println!();
            for (i, rec) in result.recommendations.iter().enumerate() {
                println!(
                    "  {}. {} [{:.2}]",
                    i + 1,
                    rec.title.as_deref().unwrap_or(&rec.url),
                    rec.value_score
                );
                println!("     {}", rec.url);
                println!("     {}", rec.explanation);
                println!("     id: {}", rec.content_id);
            }
            print_suggestions(&result.suggestions);
        }
        RunOutcome::Exhausted(report) => {
            print_moment(report.moment.as_ref());
            println!("  Line:   {}", report.line_id);
            println!();
            println!(
                "  Nothing suitable found after {} attempt(s).",
                report.failures.len()
            );
            for reason in report.reasons() {
                println!("    - {}", reason.describe());
            }
            print_suggestions(&report.suggestions);
        }
    }
    println!();
    Ok(())
}

fn print_moment(moment: Option<&learnline_shared::LearningMoment>) {
    match moment {
        Some(m) => {
            println!("  Moment: {} ({:.2})", m.kind, m.confidence);
            println!("          {}", m.reasoning);
        }
        None => println!("  Moment: none"),
    }
}

fn print_suggestions(suggestions: &learnline_shared::Suggestions) {
    for (label, list) in [
        ("Next", &suggestions.immediate),
        ("Broader", &suggestions.broader),
        ("Deeper", &suggestions.deeper),
    ] {
        if list.is_empty() {
            continue;
        }
        println!();
        println!("  {label}:");
        for s in list {
            println!("    - {s}");
        }
    }
}

async fn cmd_interact(interaction: Interaction) -> Result<()> {
    validate_interaction(&interaction)?;
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    storage.ensure_user(&interaction.user_id).await?;
    let id = storage.insert_interaction(&interaction).await?;
    info!(%id, kind = interaction.kind.name(), "interaction recorded");
    println!("Recorded {} on {}", interaction.kind.name(), interaction.content_id);
    Ok(())
}

async fn cmd_lines(user: &str, all: bool) -> Result<()> {
    let config = load_config()?;
    let Some(storage) = open_storage_readonly(&config).await? else {
        println!("No lines yet.");
        return Ok(());
    };
    let lines = storage
        .list_lines(user, config.pipeline.recent_lines_limit, all)
        .await?;
    if lines.is_empty() {
        println!("No lines yet.");
        return Ok(());
    }
    for line in lines {
        println!(
            "{} {}{}",
            line.id,
            line.inferred_goal,
            if line.active { "" } else { " (closed)" }
        );
        println!("    {}", line.learning_progression);
        if !line.learning_path.knowledge_gaps.is_empty() {
            println!("    gaps: {}", line.learning_path.knowledge_gaps.join(", "));
        }
    }
    Ok(())
}

async fn cmd_knowledge(user: &str, topic: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let Some(storage) = open_storage_readonly(&config).await? else {
        println!("Nothing known yet.");
        return Ok(());
    };
    let state = storage.load_knowledge(user).await?;
    let tracker = KnowledgeStateTracker::new(Arc::new(Lexicon::with_entries(&config.entities)));
    let view = tracker.snapshot(&state, topic.unwrap_or(""));

    println!("Knowledge v{} for {user}", state.version);
    println!();
    println!("  Demonstrated:");
    for (concept, record) in &view.demonstrated {
        println!("    {concept} ({:.2})", record.demonstration_level);
        for evidence in record.evidence.iter().take(3) {
            println!("      - {evidence}");
        }
    }
    println!();
    println!("  Exposed only:");
    for concept in view.exposed.keys() {
        println!("    {concept}");
    }
    Ok(())
}

async fn cmd_engagement(user: &str, content_id: &str) -> Result<()> {
    let config = load_config()?;
    let Some(storage) = open_storage_readonly(&config).await? else {
        return Err(eyre!("no interactions recorded yet"));
    };
    let interactions = storage.list_content_interactions(user, content_id).await?;
    let summary = engagement(content_id, &interactions);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_history(user: &str, limit: usize) -> Result<()> {
    let config = load_config()?;
    let Some(storage) = open_storage_readonly(&config).await? else {
        println!("No runs yet.");
        return Ok(());
    };
    for run in storage.list_runs(user, limit).await? {
        let summary = match &run.outcome {
            RunOutcome::RecommendationsReady(r) => {
                format!("{} recommendation(s)", r.recommendations.len())
            }
            RunOutcome::Exhausted(r) => format!("exhausted after {} attempt(s)", r.failures.len()),
        };
        println!(
            "{}  {}  \"{}\"  {summary}",
            run.created_at.format("%Y-%m-%d %H:%M"),
            run.id,
            run.query
        );
    }
    Ok(())
}

async fn cmd_close_line(user: &str, line: &str) -> Result<()> {
    let line_id: LineId = line
        .parse()
        .map_err(|e| eyre!("invalid line id '{line}': {e}"))?;
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    if !storage.set_line_active(user, &line_id, false).await? {
        return Err(eyre!("no line {line} for user {user}"));
    }
    println!("Closed line {line_id}");
    Ok(())
}

async fn cmd_forget(user: &str, concept: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let mut state = storage.load_knowledge(user).await?;
    let base_version = state.version;
    let key = concept.trim().to_lowercase();
    if !state.reset_concept(&key) {
        return Err(eyre!("{user} has no record of '{concept}'"));
    }
    storage.save_knowledge(&state, base_version).await?;
    println!("Reset {key}");
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

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Step { step, detail } => {
                let message = match detail {
                    Some(detail) => format!("{step}: {detail}"),
                    None => step.to_string(),
                };
                self.spinner.set_message(message);
            }
            _ => self.spinner.finish_and_clear(),
        }
    }
}
