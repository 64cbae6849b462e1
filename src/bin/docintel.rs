//! CLI binary for edgequake-docintel.
//!
//! A thin shim over the library crate: maps flags to `AnalysisConfig`,
//! analyses each input, optionally runs Q&A, and exports the result.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_docintel::{
    export, process_document_with_cancel, write_atomic, AnalysisConfig,
    AnalysisProgressCallback, CancellationToken, ConversationManager, ConversationSession,
    ExportBundle, ExportFormat, ProcessedDocument, ProgressCallback, QaTurn, Stage, StageStatus,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over every stage of every input. Stage events arrive out of
/// order when several documents run concurrently.
struct CliProgressCallback {
    bar: ProgressBar,
    degraded: AtomicUsize,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new(documents: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} stages  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new((documents * Stage::ALL.len()) as u64);
        bar.set_style(style);
        bar.set_prefix("Analysing");
        bar.set_message("extracting…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            degraded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        let degraded = self.degraded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        if degraded + failed == 0 {
            eprintln!("{} all stages accepted", green("✔"));
        } else {
            eprintln!(
                "{} {} degraded, {} failed stage(s)",
                yellow("⚠"),
                bold(&degraded.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_message(stage.to_string());
    }

    fn on_stage_retry(&self, stage: Stage, attempt: u32, reason: &str) {
        self.bar.println(format!(
            "  {} {:<15} attempt {} {}",
            dim("↻"),
            stage.to_string(),
            attempt,
            dim(reason)
        ));
    }

    fn on_stage_complete(&self, stage: Stage, status: StageStatus, confidence: f32) {
        let mark = match status {
            StageStatus::Accepted => green("✓"),
            StageStatus::Degraded => {
                self.degraded.fetch_add(1, Ordering::SeqCst);
                yellow("~")
            }
            StageStatus::Failed => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                red("✗")
            }
        };
        self.bar.println(format!(
            "  {} {:<15} {:<9} {}",
            mark,
            stage.to_string(),
            status.to_string(),
            dim(&format!("{:.0}%", confidence * 100.0))
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse an invoice, JSON to stdout
  docintel invoice.pdf

  # Plain-text report written to a file
  docintel --format text contract.pdf -o contract-report.txt

  # Ask questions; answers are included in the export
  docintel invoice.pdf --ask "What is the total?" --ask "When is it due?"

  # Interactive Q&A after analysis (one document only)
  docintel --interactive scan.png

  # Several documents, two at a time, Markdown into a directory
  docintel -c 2 --format markdown a.pdf b.pdf c.png -o reports/

  # Stricter entity stage, no fallback retries
  docintel --threshold entities=0.8 --max-retries 0 invoice.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID

  Variables can also be placed in a .env file in the working directory.
"#;

/// Analyse documents with confidence-scored LLM stages and grounded Q&A.
#[derive(Parser, Debug)]
#[command(
    name = "docintel",
    version,
    about = "Analyse PDFs and scanned images: classification, entities, summary, risk, Q&A",
    long_about = "Extract text from PDFs (text layer) or images (vision model), then run \
classification, entity extraction, summarisation and risk assessment. Every stage is \
validated and falls back to simpler strategies instead of failing the run.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file paths or HTTP/HTTPS URLs (pdf, png, jpg, tiff, bmp).
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output file (single input) or directory (several inputs). Default: stdout.
    #[arg(short, long, env = "DOCINTEL_OUTPUT")]
    output: Option<PathBuf>,

    /// Export format.
    #[arg(short, long, env = "DOCINTEL_FORMAT", value_enum, default_value = "json")]
    format: FormatArg,

    /// Question to ask after analysis. Repeatable.
    #[arg(long = "ask", value_name = "QUESTION")]
    questions: Vec<String>,

    /// Read questions from stdin after analysis (single input only).
    #[arg(short, long)]
    interactive: bool,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Stage threshold override, e.g. `entities=0.8`. Repeatable.
    #[arg(long = "threshold", value_name = "STAGE=VALUE", value_parser = parse_threshold)]
    thresholds: Vec<(Stage, f32)>,

    /// Fallback attempts per stage after the first.
    #[arg(long, env = "DOCINTEL_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Retries per backend call on transient errors.
    #[arg(long, env = "DOCINTEL_BACKEND_RETRIES", default_value_t = 3)]
    backend_retries: u32,

    /// Documents analysed concurrently.
    #[arg(short, long, env = "DOCINTEL_CONCURRENCY", default_value_t = 2,
          value_parser = clap::value_parser!(u64).range(1..=16))]
    concurrency: u64,

    /// Largest accepted input, in megabytes.
    #[arg(long, env = "DOCINTEL_MAX_FILE_MB", default_value_t = 50)]
    max_file_mb: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "DOCINTEL_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCINTEL_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "DOCINTEL_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCINTEL_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCINTEL_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Json,
    Text,
    Markdown,
}

impl From<FormatArg> for ExportFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Text => ExportFormat::Text,
            FormatArg::Markdown => ExportFormat::Markdown,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.interactive && cli.inputs.len() > 1 {
        anyhow::bail!("--interactive works with a single input");
    }

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = show_progress.then(|| CliProgressCallback::new(cli.inputs.len()));
    let config = build_config(
        &cli,
        progress.clone().map(|cb| cb as ProgressCallback),
    )?;

    // ── Cancellation on Ctrl-C ───────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{} cancelling after the current stage…", yellow("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Analyse ──────────────────────────────────────────────────────────
    let mut outcomes: Vec<(String, Result<ProcessedDocument, _>)> = {
        let (config, cancel) = (&config, &cancel);
        stream::iter(cli.inputs.iter().cloned())
            .map(|input| async move {
                let result = process_document_with_cancel(&input, config, cancel).await;
                (input, result)
            })
            .buffer_unordered(cli.concurrency as usize)
            .collect()
            .await
    };

    if let Some(ref cb) = progress {
        cb.finish();
    }

    let manager = if cli.questions.is_empty() && !cli.interactive {
        None
    } else {
        Some(ConversationManager::new(&config).context("Failed to set up Q&A")?)
    };

    let format: ExportFormat = cli.format.into();
    let mut failures = 0usize;

    // Keep input order in the output regardless of completion order.
    outcomes.sort_by_key(|(input, _)| cli.inputs.iter().position(|i| i == input));

    for (input, outcome) in outcomes {
        let doc = match outcome {
            Ok(doc) => doc,
            Err(e) => {
                failures += 1;
                eprintln!("{} {}: {}", red("✘"), bold(&input), e);
                continue;
            }
        };

        let history = match manager {
            Some(ref m) => run_questions(m, &doc, &cli).await?,
            None => Vec::new(),
        };

        let bundle = ExportBundle::new(&doc.name, &doc.result, &history);
        let bytes = export(&bundle, format).context("Export failed")?;

        match output_path(cli.output.as_deref(), &input, cli.inputs.len(), format) {
            Some(path) => {
                write_atomic(&path, &bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                if !cli.quiet {
                    eprintln!(
                        "{}  {}  {:.0}%  →  {}",
                        green("✔"),
                        doc.result.document_type(),
                        doc.result.overall_confidence * 100.0,
                        bold(&path.display().to_string())
                    );
                }
            }
            None => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(&bytes)
                    .context("Failed to write to stdout")?;
                if !bytes.ends_with(b"\n") {
                    handle.write_all(b"\n").ok();
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} document(s) failed", failures, cli.inputs.len());
    }
    Ok(())
}

/// Map CLI args to `AnalysisConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<AnalysisConfig> {
    let mut builder = AnalysisConfig::builder()
        .max_retries(cli.max_retries)
        .backend_retries(cli.backend_retries)
        .max_file_size_bytes(cli.max_file_mb.saturating_mul(1024 * 1024))
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout);

    for &(stage, value) in &cli.thresholds {
        builder = builder.threshold(stage, value);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--threshold stage=value`.
fn parse_threshold(s: &str) -> Result<(Stage, f32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected STAGE=VALUE, got '{s}'"))?;
    let stage = Stage::ALL
        .into_iter()
        .find(|st| st.to_string() == name.trim().to_lowercase())
        .ok_or_else(|| {
            format!("unknown stage '{name}' (classification, entities, summary, risk)")
        })?;
    let value: f32 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid threshold '{value}'"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("threshold must be within 0–1, got {value}"));
    }
    Ok((stage, value))
}

/// Resolve where one document's export goes; `None` means stdout.
fn output_path(output: Option<&Path>, input: &str, inputs: usize, format: ExportFormat) -> Option<PathBuf> {
    let output = output?;
    if inputs == 1 && !output.is_dir() {
        return Some(output.to_path_buf());
    }
    let stem = input
        .rsplit(['/', '\\'])
        .next()
        .and_then(|name| name.split('?').next())
        .map(|name| name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name))
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    Some(output.join(format!("{stem}.{}", format.extension())))
}

/// Ask the `--ask` questions, then read more from stdin with `--interactive`.
async fn run_questions(
    manager: &ConversationManager,
    doc: &ProcessedDocument,
    cli: &Cli,
) -> Result<Vec<QaTurn>> {
    let session = manager.open_session(doc);

    for question in &cli.questions {
        ask_and_print(manager, &session, question, cli.quiet).await?;
    }

    if cli.interactive {
        eprintln!(
            "{} Ask about {} (empty line or 'quit' to finish)",
            bold("?"),
            bold(&doc.name)
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("{} ", bold(">"));
            io::stderr().flush().ok();
            let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() || line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                break;
            }
            ask_and_print(manager, &session, line, false).await?;
        }
    }

    Ok(session.history().await)
}

async fn ask_and_print(
    manager: &ConversationManager,
    session: &ConversationSession,
    question: &str,
    quiet: bool,
) -> Result<()> {
    let turn = manager
        .ask(session, question)
        .await
        .with_context(|| format!("Question failed: {question}"))?;
    if !quiet {
        let mark = if turn.found { green("A:") } else { yellow("A:") };
        eprintln!("{} {}", bold("Q:"), turn.question);
        eprintln!(
            "{} {} {}",
            mark,
            turn.answer,
            dim(&format!("({:.0}%)", turn.confidence * 100.0))
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_parsing() {
        assert_eq!(parse_threshold("Entities=0.8").unwrap(), (Stage::Entities, 0.8));
        assert!(parse_threshold("entities").is_err());
        assert!(parse_threshold("layout=0.5").is_err());
        assert!(parse_threshold("risk=1.5").is_err());
    }

    #[test]
    fn output_paths() {
        assert_eq!(output_path(None, "a.pdf", 1, ExportFormat::Json), None);
        assert_eq!(
            output_path(Some(Path::new("out.txt")), "a.pdf", 1, ExportFormat::Text),
            Some(PathBuf::from("out.txt"))
        );
        assert_eq!(
            output_path(Some(Path::new("reports")), "https://x.io/docs/inv.pdf?dl=1", 2, ExportFormat::Markdown),
            Some(PathBuf::from("reports/inv.md"))
        );
    }
}
