//! epub-translate CLI - translate an EPUB while keeping its markup intact.

use anyhow::{Context, Result};
use clap::Parser;
use epub_translate::config::{Config, NodeFailurePolicy, RunOptions, Settings};
use epub_translate::console::Console;
use epub_translate::driver::{BookDriver, BookReport};
use epub_translate::oracle::OpenAiOracle;
use epub_translate::translator::{Translator, language_name};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

/// Structure-preserving EPUB translator.
#[derive(Parser, Debug)]
#[command(name = "epub-translate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input EPUB file.
    #[arg(short, long)]
    input: PathBuf,

    /// Output EPUB file.
    #[arg(short, long)]
    output: PathBuf,

    /// Source language tag (e.g. en).
    #[arg(long)]
    source: Option<String>,

    /// Target language tag (e.g. it).
    #[arg(long)]
    target: Option<String>,

    /// Model identifier passed to the API.
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature, between 0 and 1.
    #[arg(long, value_parser = parse_temperature)]
    temp: Option<f32>,

    /// Seconds to wait between content documents.
    #[arg(long, value_name = "SECONDS")]
    sleep_between_docs: Option<f64>,

    /// Number of blocks sent per request.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: Option<u32>,

    /// Translate without writing the output file.
    #[arg(long)]
    dry_run: bool,

    /// Use this config file instead of the default location.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// What to do when a single text node cannot be translated.
    #[arg(long, value_enum)]
    on_node_failure: Option<NodeFailurePolicy>,

    /// Print debug traces of the translation ladder.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            input: self.input.clone(),
            output: self.output.clone(),
            source_lang: self.source.clone(),
            target_lang: self.target.clone(),
            model: self.model.clone(),
            temperature: self.temp,
            sleep_between_docs_sec: self.sleep_between_docs,
            batch_size: self.batch_size.map(|n| n as usize),
            node_failure_policy: self.on_node_failure,
            dry_run: self.dry_run,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let console = Console::new();
    match run(&args, &console).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            console.error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, console: &Console) -> Result<()> {
    console.section("epub-translate");

    // Load configuration
    console.step("Loading configuration...");
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let api_key = std::env::var(&config.api.key_env).ok();
    let settings =
        Settings::resolve(&config, args.run_options(), api_key).context("Invalid settings")?;
    console.success("Configuration loaded");
    console.info(&format!(
        "{} -> {} with {} (batch size {})",
        language_name(&settings.source_lang),
        language_name(&settings.target_lang),
        settings.model,
        settings.batch_size
    ));
    if settings.dry_run {
        console.warning("Dry run: nothing will be written");
    }

    let oracle = OpenAiOracle::new(&settings).context("Failed to create API client")?;
    let translator = Translator::new(Box::new(oracle), &settings);

    console.step(&format!("Translating {}...", settings.input.display()));
    let started = Instant::now();
    let report = BookDriver::new(&translator, &settings).run().await?;

    print_report(console, &report, started.elapsed(), settings.dry_run);
    Ok(())
}

/// Prints the end-of-run summary.
fn print_report(console: &Console, report: &BookReport, elapsed: Duration, dry_run: bool) {
    let stats = &report.stats;

    console.section("Summary");
    console.info(&format!(
        "Documents: {} translated, {} skipped, {} total ({} parsed leniently)",
        console.count(report.translated),
        report.skipped,
        report.documents,
        report.lenient
    ));
    console.info(&format!(
        "Blocks: {} total, {} accepted in batch, {} on retry, {} by text node",
        console.count(stats.blocks),
        stats.accepted_in_batch,
        stats.accepted_on_retry,
        stats.node_fallbacks
    ));
    console.info(&format!(
        "Opaque blocks: {}, skipped blocks: {}",
        stats.opaque_blocks, stats.skipped_blocks
    ));
    console.info(&format!(
        "Text nodes: {} translated, {} left untranslated",
        stats.text_nodes_translated, stats.text_node_failures
    ));
    let usage = &report.usage;
    console.info(&format!(
        "API calls: {} in {:.1}s",
        console.count(usage.calls),
        elapsed.as_secs_f64()
    ));
    console.info(&format!(
        "Volume: {} characters sent, {} received (about {} tokens)",
        usage.chars_sent,
        usage.chars_received,
        console.count(usage.estimated_tokens())
    ));

    if stats.text_node_failures > 0 {
        console.warning("Some text was left in the source language");
    }

    if dry_run {
        if !stats.samples.is_empty() {
            console.section("Sample translations");
            for (i, sample) in stats.samples.iter().enumerate() {
                console.sample(i + 1, sample);
            }
        }
        console.success("Dry run finished, no output written");
    } else if let Some(output) = &report.output {
        console.success(&format!("Saved {}", output.display()));
    }
}

/// Parses a temperature in `[0, 1]`.
fn parse_temperature(s: &str) -> Result<f32, String> {
    let value: f32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number", s))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside [0, 1]", value))
    }
}
