use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{error, info, warn, Level, LevelFilter};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chunkpatch::{
    apply_chunk_set_to_dir, build_chunks, ApplyDecision, ApplyOptions, ChunkOptions, FileResult,
};

const DEFAULT_MIN_SCORE: u8 = 75;
const DEFAULT_DRIFT_WINDOW: usize = 30;
const DEFAULT_CONTEXT_BEFORE: usize = 3;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    // 2. Call the main logic function.
    //    All complex logic and error handling is inside `run`.
    if let Err(e) = run(args) {
        // 3. If `run` returns an error, details have already been logged by
        //    the time it gets here. Print a user-facing message and set the
        //    exit code. Using {:?} prints the full `anyhow` error chain.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    setup_logging(&args);

    // --- Argument Validation ---
    if !args.target_dir.is_dir() {
        return Err(anyhow!(
            "Target directory '{}' not found or is not a directory.",
            args.target_dir.display()
        ));
    }
    if args.min_score > 100 {
        return Err(anyhow!("Minimum score must be between 0 and 100."));
    }
    if !(1..=3).contains(&args.context) {
        return Err(anyhow!("Context line count must be between 1 and 3."));
    }

    // --- Patch Parsing ---
    let content = fs::read_to_string(&args.patch_file)
        .with_context(|| format!("Failed to read patch file '{}'", args.patch_file.display()))?;
    let chunk_options = ChunkOptions::builder().context_before(args.context).build();
    let set = build_chunks(&content, &chunk_options);

    if set.is_empty() {
        info!("No applicable chunks found in the patch file.");
        return Ok(());
    }

    let options = ApplyOptions::builder()
        .dry_run(args.dry_run)
        .min_score(args.min_score)
        .drift_window(args.drift_window)
        .build();

    info!(""); // Vertical spacing for readability
    info!("Found {} chunk(s) to apply.", set.len());
    info!(
        "Fuzzy context matching threshold: {} (drift window: {} lines).",
        options.min_score, options.drift_window
    );

    // --- Core Patching Logic ---
    let batch = apply_chunk_set_to_dir(&set, &args.target_dir, &options);

    let mut applied_count = 0;
    let mut already_applied_count = 0;
    let mut unresolved_count = 0;
    let mut hard_failure_count = 0;

    for (path, result) in &batch.results {
        info!(""); // Vertical spacing
        info!(">>> File: {}", path.display());
        match result {
            Ok(file_result) => {
                if let Some(diff) = &file_result.diff {
                    println!("----- Proposed changes for {} -----", path.display());
                    print!("{}", diff);
                    println!("------------------------------------");
                }
                applied_count += file_result.report.applied_count();
                already_applied_count += file_result
                    .report
                    .chunk_results
                    .iter()
                    .filter(|d| matches!(d, ApplyDecision::AlreadyApplied))
                    .count();
                if !file_result.report.all_resolved() {
                    unresolved_count += file_result.report.unresolved().len();
                    error!("--- FAILED to resolve every chunk for: {}", path.display());
                    log_unresolved_chunks(file_result);
                }
            }
            Err(e) => {
                hard_failure_count += 1;
                error!("--- FAILED to patch {}: {}", path.display(), e);
            }
        }
    }

    // --- Final Summary ---
    info!("\n--- Summary ---");
    info!("Applied chunks:         {}", applied_count);
    info!("Already applied chunks: {}", already_applied_count);
    info!("Unresolved chunks:      {}", unresolved_count);
    info!("Failed files:           {}", hard_failure_count);
    if args.dry_run {
        info!("DRY RUN completed. No files were modified.");
    }

    if unresolved_count > 0 || hard_failure_count > 0 {
        warn!("Review the log for errors. Some files may be in a partially patched state.");
        // Return an error to set a non-zero exit code.
        return Err(anyhow!(
            "Completed with {} unresolved chunk(s) and {} failed file(s).",
            unresolved_count,
            hard_failure_count
        ));
    }

    Ok(())
}

// --- Helper Functions ---

/// Logs the 1-based indices of the chunks that could not be resolved.
fn log_unresolved_chunks(file_result: &FileResult) {
    for index in file_result.report.unresolved() {
        warn!("  - Chunk {} could not be resolved in the target.", index);
    }
}

/// Configures the global logger with colored level prefixes.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply diff chunks from a patch file to a target directory based on context, ignoring line numbers.",
    long_about = "Splits a unified-diff-like patch into chunks (one addition run plus its preceding removal run and context), locates each chunk in the target with fuzzy context matching, and applies the ones that fit."
)]
struct Args {
    /// Path to the patch file containing unified-diff-like chunks.
    patch_file: PathBuf,
    /// Path to the target directory to apply chunks in.
    target_dir: PathBuf,
    /// If set, show what would be done, but don't modify any files.
    #[arg(
        short = 'n',
        long,
        help = "Show what would be done, but don't modify files."
    )]
    dry_run: bool,
    /// The minimum similarity score (0 to 100) for context matching.
    /// Higher is stricter.
    #[arg(short = 's', long, default_value_t = DEFAULT_MIN_SCORE, help = "Minimum similarity score for context matching (0 to 100). Higher is stricter.")]
    min_score: u8,
    /// How many non-blank context lines to collect before each chunk (1 to 3).
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONTEXT_BEFORE, help = "Non-blank context lines collected before each chunk (1 to 3).")]
    context: usize,
    /// How many lines around the context anchor to search for drifted
    /// removed lines.
    #[arg(short = 'w', long, default_value_t = DEFAULT_DRIFT_WINDOW, help = "Search window (in lines) around the context anchor for drifted removed lines.")]
    drift_window: usize,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.")]
    verbose: u8,
}
