use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use photosift::core::config::{Config, DEFAULT_THRESHOLD, YearMonth};
use photosift::core::hash::HashFunction;
use photosift::core::presenter::{HeadlessPresenter, Presenter, TerminalPresenter};
use photosift::core::session::Session;

#[derive(Parser, Debug)]
#[command(
    name = "photosift",
    version,
    about = "Find and review near-duplicate photos"
)]
struct Cli {
    /// Photo library to scan
    #[arg(value_name = "DIRECTORY")]
    directory: PathBuf,

    /// Perceptual hash used to compare images
    #[arg(long = "hash", value_enum, default_value_t = HashFunction::Perceptual)]
    hash_function: HashFunction,

    /// Accepted for compatibility; grouping uses identical hashes
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: u32,

    /// Keep the leftmost image when no choice is made within SECS (0 disables)
    #[arg(long, value_name = "SECS", num_args = 0..=1, default_missing_value = "10")]
    auto: Option<u64>,

    /// Resolve every group automatically without prompting
    #[arg(long)]
    no_gui: bool,

    /// Secondary directory whose kept images are moved into DIRECTORY
    #[arg(long = "import", value_name = "DIR")]
    import_dir: Option<PathBuf>,

    /// Month whose shots lose ties between two images
    #[arg(long, value_name = "YYYY-MM", default_value_t = YearMonth::default())]
    demote_month: YearMonth,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    let mut config = Config::new(&cli.directory, cli.hash_function)
        .with_import_dir(cli.import_dir)
        .with_auto_timeout(cli.auto);
    config.threshold = cli.threshold;
    config.headless = cli.no_gui;
    config.demote_month = cli.demote_month;

    println!("▶ Reviewing duplicates in: {}", cli.directory.display());
    let presenter: Box<dyn Presenter> = if config.headless {
        Box::new(HeadlessPresenter)
    } else {
        Box::new(TerminalPresenter::new(config.auto_timeout))
    };

    let summary = Session::new(config, presenter).run()?;

    if summary.groups == 0 {
        println!("No duplicates found.");
    } else {
        println!(
            "\n✅ {} group(s): {} reviewed now, {} earlier",
            summary.groups, summary.review.presented, summary.review.already_reviewed
        );
    }
    println!(
        "   🗑️  Deleted {} image(s), 📦 moved {} import(s)",
        summary.review.deleted, summary.review.relocated
    );
    if summary.review.failed_deletions + summary.review.failed_relocations > 0 {
        eprintln!(
            "⚠️  {} deletion(s) and {} move(s) failed; see the log above",
            summary.review.failed_deletions, summary.review.failed_relocations
        );
    }
    Ok(())
}
