use std::io::Write;
use std::path::Path;
use std::time::Duration;

use owo_colors::OwoColorize;

use crate::error::Result;
use crate::stats::RunStats;

/// Receives the live counters while a pass runs.
///
/// Called synchronously after every counter change; implementations must
/// be cheap and must not block.
pub trait Progress: Send + Sync {
    fn update(&self, stats: &RunStats);
}

/// Single progress line on stderr, rewritten in place.
#[derive(Debug, Default)]
pub struct ProgressLine;

impl ProgressLine {
    /// A progress line, or `None` when stderr is not a terminal.
    pub fn for_terminal() -> Option<Self> {
        atty::is(atty::Stream::Stderr).then_some(ProgressLine)
    }

    /// Terminate the line so following output starts on a fresh line.
    pub fn finish(&self) {
        eprintln!();
    }
}

impl Progress for ProgressLine {
    fn update(&self, stats: &RunStats) {
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r\x1b[2K{}", format_progress(stats));
        let _ = stderr.flush();
    }
}

pub fn format_progress(stats: &RunStats) -> String {
    format!(
        "{} files found. Of which {} new actions. Performing tasks: {}/{}...",
        stats.files, stats.actions_found, stats.tasks_performed, stats.actions_found
    )
}

/// The end-of-pass summary block.
pub fn format_summary(stats: &RunStats, ledger: &Path, elapsed: Duration) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} successful written:\n",
        ledger.display().yellow()
    ));
    out.push_str("------------------------------\n");
    out.push_str(&format!("  {}\t images new\n", stats.files_new.green()));
    out.push_str(&format!("  {}\t images deleted\n", stats.files_deleted.red()));
    out.push_str("  \t ------------\n");
    out.push_str(&format!(
        "  {}\t actions registered\n",
        stats.actions_new.magenta()
    ));
    out.push_str(&format!(
        "  {}\t actions updated\n",
        stats.actions_updated.cyan()
    ));
    out.push_str(&format!(
        "  {}\t actions ignored\n",
        stats.actions_ignored.yellow()
    ));
    out.push_str("  \t ------------\n");
    out.push_str(&format!(
        "  {}\t {}\n",
        stats.tasks_performed.green(),
        "tasks performed".bold()
    ));
    if stats.actions_failed > 0 {
        out.push_str(&format!("  {}\t actions failed\n", stats.actions_failed.red()));
    }
    if stats.traversal_errors > 0 {
        out.push_str(&format!(
            "  {}\t entries unreadable\n",
            stats.traversal_errors.red()
        ));
    }
    out.push_str("------------------------------\n");
    out.push_str(&format!(
        "{} {}ms",
        "✓ Done!".green(),
        elapsed.as_millis()
    ));
    out
}

pub fn print_summary(stats: &RunStats, ledger: &Path, elapsed: Duration) {
    println!("{}", format_summary(stats, ledger, elapsed));
}

pub fn print_json(stats: &RunStats) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}
