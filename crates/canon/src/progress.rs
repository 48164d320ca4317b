//! Batch reconciliation progress reporting.
//!
//! Emitted on **stderr** so stdout stays parseable for scripts. The
//! reporters implement [`ProgressObserver`] and are handed to the batch
//! runner, which calls them after every batch.

use std::io::Write;

use canon_core::batch::{BatchProgress, ProgressObserver};

/// Human-friendly progress: "reconcile 3f2a…  batch 4  400 / 1,250 chunks  merged 12".
pub struct StderrProgress;

impl ProgressObserver for StderrProgress {
    fn on_progress(&self, progress: &BatchProgress) {
        let stats = &progress.stats;
        let tally = if progress.dry_run {
            format!(
                "would merge {}  would link {}  would flag {}",
                format_number(stats.would_merge),
                format_number(stats.would_link),
                format_number(stats.would_flag)
            )
        } else {
            format!(
                "merged {}  linked {}  flagged {}  errors {}",
                format_number(stats.merged),
                format_number(stats.linked),
                format_number(stats.flagged),
                format_number(stats.errors)
            )
        };
        let line = format!(
            "reconcile {}  batch {}  {} / {} chunks  {}\n",
            short_id(&progress.job_id),
            progress.batch,
            format_number(progress.processed),
            format_number(progress.total),
            tally
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressObserver for JsonProgress {
    fn on_progress(&self, progress: &BatchProgress) {
        let obj = serde_json::json!({
            "event": "progress",
            "job_id": progress.job_id,
            "batch": progress.batch,
            "processed": progress.processed,
            "total": progress.total,
            "dry_run": progress.dry_run,
            "stats": progress.stats,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _progress: &BatchProgress) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// First eight characters of a UUID, for compact display.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> Box<dyn ProgressObserver> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn short_id_truncates_long_ids_only() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
