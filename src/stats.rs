//! Per-worker render statistics: the rolling window the monitors consult
//! and the full history dumped as CSV next to the worker's image.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// One self-reported statistics interval from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderStats {
    pub rays_produced: u64,
    pub rays_killed: u64,
    pub rays_queued: u64,
    /// Fraction of the worker's slab completed, in `[0, 1]`.
    pub progress: f32,
}

impl RenderStats {
    pub fn is_quiet(&self) -> bool {
        self.rays_produced == 0 && self.rays_killed == 0 && self.rays_queued == 0
    }
}

/// Full stats history for one worker. Windowed accessors look at the most
/// recent `intervals` entries only.
#[derive(Debug, Default)]
pub struct StatsHistory {
    entries: Vec<RenderStats>,
}

impl StatsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stats: RenderStats) {
        self.entries.push(stats);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn window(&self, intervals: u32) -> &[RenderStats] {
        let len = self.entries.len();
        &self.entries[len.saturating_sub(intervals as usize)..]
    }

    /// A worker is interesting while any ray activity showed up in its
    /// last `intervals` reports. No reports at all counts as quiet.
    pub fn is_interesting(&self, intervals: u32) -> bool {
        self.window(intervals).iter().any(|s| !s.is_quiet())
    }

    pub fn rays_produced(&self, intervals: u32) -> u64 {
        self.window(intervals).iter().map(|s| s.rays_produced).sum()
    }

    pub fn rays_killed(&self, intervals: u32) -> u64 {
        self.window(intervals).iter().map(|s| s.rays_killed).sum()
    }

    pub fn rays_queued(&self, intervals: u32) -> u64 {
        self.window(intervals).iter().map(|s| s.rays_queued).sum()
    }

    /// Latest self-reported progress; zero before the first report.
    pub fn progress(&self) -> f32 {
        self.entries.last().map(|s| s.progress).unwrap_or(0.0)
    }

    pub fn to_csv_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("cannot create stats file {}", path.display()))?;
        writeln!(file, "rays_produced,rays_killed,rays_queued,progress")?;
        for s in &self.entries {
            writeln!(
                file,
                "{},{},{},{}",
                s.rays_produced, s.rays_killed, s.rays_queued, s.progress
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(produced: u64) -> RenderStats {
        RenderStats {
            rays_produced: produced,
            rays_killed: 1,
            rays_queued: 2,
            progress: 0.5,
        }
    }

    #[test]
    fn empty_history_is_not_interesting() {
        assert!(!StatsHistory::new().is_interesting(3));
    }

    #[test]
    fn interest_looks_only_at_the_recent_window() {
        let mut history = StatsHistory::new();
        history.push(active(10));
        history.push(RenderStats::default());
        history.push(RenderStats::default());
        assert!(history.is_interesting(3));
        assert!(!history.is_interesting(2));
    }

    #[test]
    fn windowed_sums_and_latest_progress() {
        let mut history = StatsHistory::new();
        history.push(active(5));
        history.push(active(7));
        history.push(RenderStats {
            progress: 0.9,
            ..Default::default()
        });
        assert_eq!(history.rays_produced(2), 7);
        assert_eq!(history.rays_produced(10), 12);
        assert_eq!(history.rays_killed(3), 2);
        assert_eq!(history.progress(), 0.9);
    }

    #[test]
    fn csv_dump_has_header_and_one_row_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.csv");
        let mut history = StatsHistory::new();
        history.push(active(3));
        history.push(RenderStats::default());
        history.to_csv_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "rays_produced,rays_killed,rays_queued,progress");
        assert_eq!(lines[1], "3,1,2,0.5");
    }
}
