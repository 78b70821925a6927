//! Shared run counters and the periodic status thread.

use crate::registry::Registry;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Counters shared between the dispatch loop and the status thread.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Completed iterations since the last reset.
    pub iterations: u64,
    /// Cumulative wall time of completed iterations.
    pub total_time: Duration,
    /// Iterations whose outputs did not agree.
    pub divergences: u64,
}

impl Stats {
    /// Account one completed iteration.
    pub fn record(&mut self, duration: Duration, divergent: bool) {
        self.iterations += 1;
        self.total_time += duration;
        if divergent {
            self.divergences += 1;
        }
    }

    /// Mean wall time per iteration, if any completed.
    pub fn mean(&self) -> Option<Duration> {
        if self.iterations == 0 {
            return None;
        }
        Some(self.total_time / self.iterations as u32)
    }

    /// Zero all counters. The dispatch loop resets while it sits below
    /// the client minimum so averages only cover active fuzzing.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One status line, also used by the periodic thread.
pub fn format_status(stats: &Stats, names: &[String]) -> String {
    let mean = stats
        .mean()
        .map(|d| format!("{:.1?}", d))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "fuzzing time: {:.1?}, iterations: {}, average iteration: {}, clients: [{}]",
        stats.total_time,
        stats.iterations,
        mean,
        names.join(", ")
    )
}

/// Spawn the status thread: every `period` it logs the counters and the
/// sorted client list. Runs for the life of the process.
pub fn spawn(
    stats: Arc<Mutex<Stats>>,
    registry: Arc<Registry>,
    period: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(period);
        let snapshot = stats.lock().unwrap().clone();
        let names = registry.names();
        log::info!("{}", format_status(&snapshot, &names));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut stats = Stats::default();
        stats.record(Duration::from_millis(10), false);
        stats.record(Duration::from_millis(30), true);
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.total_time, Duration::from_millis(40));
        assert_eq!(stats.divergences, 1);
        assert_eq!(stats.mean(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_mean_of_idle_stats_is_none() {
        assert_eq!(Stats::default().mean(), None);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let mut stats = Stats::default();
        stats.record(Duration::from_millis(5), true);
        stats.reset();
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.total_time, Duration::ZERO);
        assert_eq!(stats.divergences, 0);
    }

    #[test]
    fn test_format_lists_clients_in_order() {
        let mut stats = Stats::default();
        stats.record(Duration::from_millis(8), false);
        let line = format_status(
            &stats,
            &["geth".to_string(), "nimbus".to_string(), "reth".to_string()],
        );
        assert!(line.contains("iterations: 1"));
        assert!(line.contains("[geth, nimbus, reth]"));
    }

    #[test]
    fn test_format_idle_line() {
        let line = format_status(&Stats::default(), &[]);
        assert!(line.contains("iterations: 0"));
        assert!(line.contains("average iteration: -"));
        assert!(line.contains("clients: []"));
    }
}
