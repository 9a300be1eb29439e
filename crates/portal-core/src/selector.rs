//! Path scoring and switching for the multipath data plane.
//!
//! Each candidate path keeps rolling latency and jitter windows plus an
//! exponentially weighted loss average. The composite score is
//! `latency_ms × (1 + 2·loss) + 0.5 × jitter_ms` (lower is better).
//!
//! Switching is deliberately sticky: a 15 % improvement gate plus a 5 s
//! cooldown keeps bursty networks from flapping the active path. The one
//! case where stickiness hurts is persistent loss, so two consecutive
//! high-loss samples on the current path bypass both gates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// Samples kept in the latency and jitter windows.
pub const SAMPLE_WINDOW: usize = 16;

/// Smoothing factor for the loss EWMA.
pub const LOSS_EWMA_ALPHA: f64 = 0.5;

/// Loss level considered "high" for fail-fast counting.
pub const HIGH_LOSS_THRESHOLD: f64 = 0.20;

/// Consecutive high-loss samples that trigger fail-fast switching.
pub const FAIL_FAST_SAMPLES: u32 = 2;

/// Minimum time between voluntary switches.
pub const SWITCH_COOLDOWN: Duration = Duration::from_secs(5);

/// Required improvement over the current path, in percent.
pub const SWITCH_DELTA_PCT: f64 = 15.0;

pub type PathId = u64;

/// Rolling quality state for one path.
#[derive(Debug, Clone)]
pub struct PathScore {
    pub path_id: PathId,
    /// Newest sample at index 0; zero entries are empty slots.
    latency_window: [u64; SAMPLE_WINDOW],
    jitter_window: [u64; SAMPLE_WINDOW],
    loss_ewma: f64,
    score: f64,
    high_loss_count: u32,
    last_eval: Instant,
}

impl PathScore {
    fn new(path_id: PathId) -> Self {
        Self {
            path_id,
            latency_window: [0; SAMPLE_WINDOW],
            jitter_window: [0; SAMPLE_WINDOW],
            loss_ewma: 0.0,
            score: 0.0,
            high_loss_count: 0,
            last_eval: Instant::now(),
        }
    }

    fn record(&mut self, latency_ns: u64, jitter_ns: u64, lost: bool) {
        self.latency_window.copy_within(..SAMPLE_WINDOW - 1, 1);
        self.latency_window[0] = latency_ns;
        self.jitter_window.copy_within(..SAMPLE_WINDOW - 1, 1);
        self.jitter_window[0] = jitter_ns;

        let observed = if lost { 1.0 } else { 0.0 };
        self.loss_ewma = (1.0 - LOSS_EWMA_ALPHA) * self.loss_ewma + LOSS_EWMA_ALPHA * observed;

        if self.loss_ewma > HIGH_LOSS_THRESHOLD {
            self.high_loss_count += 1;
        } else {
            self.high_loss_count = 0;
        }
    }

    fn window_avg_ms(window: &[u64; SAMPLE_WINDOW]) -> f64 {
        let mut sum = 0u64;
        let mut count = 0u64;
        for &v in window {
            if v > 0 {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            return 0.0;
        }
        (sum as f64 / count as f64) / 1_000_000.0
    }

    fn recompute(&mut self) {
        let latency_ms = Self::window_avg_ms(&self.latency_window);
        let jitter_ms = Self::window_avg_ms(&self.jitter_window);
        self.score = latency_ms * (1.0 + 2.0 * self.loss_ewma) + 0.5 * jitter_ms;
        self.last_eval = Instant::now();
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn loss(&self) -> f64 {
        self.loss_ewma
    }
}

/// Chooses the active path among the registered candidates.
pub struct PathSelector {
    paths: HashMap<PathId, PathScore>,
    /// Registration order; breaks score ties.
    order: Vec<PathId>,
    current: Option<PathId>,
    last_switch: Option<Instant>,
}

impl Default for PathSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSelector {
    pub fn new() -> Self {
        Self {
            paths: HashMap::new(),
            order: Vec::new(),
            current: None,
            last_switch: None,
        }
    }

    pub fn add_path(&mut self, id: PathId) {
        if self.paths.contains_key(&id) {
            return;
        }
        self.paths.insert(id, PathScore::new(id));
        self.order.push(id);
    }

    pub fn remove_path(&mut self, id: PathId) {
        self.paths.remove(&id);
        self.order.retain(|&p| p != id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    pub fn record_sample(&mut self, id: PathId, latency_ns: u64, jitter_ns: u64, lost: bool) {
        if let Some(path) = self.paths.get_mut(&id) {
            path.record(latency_ns, jitter_ns, lost);
        }
    }

    pub fn current_path(&self) -> Option<PathId> {
        self.current
    }

    pub fn path_ids(&self) -> impl Iterator<Item = PathId> + '_ {
        self.order.iter().copied()
    }

    pub fn score_of(&self, id: PathId) -> Option<&PathScore> {
        self.paths.get(&id)
    }

    /// Score every path and decide whether to switch.
    ///
    /// Returns `(best, should_switch)`; `None` when no paths exist. The
    /// decision order is: initialize on first call, fail-fast on a lossy
    /// current path, cooldown, then the improvement gate.
    pub fn evaluate(&mut self) -> Option<(PathId, bool)> {
        if self.order.is_empty() {
            return None;
        }

        for path in self.paths.values_mut() {
            path.recompute();
        }

        // Lowest score wins; ties go to the first-registered path.
        let mut best = *self.order.first()?;
        for &id in &self.order[1..] {
            if self.paths[&id].score < self.paths[&best].score {
                best = id;
            }
        }

        let Some(current) = self.current else {
            return Some((best, true));
        };

        let Some(current_score) = self.paths.get(&current) else {
            return Some((best, true));
        };

        if current_score.high_loss_count >= FAIL_FAST_SAMPLES {
            debug!(
                path = current,
                loss = current_score.loss_ewma,
                "fail-fast: current path persistently lossy"
            );
            return Some((best, true));
        }

        if let Some(last) = self.last_switch {
            if last.elapsed() < SWITCH_COOLDOWN {
                return Some((best, false));
            }
        }

        if best == current {
            return Some((best, false));
        }

        let current_val = current_score.score;
        let best_val = self.paths[&best].score;
        if current_val <= 0.0 {
            return Some((best, false));
        }
        let improvement_pct = (current_val - best_val) / current_val * 100.0;
        Some((best, improvement_pct > SWITCH_DELTA_PCT))
    }

    /// Commit a switch: record the time and reset the new path's
    /// high-loss streak.
    pub fn switch_to(&mut self, id: PathId) {
        if let Some(path) = self.paths.get_mut(&id) {
            path.high_loss_count = 0;
        }
        if self.current != Some(id) {
            debug!(from = ?self.current, to = id, "switching active path");
        }
        self.current = Some(id);
        self.last_switch = Some(Instant::now());
    }

    #[cfg(test)]
    fn backdate_last_switch(&mut self, by: Duration) {
        if let Some(last) = self.last_switch {
            self.last_switch = Some(last - by);
        }
    }
}
