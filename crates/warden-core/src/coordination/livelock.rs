//! Livelock detection over agent state histories.
//!
//! Each agent gets a bounded window of canonicalized state hashes. A
//! livelock is reported when the tail of the window shows a repeating
//! pattern, a two-state alternation, or no change at all for longer than
//! the progress timeout.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::audit::canonical_json;

/// Configuration for livelock detection.
#[derive(Debug, Clone)]
pub struct LivelockConfig {
    /// Number of state hashes retained per agent.
    pub window: usize,
    /// Minimum repetitions of a pattern to report (criterion a), and
    /// half the minimum alternation length (criterion b).
    pub pattern_threshold: usize,
    /// How long an unchanged window must span to report (criterion c).
    pub progress_timeout: Duration,
}

impl Default for LivelockConfig {
    fn default() -> Self {
        Self {
            window: 10,
            pattern_threshold: 3,
            progress_timeout: Duration::from_secs(60),
        }
    }
}

/// Which criterion fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LivelockKind {
    /// A pattern of `length` distinct-state hashes repeats at the tail.
    RepeatingPattern { length: usize, repetitions: usize },
    /// Strict alternation between exactly two states.
    Alternation { length: usize },
    /// The state has not changed for at least `span`.
    Stalled { span_ms: u64 },
}

/// A reported livelock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivelockDetection {
    pub agent_id: String,
    pub kind: LivelockKind,
    /// The hash window that satisfied the criterion, oldest first.
    pub window: Vec<String>,
}

/// Per-agent bounded state-history tracker.
pub struct LivelockDetector {
    config: LivelockConfig,
    histories: Mutex<HashMap<String, VecDeque<(String, DateTime<Utc>)>>>,
}

impl LivelockDetector {
    pub fn new(config: LivelockConfig) -> Self {
        Self {
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Record an agent's current state. The state is canonicalized and
    /// hashed; only the hash is retained.
    pub fn record_state(&self, agent_id: &str, state: &Value) {
        let hash = state_hash(state);
        let mut histories = self.histories.lock().expect("livelock lock poisoned");
        let history = histories.entry(agent_id.to_owned()).or_default();
        history.push_back((hash, Utc::now()));
        while history.len() > self.config.window {
            history.pop_front();
        }
    }

    /// Check the agent's window against the livelock criteria.
    pub fn detect(&self, agent_id: &str) -> Option<LivelockDetection> {
        let histories = self.histories.lock().expect("livelock lock poisoned");
        let history = histories.get(agent_id)?;
        let hashes: Vec<&str> = history.iter().map(|(h, _)| h.as_str()).collect();

        if let Some(kind) = repeating_pattern(&hashes, self.config.pattern_threshold)
            .or_else(|| alternation(&hashes, self.config.pattern_threshold))
            .or_else(|| stalled(history, self.config.progress_timeout))
        {
            return Some(LivelockDetection {
                agent_id: agent_id.to_owned(),
                kind,
                window: hashes.iter().map(|h| (*h).to_owned()).collect(),
            });
        }
        None
    }

    /// Forget an agent's history (mitigation resets progress tracking).
    pub fn clear(&self, agent_id: &str) {
        let mut histories = self.histories.lock().expect("livelock lock poisoned");
        histories.remove(agent_id);
    }

    /// Agents currently tracked.
    pub fn tracked_agents(&self) -> Vec<String> {
        let histories = self.histories.lock().expect("livelock lock poisoned");
        let mut agents: Vec<String> = histories.keys().cloned().collect();
        agents.sort_unstable();
        agents
    }
}

/// SHA-256 over the canonical encoding of a state value.
pub fn state_hash(state: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(state).as_bytes()))
}

/// Criterion (a): a pattern of length 2..=window/2 with at least two
/// distinct hashes repeats at the window's tail `pattern_threshold`+
/// times.
fn repeating_pattern(hashes: &[&str], threshold: usize) -> Option<LivelockKind> {
    let n = hashes.len();
    for len in 2..=n / 2 {
        let pattern = &hashes[n - len..];
        let distinct: BTreeSet<&&str> = pattern.iter().collect();
        if distinct.len() < 2 {
            continue;
        }

        let mut repetitions = 1;
        while repetitions * len + len <= n {
            let start = n - (repetitions + 1) * len;
            if &hashes[start..start + len] == pattern {
                repetitions += 1;
            } else {
                break;
            }
        }

        if repetitions >= threshold {
            return Some(LivelockKind::RepeatingPattern {
                length: len,
                repetitions,
            });
        }
    }
    None
}

/// Criterion (b): a strict alternation between exactly two distinct
/// hashes of length >= 2 * threshold at the window's tail.
fn alternation(hashes: &[&str], threshold: usize) -> Option<LivelockKind> {
    let n = hashes.len();
    if n < 2 {
        return None;
    }

    // Longest suffix with period two: adjacent entries differ and every
    // entry equals the one two positions later.
    let mut run = 1;
    let mut i = n - 1;
    while i >= 1 {
        let adjacent_differ = hashes[i] != hashes[i - 1];
        let period_two = i + 1 >= n || hashes[i - 1] == hashes[i + 1];
        if adjacent_differ && period_two {
            run += 1;
            i -= 1;
        } else {
            break;
        }
    }

    let tail = &hashes[n - run..];
    let distinct: BTreeSet<&&str> = tail.iter().collect();
    if distinct.len() == 2 && run >= 2 * threshold {
        return Some(LivelockKind::Alternation { length: run });
    }
    None
}

/// Criterion (c): every hash in the window is equal and the window spans
/// at least the progress timeout.
fn stalled(
    history: &VecDeque<(String, DateTime<Utc>)>,
    progress_timeout: Duration,
) -> Option<LivelockKind> {
    if history.len() < 2 {
        return None;
    }
    let first = history.front()?;
    let last = history.back()?;
    let all_equal = history.iter().all(|(h, _)| h == &first.0);
    if !all_equal {
        return None;
    }

    let span = (last.1 - first.1).to_std().ok()?;
    if span >= progress_timeout {
        return Some(LivelockKind::Stalled {
            span_ms: span.as_millis() as u64,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector() -> LivelockDetector {
        LivelockDetector::new(LivelockConfig::default())
    }

    #[test]
    fn state_hash_is_canonical() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(state_hash(&a), state_hash(&b));
        assert_ne!(state_hash(&a), state_hash(&json!({"x": 1})));
    }

    #[test]
    fn no_detection_on_progressing_states() {
        let detector = detector();
        for i in 0..10 {
            detector.record_state("agent", &json!({"step": i}));
        }
        assert!(detector.detect("agent").is_none());
    }

    #[test]
    fn alternation_between_two_states_is_detected() {
        let detector = detector();
        for i in 0..10 {
            detector.record_state("agent", &json!({"state": i % 2}));
        }
        let detection = detector.detect("agent").expect("livelock expected");
        // A two-state alternation also satisfies the length-2 repeating
        // pattern criterion; either label is a correct report.
        match detection.kind {
            LivelockKind::Alternation { length } => assert!(length >= 6),
            LivelockKind::RepeatingPattern { length, repetitions } => {
                assert_eq!(length, 2);
                assert!(repetitions >= 3);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn three_state_pattern_is_detected() {
        let detector = detector();
        // Window of 10 holds a...bcabcabc(abc) -> pattern of length 3
        // repeated 3 times at the tail.
        for i in 0..12 {
            detector.record_state("agent", &json!({"state": i % 3}));
        }
        let detection = detector.detect("agent").expect("livelock expected");
        assert!(matches!(
            detection.kind,
            LivelockKind::RepeatingPattern { length: 3, repetitions } if repetitions >= 3
        ));
    }

    #[test]
    fn identical_states_within_timeout_do_not_fire() {
        let detector = detector();
        for _ in 0..10 {
            detector.record_state("agent", &json!({"state": "same"}));
        }
        // All hashes equal, but the window spans far less than 60s.
        assert!(detector.detect("agent").is_none());
    }

    #[test]
    fn identical_states_past_timeout_fire_stalled() {
        let detector = LivelockDetector::new(LivelockConfig {
            progress_timeout: Duration::from_millis(5),
            ..LivelockConfig::default()
        });
        detector.record_state("agent", &json!({"state": "same"}));
        std::thread::sleep(Duration::from_millis(10));
        detector.record_state("agent", &json!({"state": "same"}));

        let detection = detector.detect("agent").expect("livelock expected");
        assert!(matches!(detection.kind, LivelockKind::Stalled { .. }));
    }

    #[test]
    fn clear_resets_history() {
        let detector = detector();
        for i in 0..10 {
            detector.record_state("agent", &json!({"state": i % 2}));
        }
        assert!(detector.detect("agent").is_some());
        detector.clear("agent");
        assert!(detector.detect("agent").is_none());
    }

    #[test]
    fn window_is_bounded() {
        let detector = LivelockDetector::new(LivelockConfig {
            window: 4,
            ..LivelockConfig::default()
        });
        for i in 0..20 {
            detector.record_state("agent", &json!({"step": i}));
        }
        // Progressing states, bounded window, no detection.
        assert!(detector.detect("agent").is_none());
    }
}
