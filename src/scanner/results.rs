use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::signature::Signature;

/// Test case name -> signature, for one target in one round.
pub type Observations = BTreeMap<String, Signature>;

/// A labelled endpoint. At scan time the label is the address itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub label: String,
    pub address: SocketAddr,
}

impl ProbeTarget {
    pub fn new(label: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            label: label.into(),
            address,
        }
    }
}

/// Everything one label answered during one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub label: String,
    pub round: String,
    pub observations: Observations,
}

impl FingerprintEntry {
    pub fn new(label: impl Into<String>, round: impl Into<String>, observations: Observations) -> Self {
        Self {
            label: label.into(),
            round: round.into(),
            observations,
        }
    }
}

pub fn round_id(round: usize) -> String {
    format!("round_{}", round)
}

/// Results of one sweep, keyed by target position then test case name.
///
/// Recording is a keyed overwrite, so the arrival order of probes never
/// changes the final contents.
#[derive(Debug, Clone, Default)]
pub struct RoundAccumulator {
    results: HashMap<usize, Observations>,
    failures: usize,
}

impl RoundAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, target: usize, case: &str, signature: Signature) {
        if signature.is_failure() {
            self.failures += 1;
        }
        self.results
            .entry(target)
            .or_default()
            .insert(case.to_string(), signature);
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn probes(&self) -> usize {
        self.results.values().map(|observations| observations.len()).sum()
    }

    pub fn observations(&self, target: usize) -> Option<&Observations> {
        self.results.get(&target)
    }

    /// One entry per target, in target order. Targets with no result are skipped.
    pub fn into_entries(mut self, targets: &[ProbeTarget], round: &str) -> Vec<FingerprintEntry> {
        targets
            .iter()
            .enumerate()
            .filter_map(|(index, target)| {
                self.results
                    .remove(&index)
                    .map(|observations| FingerprintEntry::new(target.label.clone(), round, observations))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(label: &str, port: u16) -> ProbeTarget {
        ProbeTarget::new(label, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_record_order_does_not_matter() {
        let mut forward = RoundAccumulator::new();
        forward.record(0, "a", Signature::timeout());
        forward.record(1, "a", Signature::failure("refused"));
        forward.record(0, "b", Signature::timeout());

        let mut backward = RoundAccumulator::new();
        backward.record(0, "b", Signature::timeout());
        backward.record(1, "a", Signature::failure("refused"));
        backward.record(0, "a", Signature::timeout());

        let targets = vec![target("bind", 53), target("unbound", 54)];
        assert_eq!(
            forward.into_entries(&targets, "round_1"),
            backward.into_entries(&targets, "round_1")
        );
    }

    #[test]
    fn test_entries_follow_target_order() {
        let mut accumulator = RoundAccumulator::new();
        accumulator.record(1, "a", Signature::timeout());
        accumulator.record(0, "a", Signature::timeout());
        assert_eq!(accumulator.failures(), 2);
        assert_eq!(accumulator.probes(), 2);

        let targets = vec![target("knot", 53), target("nsd", 53), target("powerdns", 53)];
        let entries = accumulator.into_entries(&targets, &round_id(3));
        let labels: Vec<&str> = entries.iter().map(|entry| entry.label.as_str()).collect();
        assert_eq!(labels, vec!["knot", "nsd"]);
        assert_eq!(entries[0].round, "round_3");
    }
}
