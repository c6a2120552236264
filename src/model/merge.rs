// Labels whose every observation matches item for item cannot be told apart
// by any test case, so they are trained as one composite label.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::scanner::{FingerprintEntry, Signature};

pub const LABEL_SEPARATOR: &str = "|";

type ContentKey<'a> = Vec<(&'a str, &'a str, &'a Signature)>;

/// A set of labels that answered identically across every round and test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedLabelGroup {
    pub name: String,
    pub members: Vec<String>,
}

pub fn composite_label<'a>(members: impl IntoIterator<Item = &'a str>) -> String {
    let sorted: BTreeSet<&str> = members.into_iter().collect();
    sorted.into_iter().collect::<Vec<_>>().join(LABEL_SEPARATOR)
}

/// Split a (possibly composite) label back into its member identities.
pub fn split_label(label: &str) -> Vec<String> {
    label.split(LABEL_SEPARATOR).map(str::to_string).collect()
}

fn content_keys(entries: &[FingerprintEntry]) -> BTreeMap<&str, ContentKey<'_>> {
    let mut keys: BTreeMap<&str, ContentKey<'_>> = BTreeMap::new();
    for entry in entries {
        let key = keys.entry(entry.label.as_str()).or_default();
        for (case, signature) in &entry.observations {
            key.push((entry.round.as_str(), case.as_str(), signature));
        }
    }
    for key in keys.values_mut() {
        key.sort();
    }
    keys
}

/// Map every original label to the label it should be trained under.
///
/// Labels sharing an identical content key (the sorted list of every
/// (round, test case, signature) triple observed for them) map to their
/// composite name; every other label maps to itself.
pub fn aggregate(entries: &[FingerprintEntry]) -> (BTreeMap<String, String>, Vec<MergedLabelGroup>) {
    let mut by_content: BTreeMap<ContentKey<'_>, Vec<&str>> = BTreeMap::new();
    for (label, key) in content_keys(entries) {
        by_content.entry(key).or_default().push(label);
    }

    let mut mapping = BTreeMap::new();
    let mut groups = Vec::new();
    for members in by_content.into_values() {
        let name = composite_label(members.iter().copied());
        if members.len() > 1 {
            groups.push(MergedLabelGroup {
                name: name.clone(),
                members: members.iter().map(|member| member.to_string()).collect(),
            });
        }
        for member in members {
            mapping.insert(member.to_string(), name.clone());
        }
    }
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    (mapping, groups)
}

/// Relabel entries with their merged names, keeping one entry per original sample.
pub fn merge_labels(entries: Vec<FingerprintEntry>) -> Vec<FingerprintEntry> {
    let (mapping, groups) = aggregate(&entries);
    for group in &groups {
        info!("merged {} indistinguishable labels into {}", group.members.len(), group.name);
    }

    entries
        .into_iter()
        .map(|mut entry| {
            if let Some(merged) = mapping.get(&entry.label) {
                entry.label = merged.clone();
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Observations;
    use serde_json::json;

    fn signature(value: serde_json::Value) -> Signature {
        serde_json::from_value(value).unwrap()
    }

    fn observations(pairs: &[(&str, Signature)]) -> Observations {
        pairs
            .iter()
            .map(|(case, sig)| (case.to_string(), sig.clone()))
            .collect()
    }

    fn identical_trio() -> Vec<FingerprintEntry> {
        let refused = signature(json!({"QR": 1, "RCODE": "REFUSED", "QDCOUNT": 1}));
        let notimp = signature(json!({"QR": 1, "RCODE": "NOTIMP"}));
        let mut entries = Vec::new();
        for round in ["round_1", "round_2"] {
            for label in ["L3", "L1", "L2"] {
                entries.push(FingerprintEntry::new(
                    label,
                    round,
                    observations(&[("t1", refused.clone()), ("t2", notimp.clone())]),
                ));
            }
            entries.push(FingerprintEntry::new(
                "L4",
                round,
                observations(&[("t1", refused.clone()), ("t2", Signature::timeout())]),
            ));
        }
        entries
    }

    #[test]
    fn test_identical_labels_merge_into_sorted_composite() {
        let merged = merge_labels(identical_trio());
        assert_eq!(merged.len(), 8);
        let composite = merged.iter().filter(|entry| entry.label == "L1|L2|L3").count();
        assert_eq!(composite, 6);
        assert_eq!(merged.iter().filter(|entry| entry.label == "L4").count(), 2);
        assert_eq!(split_label("L1|L2|L3"), vec!["L1", "L2", "L3"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge_labels(identical_trio());
        let twice = merge_labels(once.clone());
        assert_eq!(once, twice);
        let (_, groups) = aggregate(&once);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_difference_in_one_round_prevents_merge() {
        let mut entries = identical_trio();
        // L2 answers differently in round_2 only
        let last_l2 = entries
            .iter_mut()
            .rev()
            .find(|entry| entry.label == "L2")
            .unwrap();
        last_l2
            .observations
            .insert("t2".to_string(), Signature::failure("bad response"));

        let (mapping, groups) = aggregate(&entries);
        assert_eq!(mapping["L1"], "L1|L3");
        assert_eq!(mapping["L2"], "L2");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec!["L1", "L3"]);
    }

    #[test]
    fn test_round_identity_is_part_of_the_key() {
        let refused = signature(json!({"RCODE": "REFUSED"}));
        let entries = vec![
            FingerprintEntry::new("a", "round_1", observations(&[("t1", refused.clone())])),
            FingerprintEntry::new("b", "round_2", observations(&[("t1", refused)])),
        ];
        let (mapping, _) = aggregate(&entries);
        assert_eq!(mapping["a"], "a");
        assert_eq!(mapping["b"], "b");
    }
}
