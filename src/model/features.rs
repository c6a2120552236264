use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FingerprintError, Result};
use crate::scanner::{FingerprintEntry, Signature};

/// One-hot column: "this test case produced exactly this signature".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub test_case: String,
    pub signature: Signature,
}

impl FeatureColumn {
    pub fn new(test_case: impl Into<String>, signature: Signature) -> Self {
        Self {
            test_case: test_case.into(),
            signature,
        }
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.test_case, self.signature)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub dropped: usize,
}

/// Rows are entries, columns are observed (test case, signature) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    columns: Vec<FeatureColumn>,
    rows: Vec<Vec<bool>>,
    row_labels: Vec<String>,
}

impl FeatureMatrix {
    /// One-hot encode `entries`.
    ///
    /// Without a schema the column vocabulary is every pair observed in
    /// `entries`, sorted. With a schema the result is reconciled against it
    /// and has exactly the schema's columns in the schema's order.
    pub fn encode(entries: &[FingerprintEntry], schema: Option<&[FeatureColumn]>) -> Result<Self> {
        let observed = Self::encode_observed(entries);
        match schema {
            None => Ok(observed),
            Some(schema) => {
                let (reconciled, report) = observed.reconcile(schema)?;
                debug!(
                    "reconciled {} rows: {} trained columns filled false, {} unseen columns dropped",
                    reconciled.n_rows(),
                    report.added,
                    report.dropped
                );
                Ok(reconciled)
            }
        }
    }

    fn encode_observed(entries: &[FingerprintEntry]) -> Self {
        let vocabulary: BTreeSet<FeatureColumn> = entries
            .iter()
            .flat_map(|entry| {
                entry
                    .observations
                    .iter()
                    .map(|(case, signature)| FeatureColumn::new(case.clone(), signature.clone()))
            })
            .collect();
        let columns: Vec<FeatureColumn> = vocabulary.into_iter().collect();
        let index: HashMap<(&str, &Signature), usize> = columns
            .iter()
            .enumerate()
            .map(|(position, column)| ((column.test_case.as_str(), &column.signature), position))
            .collect();

        let rows = entries
            .iter()
            .map(|entry| {
                let mut row = vec![false; columns.len()];
                for (case, signature) in &entry.observations {
                    if let Some(&position) = index.get(&(case.as_str(), signature)) {
                        row[position] = true;
                    }
                }
                row
            })
            .collect();

        FeatureMatrix {
            rows,
            row_labels: entries.iter().map(|entry| entry.label.clone()).collect(),
            columns,
        }
    }

    /// Conform this matrix to a trained schema.
    ///
    /// Trained columns missing here are added as all-false, columns the
    /// schema never saw are dropped, and the result follows the schema's
    /// column order exactly.
    pub fn reconcile(&self, schema: &[FeatureColumn]) -> Result<(Self, ReconcileReport)> {
        if schema.is_empty() {
            return Err(FingerprintError::SchemaMismatch(
                "trained schema has no columns".to_string(),
            ));
        }
        let mut unique = HashSet::with_capacity(schema.len());
        if let Some(duplicate) = schema.iter().find(|column| !unique.insert(*column)) {
            return Err(FingerprintError::SchemaMismatch(format!(
                "trained schema lists column {} twice",
                duplicate
            )));
        }

        let current: HashMap<&FeatureColumn, usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(position, column)| (column, position))
            .collect();
        let sources: Vec<Option<usize>> = schema
            .iter()
            .map(|column| current.get(column).copied())
            .collect();

        let report = ReconcileReport {
            added: sources.iter().filter(|source| source.is_none()).count(),
            dropped: self
                .columns
                .iter()
                .filter(|column| !unique.contains(column))
                .count(),
        };

        let rows = self
            .rows
            .iter()
            .map(|row| {
                sources
                    .iter()
                    .map(|source| source.map(|position| row[position]).unwrap_or(false))
                    .collect()
            })
            .collect();

        Ok((
            FeatureMatrix {
                columns: schema.to_vec(),
                rows,
                row_labels: self.row_labels.clone(),
            },
            report,
        ))
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<bool>] {
        &self.rows
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn select_rows(&self, indices: &[usize]) -> Self {
        FeatureMatrix {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&index| self.rows[index].clone()).collect(),
            row_labels: indices.iter().map(|&index| self.row_labels[index].clone()).collect(),
        }
    }

    pub fn to_f64_rows(&self) -> Vec<Vec<f64>> {
        self.rows
            .iter()
            .map(|row| row.iter().map(|&set| if set { 1.0 } else { 0.0 }).collect())
            .collect()
    }

    /// Same matrix with one column inverted in every row.
    pub fn with_flipped_column(&self, column: usize) -> Self {
        let mut flipped = self.clone();
        for row in &mut flipped.rows {
            row[column] = !row[column];
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Observations;
    use serde_json::json;

    fn sig(rcode: &str) -> Signature {
        serde_json::from_value(json!({"QR": 1, "RCODE": rcode})).unwrap()
    }

    fn entry(label: &str, pairs: &[(&str, Signature)]) -> FingerprintEntry {
        let observations: Observations = pairs
            .iter()
            .map(|(case, signature)| (case.to_string(), signature.clone()))
            .collect();
        FingerprintEntry::new(label, "round_1", observations)
    }

    #[test]
    fn test_training_encoding_is_one_hot() {
        let entries = vec![
            entry("bind", &[("t1", sig("REFUSED")), ("t2", sig("NOERROR"))]),
            entry("knot", &[("t1", sig("NOTIMP")), ("t2", sig("NOERROR"))]),
        ];
        let matrix = FeatureMatrix::encode(&entries, None).unwrap();
        assert_eq!(matrix.n_cols(), 3);
        assert_eq!(matrix.row_labels(), &["bind".to_string(), "knot".to_string()]);
        for row in matrix.rows() {
            assert_eq!(row.iter().filter(|&&set| set).count(), 2);
        }
        // shared (t2, NOERROR) column is set for both rows
        let shared = matrix
            .columns()
            .iter()
            .position(|column| column.test_case == "t2")
            .unwrap();
        assert!(matrix.rows().iter().all(|row| row[shared]));
    }

    #[test]
    fn test_reconcile_adds_missing_and_drops_unseen() {
        let a = FeatureColumn::new("t1", sig("REFUSED"));
        let b = FeatureColumn::new("t2", sig("NOERROR"));
        let c = FeatureColumn::new("t3", Signature::timeout());
        let d = FeatureColumn::new("t4", sig("FORMERR"));
        let schema = vec![a.clone(), b.clone(), c.clone()];

        let entries = vec![
            entry("10.0.0.1", &[("t2", sig("NOERROR")), ("t3", Signature::timeout()), ("t4", sig("FORMERR"))]),
            entry("10.0.0.2", &[("t4", sig("FORMERR"))]),
        ];
        let observed = FeatureMatrix::encode(&entries, None).unwrap();
        assert!(observed.columns().contains(&d));
        assert!(!observed.columns().contains(&a));

        let (reconciled, report) = observed.reconcile(&schema).unwrap();
        assert_eq!(reconciled.columns(), &[a, b, c]);
        assert_eq!(report, ReconcileReport { added: 1, dropped: 1 });
        assert_eq!(reconciled.rows()[0], vec![false, true, true]);
        assert_eq!(reconciled.rows()[1], vec![false, false, false]);

        let direct = FeatureMatrix::encode(&entries, Some(&schema)).unwrap();
        assert_eq!(direct, reconciled);
    }

    #[test]
    fn test_reconcile_follows_schema_order_not_sorted_order() {
        let schema = vec![
            FeatureColumn::new("z", sig("REFUSED")),
            FeatureColumn::new("a", sig("REFUSED")),
        ];
        let entries = vec![entry("x", &[("a", sig("REFUSED"))])];
        let matrix = FeatureMatrix::encode(&entries, Some(&schema)).unwrap();
        assert_eq!(matrix.columns()[0].test_case, "z");
        assert_eq!(matrix.rows()[0], vec![false, true]);
    }

    #[test]
    fn test_broken_schema_is_fatal() {
        let entries = vec![entry("x", &[("a", sig("REFUSED"))])];
        let column = FeatureColumn::new("a", sig("REFUSED"));

        let empty = FeatureMatrix::encode(&entries, Some(&[]));
        assert!(matches!(empty, Err(FingerprintError::SchemaMismatch(_))));

        let duplicated = FeatureMatrix::encode(&entries, Some(&[column.clone(), column]));
        assert!(matches!(duplicated, Err(FingerprintError::SchemaMismatch(_))));
    }

    #[test]
    fn test_select_and_flip() {
        let entries = vec![
            entry("a", &[("t1", sig("REFUSED"))]),
            entry("b", &[("t1", sig("NOERROR"))]),
        ];
        let matrix = FeatureMatrix::encode(&entries, None).unwrap();
        let second = matrix.select_rows(&[1]);
        assert_eq!(second.row_labels(), &["b".to_string()]);
        let flipped = matrix.with_flipped_column(0);
        assert_eq!(flipped.rows()[0][0], !matrix.rows()[0][0]);
        assert_eq!(matrix.to_f64_rows()[1].iter().sum::<f64>(), 1.0);
    }
}
