pub mod artifacts;
pub mod classifier;
pub mod corpus;
pub mod features;
pub mod merge;
pub mod training;

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FingerprintError, Result};
use crate::scanner::FingerprintEntry;
pub use artifacts::ArtifactPaths;
pub use classifier::{Classifier, DecisionTree};
pub use corpus::{read_corpus, Corpus, CorpusReader, Granularity};
pub use features::{FeatureColumn, FeatureMatrix, ReconcileReport};
pub use merge::{aggregate, composite_label, merge_labels, split_label, MergedLabelGroup};
pub use training::{train, PerformanceReport, TrainingOutcome};

/// A trained classifier together with the column order it was fitted on.
#[derive(Debug, Serialize, Deserialize)]
pub struct Model {
    pub classifier: DecisionTree,
    pub columns: Vec<FeatureColumn>,
    pub granularity: Option<Granularity>,
    pub trained_at: DateTime<Utc>,
}

impl Model {
    pub fn new(classifier: DecisionTree, columns: Vec<FeatureColumn>, granularity: Option<Granularity>) -> Self {
        Self {
            classifier,
            columns,
            granularity,
            trained_at: Utc::now(),
        }
    }

    /// Reject a model whose stored schema cannot be reconciled against.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(FingerprintError::SchemaMismatch(
                "model has no feature columns".to_string(),
            ));
        }
        if self.classifier.n_features() != self.columns.len() {
            return Err(FingerprintError::SchemaMismatch(format!(
                "classifier was fitted on {} features but {} columns are stored",
                self.classifier.n_features(),
                self.columns.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.columns.len());
        if let Some(duplicate) = self.columns.iter().find(|column| !seen.insert(*column)) {
            return Err(FingerprintError::SchemaMismatch(format!(
                "column {} is stored twice",
                duplicate
            )));
        }
        Ok(())
    }

    /// Encode `entries` against the stored schema and predict one label per entry.
    pub fn predict(&self, entries: &[FingerprintEntry]) -> Result<Vec<String>> {
        let features = FeatureMatrix::encode(entries, Some(&self.columns))?;
        self.classifier.predict(&features)
    }

    pub fn classes(&self) -> &[String] {
        self.classifier.classes()
    }

    /// Text dump of the fitted tree with splits named by their columns.
    pub fn render_tree(&self) -> Result<String> {
        self.classifier
            .render_text(&self.columns)
            .ok_or_else(|| FingerprintError::Classifier("tree structure cannot be rendered".to_string()))
    }
}

/// Test case names behind every column with non-zero importance, sorted.
pub fn important_test_cases(columns: &[FeatureColumn], importances: &[f64]) -> BTreeSet<String> {
    columns
        .iter()
        .zip(importances)
        .filter(|(_, &importance)| importance > 0.0)
        .map(|(column, _)| column.test_case.clone())
        .collect()
}
