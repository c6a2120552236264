use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::info;

use super::classifier::{Classifier, DecisionTree};
use super::corpus::Granularity;
use super::features::FeatureMatrix;
use super::merge::{aggregate, split_label, MergedLabelGroup, LABEL_SEPARATOR};
use super::{important_test_cases, Model};
use crate::config::TrainConfig;
use crate::error::{FingerprintError, Result};
use crate::scanner::FingerprintEntry;

/// Summary written next to the model after training.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceReport {
    /// `None` when nothing was held out.
    pub accuracy: Option<f64>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub features: usize,
    pub important_features: usize,
    pub test_cases: usize,
    pub important_test_cases: usize,
    pub versions: usize,
    pub individual_labels: usize,
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accuracy {
            Some(accuracy) => writeln!(f, "Accuracy: {:.4}", accuracy)?,
            None => writeln!(f, "Accuracy: n/a")?,
        }
        writeln!(f, "  Training rows: {}", self.train_rows)?;
        writeln!(f, "  Held-out rows: {}", self.test_rows)?;
        writeln!(f, "---")?;
        writeln!(f, "The total number of features: {}", self.features)?;
        writeln!(f, "  Important features: {}", self.important_features)?;
        writeln!(f, "  Not important features: {}", self.features - self.important_features)?;
        writeln!(f, "---")?;
        writeln!(f, "The total number of testcases: {}", self.test_cases)?;
        writeln!(f, "  Important testcases: {}", self.important_test_cases)?;
        writeln!(
            f,
            "  Not important testcases: {}",
            self.test_cases - self.important_test_cases
        )?;
        writeln!(f, "---")?;
        writeln!(f, "All versions: {}", self.versions)?;
        writeln!(f, "  Individual versions: {}", self.individual_labels)
    }
}

pub struct TrainingOutcome {
    pub model: Model,
    pub important: BTreeSet<String>,
    pub report: PerformanceReport,
    pub groups: Vec<MergedLabelGroup>,
}

/// Indices of the held-out rows and the training rows, shuffled with `seed`.
fn split_indices(rows: usize, holdout_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..rows).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let holdout = ((rows as f64) * holdout_fraction.clamp(0.0, 1.0)).ceil() as usize;
    let holdout = holdout.min(rows.saturating_sub(1));
    let train = indices.split_off(holdout);
    (indices, train)
}

/// Merge indistinguishable labels, encode, fit, and evaluate on a held-out share.
pub fn train(
    entries: Vec<FingerprintEntry>,
    granularity: Option<Granularity>,
    config: &TrainConfig,
) -> Result<TrainingOutcome> {
    if entries.is_empty() {
        return Err(FingerprintError::EmptyDataset("corpus has no entries".to_string()));
    }

    let (mapping, groups) = aggregate(&entries);
    for group in &groups {
        info!("merged {} indistinguishable labels into {}", group.members.len(), group.name);
    }
    let labels: Vec<String> = entries
        .iter()
        .map(|entry| mapping.get(&entry.label).cloned().unwrap_or_else(|| entry.label.clone()))
        .collect();

    let features = FeatureMatrix::encode(&entries, None)?;
    let (test_rows, train_rows) = split_indices(features.n_rows(), config.holdout_fraction, config.seed);
    let pick = |indices: &[usize]| indices.iter().map(|&i| labels[i].clone()).collect::<Vec<_>>();

    let train_matrix = features.select_rows(&train_rows);
    let (classifier, importances) = DecisionTree::train(&train_matrix, &pick(&train_rows))?;

    let accuracy = if test_rows.is_empty() {
        None
    } else {
        let predicted = classifier.predict(&features.select_rows(&test_rows))?;
        let correct = predicted
            .iter()
            .zip(pick(&test_rows))
            .filter(|(predicted, actual)| *predicted == actual)
            .count();
        Some(correct as f64 / test_rows.len() as f64)
    };

    let important = important_test_cases(features.columns(), &importances);
    let all_cases: BTreeSet<&str> = features
        .columns()
        .iter()
        .map(|column| column.test_case.as_str())
        .collect();
    let distinct: BTreeSet<&String> = labels.iter().collect();
    let versions: BTreeSet<String> = distinct.iter().flat_map(|label| split_label(label)).collect();

    let report = PerformanceReport {
        accuracy,
        train_rows: train_rows.len(),
        test_rows: test_rows.len(),
        features: features.n_cols(),
        important_features: importances.iter().filter(|&&score| score > 0.0).count(),
        test_cases: all_cases.len(),
        important_test_cases: important.len(),
        versions: versions.len(),
        individual_labels: distinct
            .iter()
            .filter(|label| !label.contains(LABEL_SEPARATOR))
            .count(),
    };
    info!(
        "trained on {} rows, {} of {} test cases important",
        report.train_rows, report.important_test_cases, report.test_cases
    );

    Ok(TrainingOutcome {
        model: Model::new(classifier, features.columns().to_vec(), granularity),
        important,
        report,
        groups,
    })
}
