use std::collections::BTreeSet;
use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::{
    DecisionTreeClassifier, DecisionTreeClassifierParameters,
};
use tracing::debug;

use super::features::{FeatureColumn, FeatureMatrix};
use crate::error::{FingerprintError, Result};

type Tree = DecisionTreeClassifier<f64, u32, DenseMatrix<f64>, Vec<u32>>;

/// Train/predict contract the rest of the pipeline is written against.
pub trait Classifier: Sized {
    /// Fit on `features` (one row per label) and return the model together
    /// with one importance score per feature column.
    fn train(features: &FeatureMatrix, labels: &[String]) -> Result<(Self, Vec<f64>)>;

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<String>>;

    fn n_features(&self) -> usize;
}

/// CART decision tree over one-hot signature columns.
#[derive(Serialize, Deserialize)]
pub struct DecisionTree {
    tree: Tree,
    classes: Vec<String>,
    n_features: usize,
}

impl fmt::Debug for DecisionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionTree")
            .field("classes", &self.classes)
            .field("n_features", &self.n_features)
            .finish()
    }
}

impl DecisionTree {
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict_indices(&self, features: &FeatureMatrix) -> Result<Vec<u32>> {
        let x = DenseMatrix::from_2d_vec(&features.to_f64_rows());
        self.tree
            .predict(&x)
            .map_err(|e| FingerprintError::Classifier(e.to_string()))
    }

    /// Node list and class ids as serialized by smartcore; `None` when the
    /// layout is not the one this walker understands.
    fn nodes(&self) -> Option<(Vec<SplitNode>, Vec<u32>)> {
        let mut value = serde_json::to_value(&self.tree).ok()?;
        let nodes: Vec<SplitNode> = serde_json::from_value(value.get_mut("nodes")?.take()).ok()?;
        let ids: Vec<u32> = match value.get_mut("classes") {
            Some(ids) => serde_json::from_value(ids.take()).ok()?,
            None => (0..self.classes.len() as u32).collect(),
        };
        if nodes.is_empty() {
            return None;
        }
        Some((nodes, ids))
    }

    /// Per-feature count of training rows routed through a split on that
    /// feature.
    fn split_importances(&self, features: &FeatureMatrix) -> Option<Vec<f64>> {
        let (nodes, _) = self.nodes()?;
        let mut scores = vec![0.0; self.n_features];
        for row in features.to_f64_rows() {
            let mut at = 0;
            for _ in 0..nodes.len() {
                let node = nodes.get(at)?;
                let Some((feature, threshold, yes, no)) = node.split() else {
                    break;
                };
                *scores.get_mut(feature)? += 1.0;
                at = if *row.get(feature)? <= threshold { yes } else { no };
            }
        }
        Some(scores)
    }

    /// Indented text dump of the fitted tree, one line per branch, with
    /// splits named after their feature columns.
    pub fn render_text(&self, columns: &[FeatureColumn]) -> Option<String> {
        let (nodes, ids) = self.nodes()?;
        let mut out = String::new();
        self.render_node(&nodes, &ids, columns, 0, 0, &mut out)?;
        Some(out)
    }

    fn render_node(
        &self,
        nodes: &[SplitNode],
        ids: &[u32],
        columns: &[FeatureColumn],
        at: usize,
        depth: usize,
        out: &mut String,
    ) -> Option<()> {
        if depth > nodes.len() {
            return None;
        }
        let node = nodes.get(at)?;
        let indent = "|   ".repeat(depth);
        match node.split() {
            Some((feature, _, yes, no)) => {
                let column = columns.get(feature)?;
                writeln!(out, "{}|--- {} absent", indent, column).ok()?;
                self.render_node(nodes, ids, columns, yes, depth + 1, out)?;
                writeln!(out, "{}|--- {} present", indent, column).ok()?;
                self.render_node(nodes, ids, columns, no, depth + 1, out)
            }
            None => {
                let id = *ids.get(node.output)?;
                let label = self.classes.get(id as usize)?;
                writeln!(out, "{}|--- class: {}", indent, label).ok()
            }
        }
    }

    /// How many training rows change prediction when each column is inverted.
    fn flip_importances(&self, features: &FeatureMatrix) -> Result<Vec<f64>> {
        let baseline = self.predict_indices(features)?;
        (0..features.n_cols())
            .map(|column| {
                let flipped = self.predict_indices(&features.with_flipped_column(column))?;
                Ok(baseline
                    .iter()
                    .zip(&flipped)
                    .filter(|(before, after)| before != after)
                    .count() as f64)
            })
            .collect()
    }
}

/// The parts of a serialized smartcore node needed to walk the tree.
#[derive(Debug, Deserialize)]
struct SplitNode {
    output: usize,
    split_feature: usize,
    split_value: Option<f64>,
    true_child: Option<usize>,
    false_child: Option<usize>,
}

impl SplitNode {
    /// Feature, threshold and (`<=`, `>`) children for an internal node.
    fn split(&self) -> Option<(usize, f64, usize, usize)> {
        Some((self.split_feature, self.split_value?, self.true_child?, self.false_child?))
    }
}

fn normalize(scores: &mut [f64]) {
    let total: f64 = scores.iter().sum();
    if total > 0.0 {
        for score in scores.iter_mut() {
            *score /= total;
        }
    }
}

impl Classifier for DecisionTree {
    fn train(features: &FeatureMatrix, labels: &[String]) -> Result<(Self, Vec<f64>)> {
        if features.n_rows() == 0 || features.n_cols() == 0 {
            return Err(FingerprintError::EmptyDataset(
                "no training rows or no feature columns".to_string(),
            ));
        }
        if labels.len() != features.n_rows() {
            return Err(FingerprintError::Classifier(format!(
                "{} labels for {} rows",
                labels.len(),
                features.n_rows()
            )));
        }

        let classes: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if classes.len() < 2 {
            return Err(FingerprintError::Classifier(format!(
                "need at least two distinct labels, got {}",
                classes.len()
            )));
        }
        let targets: Vec<u32> = labels
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or_default() as u32)
            .collect();

        let x = DenseMatrix::from_2d_vec(&features.to_f64_rows());
        let tree = DecisionTreeClassifier::fit(&x, &targets, DecisionTreeClassifierParameters::default())
            .map_err(|e| FingerprintError::Classifier(e.to_string()))?;

        let model = DecisionTree {
            tree,
            classes,
            n_features: features.n_cols(),
        };
        let mut importances = match model.split_importances(features) {
            Some(scores) => scores,
            None => {
                debug!("tree structure not inspectable, falling back to flip sensitivity");
                model.flip_importances(features)?
            }
        };
        normalize(&mut importances);
        Ok((model, importances))
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<String>> {
        if features.n_cols() != self.n_features {
            return Err(FingerprintError::SchemaMismatch(format!(
                "model expects {} columns, matrix has {}",
                self.n_features,
                features.n_cols()
            )));
        }
        if features.n_rows() == 0 {
            return Ok(Vec::new());
        }
        self.predict_indices(features)?
            .into_iter()
            .map(|index| {
                self.classes.get(index as usize).cloned().ok_or_else(|| {
                    FingerprintError::Classifier(format!("predicted unknown class {}", index))
                })
            })
            .collect()
    }

    fn n_features(&self) -> usize {
        self.n_features
    }
}
