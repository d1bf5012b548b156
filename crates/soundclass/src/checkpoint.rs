//! Trained checkpoint: class table plus network weights, loaded from a model directory.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::network::{ClassifierNetwork, EMBEDDING_DIM};
use crate::weights::{TensorSource, WeightError, WeightStore};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid class table: {0}")]
    ClassTable(String),
    #[error(transparent)]
    Weights(#[from] WeightError),
    #[error("tensor {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("class table lists {labels} labels but the final layer produces {outputs} outputs")]
    ClassCountMismatch { labels: usize, outputs: usize },
}

fn classes_path(dir: &Path) -> PathBuf {
    dir.join("classes.json")
}

fn weights_path(dir: &Path) -> PathBuf {
    dir.join("model.safetensors")
}

/// Parse a JSON array of label strings.
pub fn parse_class_table(json: &str) -> Result<Vec<String>, CheckpointError> {
    let classes: Vec<String> =
        serde_json::from_str(json).map_err(|e| CheckpointError::ClassTable(e.to_string()))?;
    if classes.is_empty() {
        return Err(CheckpointError::ClassTable("no labels".to_string()));
    }
    Ok(classes)
}

/// Ordered class labels paired with an evaluation-mode network producing one logit per label.
#[derive(Debug)]
pub struct Checkpoint {
    classes: Vec<String>,
    network: ClassifierNetwork,
}

impl Checkpoint {
    /// Load `classes.json` and `model.safetensors` from `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref();
        let path = classes_path(dir);
        let json = std::fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let classes = parse_class_table(&json)?;
        let store = WeightStore::open(weights_path(dir))?;
        Self::from_parts(classes, &store)
    }

    /// Pair `classes` with weights from `source`.
    ///
    /// The label count is checked against `fc.weight` before any other tensor is read.
    pub fn from_parts(
        classes: Vec<String>,
        source: &dyn TensorSource,
    ) -> Result<Self, CheckpointError> {
        if classes.is_empty() {
            return Err(CheckpointError::ClassTable("no labels".to_string()));
        }
        let fc = source.tensor_f32("fc.weight")?;
        let [outputs, width] = fc.shape[..] else {
            return Err(CheckpointError::ShapeMismatch {
                name: "fc.weight".to_string(),
                expected: vec![classes.len(), EMBEDDING_DIM],
                found: fc.shape,
            });
        };
        if outputs != classes.len() {
            return Err(CheckpointError::ClassCountMismatch {
                labels: classes.len(),
                outputs,
            });
        }
        if width != EMBEDDING_DIM {
            return Err(CheckpointError::ShapeMismatch {
                name: "fc.weight".to_string(),
                expected: vec![outputs, EMBEDDING_DIM],
                found: fc.shape,
            });
        }

        let mut network = ClassifierNetwork::load(source, classes.len())?;
        network.eval();
        tracing::info!(classes = classes.len(), "checkpoint loaded");
        Ok(Self { classes, network })
    }

    #[must_use]
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    #[must_use]
    pub fn network(&self) -> &ClassifierNetwork {
        &self.network
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::conv::Mode;
    use crate::testing::synthetic_weights;
    use crate::weights::TensorF32;

    #[test]
    fn class_table_parsing() {
        assert_eq!(
            parse_class_table(r#"["dog", "rain"]"#).expect("parse"),
            vec!["dog".to_string(), "rain".to_string()]
        );
        assert!(matches!(parse_class_table("[]"), Err(CheckpointError::ClassTable(_))));
        assert!(matches!(parse_class_table("{\"a\":1}"), Err(CheckpointError::ClassTable(_))));
    }

    #[test]
    fn class_count_is_checked_before_other_tensors() {
        // Only the final layer is present; a mismatch must surface before anything is missing.
        let mut only_fc = HashMap::new();
        only_fc.insert(
            "fc.weight".to_string(),
            TensorF32::new(vec![50, EMBEDDING_DIM], vec![0.0; 50 * EMBEDDING_DIM]),
        );
        let labels: Vec<String> = (0..10).map(|i| format!("c{i}")).collect();
        match Checkpoint::from_parts(labels, &only_fc) {
            Err(CheckpointError::ClassCountMismatch { labels, outputs }) => {
                assert_eq!((labels, outputs), (10, 50));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_final_layer_is_a_shape_error() {
        let mut only_fc = HashMap::new();
        only_fc.insert("fc.weight".to_string(), TensorF32::new(vec![2, 4], vec![0.0; 8]));
        let err = Checkpoint::from_parts(vec!["a".into(), "b".into()], &only_fc)
            .expect_err("bad width");
        assert!(matches!(err, CheckpointError::ShapeMismatch { ref name, .. } if name == "fc.weight"));
    }

    #[test]
    fn loaded_network_is_in_eval_mode() {
        let weights = synthetic_weights(2, 9);
        let ckpt = Checkpoint::from_parts(vec!["dog_bark".into(), "rain".into()], &weights)
            .expect("load");
        assert_eq!(ckpt.classes(), ["dog_bark".to_string(), "rain".to_string()]);
        assert_eq!(ckpt.network().mode(), Mode::Eval);
        assert_eq!(ckpt.network().num_classes(), 2);
    }

    #[test]
    fn missing_directory_reports_path() {
        let err = Checkpoint::load_from_dir("/nonexistent/soundclass-model").expect_err("missing");
        assert!(err.to_string().contains("classes.json"), "{err}");
    }
}
