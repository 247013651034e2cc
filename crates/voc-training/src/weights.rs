//! Weight snapshot persistence and name-matched copying.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voc_core::{Error, Result};

use crate::network::{Blob, Network};

/// File suffix shared by all weight snapshots.
pub const SNAPSHOT_SUFFIX: &str = ".weights.json";

/// Parameter blobs for one named layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer name
    pub name: String,
    /// Parameter blobs, weight first
    pub blobs: Vec<Blob>,
}

/// A persisted set of network parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    /// Name of the network the weights came from
    pub network: String,
    /// Solver iteration at capture time
    pub iteration: usize,
    /// Capture timestamp
    pub timestamp: String,
    /// Parameterized layers only
    pub layers: Vec<LayerRecord>,
}

impl WeightSnapshot {
    /// Captures the parameterized layers of a network.
    pub fn from_network(net: &Network, iteration: usize) -> Self {
        let layers = net
            .layers
            .iter()
            .filter(|l| !l.blobs.is_empty())
            .map(|l| LayerRecord {
                name: l.name.clone(),
                blobs: l.blobs.clone(),
            })
            .collect();

        Self {
            network: net.spec.name.clone(),
            iteration,
            timestamp: chrono::Utc::now().to_rfc3339(),
            layers,
        }
    }

    /// Saves the snapshot as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        tracing::debug!("weight snapshot saved to {}", path.display());
        Ok(())
    }

    /// Loads a snapshot from JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::NotFound(format!("weight snapshot {}: {e}", path.display()))
        })?;
        let snapshot: WeightSnapshot = serde_json::from_str(&json)?;
        Ok(snapshot)
    }

    /// Copies stored blobs into a network by layer-name matching.
    ///
    /// Layers present on only one side are skipped silently; partial
    /// overlap is expected after clipping or adding output layers. A
    /// shape mismatch on a matched layer is an error. Returns the number
    /// of layers copied.
    pub fn copy_into(&self, net: &mut Network) -> Result<usize> {
        let mut copied = 0;
        for record in &self.layers {
            let Some(layer) = net.layer_mut(&record.name) else {
                continue;
            };
            if layer.blobs.len() != record.blobs.len() {
                return Err(Error::Network(format!(
                    "layer {:?} has {} blobs, snapshot has {}",
                    record.name,
                    layer.blobs.len(),
                    record.blobs.len()
                )));
            }
            for (blob, stored) in layer.blobs.iter_mut().zip(record.blobs.iter()) {
                if blob.shape != stored.shape {
                    return Err(Error::Network(format!(
                        "layer {:?} blob shape {:?} does not match snapshot shape {:?}",
                        record.name, blob.shape, stored.shape
                    )));
                }
                blob.data.clone_from(&stored.data);
            }
            copied += 1;
        }
        Ok(copied)
    }
}

/// Resolves the weight source for an evaluation pass.
///
/// Preference order: a snapshot in the output directory (a trained run),
/// then the supplied pretrained weights, then nothing. Running without
/// any source is a deliberate baseline mode, warned but never an error.
pub fn resolve_eval_weights(
    output_dir: &Path,
    pretrained: &Path,
) -> Result<Option<WeightSnapshot>> {
    if let Some(path) = find_snapshot(output_dir)? {
        tracing::info!("evaluating snapshot {}", path.display());
        return Ok(Some(WeightSnapshot::load(&path)?));
    }
    if pretrained.exists() {
        tracing::info!("evaluating pretrained weights {}", pretrained.display());
        return Ok(Some(WeightSnapshot::load(pretrained)?));
    }
    tracing::warn!("no weight snapshot available, evaluating freshly initialized parameters");
    Ok(None)
}

/// Finds the first weight snapshot in a directory, in name order.
///
/// With the standard names, `final{SNAPSHOT_SUFFIX}` sorts before
/// `snap{SNAPSHOT_SUFFIX}`, so a completed run's final weights win.
pub fn find_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SNAPSHOT_SUFFIX))
        })
        .collect();

    snapshots.sort();
    Ok(snapshots.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LayerKind, LayerSpec, NetworkSpec};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn two_fc_spec(first: &str, second: &str) -> NetworkSpec {
        NetworkSpec {
            name: "pair".to_string(),
            input_dim: [1, 3, 4, 4],
            layers: vec![
                LayerSpec {
                    name: first.to_string(),
                    kind: LayerKind::InnerProduct { num_output: 6 },
                },
                LayerSpec {
                    name: second.to_string(),
                    kind: LayerKind::InnerProduct { num_output: 2 },
                },
            ],
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("final{SNAPSHOT_SUFFIX}"));

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let net = Network::from_spec(&two_fc_spec("fc6", "fc7"), &mut rng).unwrap();
        let snapshot = WeightSnapshot::from_network(&net, 5);
        snapshot.save(&path).unwrap();

        let loaded = WeightSnapshot::load(&path).unwrap();
        assert_eq!(loaded.iteration, 5);
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.layers[0].blobs[0].data, net.layers[0].blobs[0].data);
    }

    #[test]
    fn test_copy_tolerates_partial_overlap() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let source = Network::from_spec(&two_fc_spec("fc6", "fc7"), &mut rng).unwrap();
        let snapshot = WeightSnapshot::from_network(&source, 0);

        // Target shares fc6 but replaces fc7 with a new head.
        let mut target = Network::from_spec(&two_fc_spec("fc6", "fc8_cls"), &mut rng).unwrap();
        let before_head = target.layer("fc8_cls").unwrap().blobs[0].data.clone();

        let copied = snapshot.copy_into(&mut target).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(
            target.layer("fc6").unwrap().blobs[0].data,
            source.layer("fc6").unwrap().blobs[0].data
        );
        // The unmatched head keeps its own initialization.
        assert_eq!(target.layer("fc8_cls").unwrap().blobs[0].data, before_head);
    }

    #[test]
    fn test_copy_rejects_shape_mismatch() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let source = Network::from_spec(&two_fc_spec("fc6", "fc7"), &mut rng).unwrap();
        let snapshot = WeightSnapshot::from_network(&source, 0);

        let mut other_spec = two_fc_spec("fc6", "fc7");
        other_spec.layers[0].kind = LayerKind::InnerProduct { num_output: 9 };
        let mut target = Network::from_spec(&other_spec, &mut rng).unwrap();

        assert!(snapshot.copy_into(&mut target).is_err());
    }

    #[test]
    fn test_resolve_eval_weights_preference_order() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        std::fs::create_dir_all(&output_dir).unwrap();
        let pretrained = dir.path().join(format!("pre{SNAPSHOT_SUFFIX}"));

        // Nothing anywhere: baseline mode.
        assert!(resolve_eval_weights(&output_dir, &pretrained)
            .unwrap()
            .is_none());

        // Only pretrained weights exist.
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let net = Network::from_spec(&two_fc_spec("fc6", "fc7"), &mut rng).unwrap();
        WeightSnapshot::from_network(&net, 0).save(&pretrained).unwrap();
        let resolved = resolve_eval_weights(&output_dir, &pretrained)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.iteration, 0);

        // A trained snapshot in the output directory wins.
        WeightSnapshot::from_network(&net, 77)
            .save(&output_dir.join(format!("final{SNAPSHOT_SUFFIX}")))
            .unwrap();
        let resolved = resolve_eval_weights(&output_dir, &pretrained)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.iteration, 77);
    }

    #[test]
    fn test_find_snapshot_prefers_final() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let net = Network::from_spec(&two_fc_spec("fc6", "fc7"), &mut rng).unwrap();
        let snapshot = WeightSnapshot::from_network(&net, 0);

        assert_eq!(find_snapshot(dir.path()).unwrap(), None);

        snapshot
            .save(&dir.path().join(format!("snap{SNAPSHOT_SUFFIX}")))
            .unwrap();
        snapshot
            .save(&dir.path().join(format!("final{SNAPSHOT_SUFFIX}")))
            .unwrap();
        std::fs::write(dir.path().join("log.txt"), "not a snapshot").unwrap();

        let found = find_snapshot(dir.path()).unwrap().unwrap();
        assert!(found.ends_with(format!("final{SNAPSHOT_SUFFIX}")));
    }
}
