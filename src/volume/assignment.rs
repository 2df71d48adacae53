use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{DetectedVolume, VolumeId, VolumeSpec};

/// How many volumes a new file gets and which volume types it prefers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentConfig {
    /// Volumes per file. Fewer are returned when fewer are available.
    pub count: usize,
    /// Most preferred first. Unlisted types rank after all listed ones.
    pub preferred_types: Vec<String>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            count: 1,
            preferred_types: Vec::new(),
        }
    }
}

impl AssignmentConfig {
    /// Request `count` volumes, preferring `preferred_types` in order.
    pub fn new(count: usize, preferred_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            count,
            preferred_types: preferred_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Select up to `config.count` non-drained volumes for a file.
///
/// Volumes are ranked by type preference, then by a hash of `seed` and the
/// volume's type and label. The same seed always yields the same selection,
/// while different seeds spread files evenly over equally preferred volumes.
pub fn assign<V: DetectedVolume>(
    volumes: &[Arc<V>],
    config: &AssignmentConfig,
    seed: &str,
) -> Vec<VolumeId> {
    let mut candidates = volumes
        .iter()
        .filter(|v| !v.is_drained())
        .map(|v| {
            let spec = v.spec();
            (preference(config, spec), stable_hash(seed, spec), v.id())
        })
        .collect::<Vec<_>>();
    candidates.sort();
    candidates
        .into_iter()
        .take(config.count)
        .map(|(_, _, id)| id.clone())
        .collect()
}

fn preference(config: &AssignmentConfig, spec: &VolumeSpec) -> usize {
    config
        .preferred_types
        .iter()
        .position(|t| *t == spec.volume_type)
        .unwrap_or(usize::MAX)
}

fn stable_hash(seed: &str, spec: &VolumeSpec) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(spec.volume_type.as_bytes());
    hasher.update(b"/");
    hasher.update(spec.label.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::volume::VolumeError;

    struct TestVolume {
        id: VolumeId,
        spec: VolumeSpec,
        drained: bool,
    }

    impl DetectedVolume for TestVolume {
        fn id(&self) -> &VolumeId {
            &self.id
        }

        fn spec(&self) -> &VolumeSpec {
            &self.spec
        }

        fn is_drained(&self) -> bool {
            self.drained
        }

        async fn close(&self) -> Result<(), VolumeError> {
            Ok(())
        }
    }

    fn volumes(names: &[&str], drained: &[&str]) -> Vec<Arc<TestVolume>> {
        names
            .iter()
            .map(|name| {
                let (volume_type, label) = name.split_once('/').expect("type/label");
                Arc::new(TestVolume {
                    id: VolumeId::new(*name),
                    spec: VolumeSpec::new("node", format!("/volumes/{name}"), volume_type, label),
                    drained: drained.contains(name),
                })
            })
            .collect()
    }

    const ALL: &[&str] = &["hdd/1", "hdd/2", "hdd/3", "ssd/1", "ssd/2", "top/1"];

    #[test]
    fn empty_input() {
        assert!(assign::<TestVolume>(&[], &AssignmentConfig::default(), "seed").is_empty());
    }

    #[test]
    fn deterministic_for_seed() {
        let all = volumes(ALL, &[]);
        let config = AssignmentConfig::new(3, ["missing"]);
        let first = assign(&all, &config, "2000-01-01T01:00:00.000Z");
        assert_eq!(first.len(), 3);
        assert_eq!(first, assign(&all, &config, "2000-01-01T01:00:00.000Z"));
    }

    #[test]
    fn preferred_types_come_first() {
        let all = volumes(ALL, &[]);
        let config = AssignmentConfig::new(4, ["ssd", "top"]);
        for seed in ["a", "b", "c", "d"] {
            let ids = assign(&all, &config, seed);
            let types = ids
                .iter()
                .map(|id| id.as_str().split('/').next().expect("type"))
                .collect::<Vec<_>>();
            assert_eq!(&types[..3], &["ssd", "ssd", "top"]);
            assert_eq!(types[3], "hdd");
        }
    }

    #[test]
    fn drained_volumes_are_never_selected() {
        let all = volumes(ALL, &["top/1"]);
        let config = AssignmentConfig::new(6, ["top"]);
        for i in 0..50 {
            let ids = assign(&all, &config, &format!("seed-{i}"));
            assert_eq!(ids.len(), 5);
            assert!(ids.iter().all(|id| id.as_str() != "top/1"));
        }
    }

    #[test]
    fn seeds_spread_over_equal_volumes() {
        let all = volumes(&["hdd/1", "hdd/2", "hdd/3"], &[]);
        let config = AssignmentConfig::new(1, ["hdd"]);
        let mut hits: HashMap<VolumeId, usize> = HashMap::new();
        for i in 0..300 {
            for id in assign(&all, &config, &format!("file-{i}")) {
                *hits.entry(id).or_default() += 1;
            }
        }
        assert_eq!(hits.len(), 3);
        assert!(hits.values().all(|n| *n > 50), "{hits:?}");
    }
}
