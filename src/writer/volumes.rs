use std::{path::Path, sync::Arc};

use super::{SliceWriter, Volume, VolumeConfig};
use crate::{
    error::MultiError,
    events::Events,
    volume::{assign, detect_volumes, AssignmentConfig, Collection, DetectError, VolumeId},
};

/// All writer volumes of one node.
pub struct Volumes {
    events: Events<SliceWriter>,
    collection: Collection<Volume>,
}

impl Volumes {
    /// Detect and open every `{type}/{label}` volume under `root`.
    pub async fn detect(
        node_id: &str,
        root: &Path,
        config: VolumeConfig,
    ) -> Result<Self, DetectError> {
        let events = Events::new();
        let collection = detect_volumes(node_id, root, |spec| {
            let config = config.clone();
            let events = events.clone();
            async move { Volume::open(spec, config, &events).await }
        })
        .await?;
        Ok(Self { events, collection })
    }

    /// Listeners applied to every writer on every volume.
    pub fn events(&self) -> &Events<SliceWriter> {
        &self.events
    }

    /// Every volume, ordered by ID.
    pub fn all(&self) -> Vec<Arc<Volume>> {
        self.collection.all()
    }

    /// Volume with the given ID, if detected.
    pub fn get(&self, id: &VolumeId) -> Option<Arc<Volume>> {
        self.collection.get(id)
    }

    /// Volumes whose drain marker is present.
    pub fn drained(&self) -> Vec<Arc<Volume>> {
        self.collection.drained()
    }

    /// Volumes for a new file, see [`assign`].
    pub fn assign_for(&self, config: &AssignmentConfig, seed: &str) -> Vec<Arc<Volume>> {
        assign(&self.collection.all(), config, seed)
            .iter()
            .filter_map(|id| self.collection.get(id))
            .collect()
    }

    /// Close every volume, collecting their errors.
    pub async fn close(&self) -> Result<(), MultiError> {
        self.collection.close().await
    }
}
