use std::{path::Path, sync::Arc};

use super::{SliceReader, Volume, VolumeConfig};
use crate::{
    error::MultiError,
    events::Events,
    volume::{detect_volumes, Collection, DetectError, VolumeId},
};

/// All reader volumes of one node.
pub struct Volumes {
    events: Events<SliceReader>,
    collection: Collection<Volume>,
}

impl Volumes {
    /// Detect and open every `{type}/{label}` volume under `root`, waiting
    /// for each identity file as configured.
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

    /// Listeners applied to every reader on every volume.
    pub fn events(&self) -> &Events<SliceReader> {
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

    /// Volumes whose drain marker is present right now.
    pub fn drained(&self) -> Vec<Arc<Volume>> {
        self.collection.drained()
    }

    /// Close every volume, collecting their errors.
    pub async fn close(&self) -> Result<(), MultiError> {
        self.collection.close().await
    }
}
