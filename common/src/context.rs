use std::sync::Arc;

use crate::{
    probe::ArtifactProbe,
    store::{FsMarkerStore, MarkerStore},
    unit::RunLayout,
    worker::WorkerIdentity,
};

/// Dependencias compartidas por reclamo, pipeline y tracker de una corrida.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<dyn MarkerStore>,
    pub layout: RunLayout,
    pub identity: WorkerIdentity,
    pub probe: ArtifactProbe,
}

impl RunContext {
    pub fn new(
        store: Arc<dyn MarkerStore>,
        layout: RunLayout,
        identity: WorkerIdentity,
        probe: ArtifactProbe,
    ) -> Self {
        Self {
            store,
            layout,
            identity,
            probe,
        }
    }

    /// Marcadores en el filesystem y sólo artefactos locales.
    pub fn local(layout: RunLayout, identity: WorkerIdentity) -> Self {
        Self::new(
            Arc::new(FsMarkerStore::new()),
            layout,
            identity,
            ArtifactProbe::local(),
        )
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("layout", &self.layout)
            .field("identity", &self.identity)
            .field("probe", &self.probe)
            .finish()
    }
}
