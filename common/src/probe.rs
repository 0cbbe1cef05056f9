use std::sync::Arc;

use crate::{error::ObjectStoreError, object_store::ObjectStore, unit::Artifact};

/// Resuelve la existencia de artefactos locales y remotos.
#[derive(Clone, Default)]
pub struct ArtifactProbe {
    objects: Option<Arc<dyn ObjectStore>>,
}

impl ArtifactProbe {
    /// Sólo archivos locales; consultar un objeto remoto es un error.
    pub fn local() -> Self {
        Self { objects: None }
    }

    pub fn with_objects(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects: Some(objects),
        }
    }

    pub fn objects(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.objects.as_ref()
    }

    pub fn exists(&self, artifact: &Artifact) -> Result<bool, ObjectStoreError> {
        match artifact {
            Artifact::File(path) => Ok(path.exists()),
            Artifact::Object(key) => match &self.objects {
                Some(store) => store.exists(key),
                None => Err(ObjectStoreError::NotConfigured(key.clone())),
            },
        }
    }

    /// `true` si todos existen. Una lista vacía nunca cuenta como "todo existe".
    pub fn all_exist(&self, artifacts: &[Artifact]) -> Result<bool, ObjectStoreError> {
        if artifacts.is_empty() {
            return Ok(false);
        }
        for artifact in artifacts {
            if !self.exists(artifact)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn missing<'a>(&self, artifacts: &'a [Artifact]) -> Result<Vec<&'a Artifact>, ObjectStoreError> {
        let mut out = Vec::new();
        for artifact in artifacts {
            if !self.exists(artifact)? {
                out.push(artifact);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ArtifactProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactProbe")
            .field("objects", &self.objects.is_some())
            .finish()
    }
}
