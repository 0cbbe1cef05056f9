//! Armado de una corrida a partir de la configuración.
//!
//! Worker y cliente comparten esto: mismo layout, mismo catálogo y mismo
//! pipeline, así el cliente ve exactamente lo que ven los workers.

use chrono::{DateTime, Utc};
use std::{path::Path, sync::Arc};

use crate::{
    claim::ClaimPolicy,
    config::{ApplyConfig, SourceConfig},
    context::RunContext,
    enumerate::{
        require_auxiliary, DirCatalog, DirectoryEnumerator, Enumeration, ObjectCatalog, TileEnumerator,
        TileNameParser,
    },
    error::{ConfigError, SessionError},
    object_store::ObjectStore,
    plan::{ApplicationPlan, StagePlanner},
    probe::ArtifactProbe,
    store::FsMarkerStore,
    unit::{RunLayout, VersionTag},
    worker::WorkerIdentity,
};

pub struct RunSession {
    pub config: ApplyConfig,
    pub ctx: RunContext,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl RunSession {
    /// Construye el object store (si hay) una sola vez y lo inyecta en el contexto.
    pub fn open(
        config: ApplyConfig,
        version: VersionTag,
        identity: WorkerIdentity,
        credentials: Option<&Path>,
    ) -> Result<Self, SessionError> {
        let layout = RunLayout::new(&config.output_root, &config.config_name, &config.run_name, version);

        let objects = match &config.object_store {
            Some(store) => {
                let creds = config.resolve_credentials(credentials)?;
                Some(store.connect(creds.as_deref())?)
            }
            None => None,
        };
        let probe = objects
            .clone()
            .map(ArtifactProbe::with_objects)
            .unwrap_or_default();
        let ctx = RunContext::new(Arc::new(FsMarkerStore::new()), layout, identity, probe);

        Ok(Self { config, ctx, objects })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.ctx.layout
    }

    pub fn objects(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.objects.as_ref()
    }

    /// `recalculate_since`: época del recálculo, `None` en una corrida normal.
    pub fn claim_policy(&self, recalculate_since: Option<DateTime<Utc>>) -> ClaimPolicy {
        ClaimPolicy {
            max_age: self.config.max_claim_age(),
            recalculate_since,
        }
    }

    pub fn planner(&self) -> Result<Arc<dyn StagePlanner>, ConfigError> {
        Ok(Arc::new(ApplicationPlan::from_config(&self.config, self.objects.clone())?))
    }

    /// Catálogo de la corrida con el chequeo de dataset auxiliar aplicado.
    pub fn enumerate(&self) -> Result<Enumeration, SessionError> {
        let enumeration = match &self.config.source {
            SourceConfig::Tiles {
                directory,
                prefix,
                exclude_regions,
                pattern,
            } => {
                let catalog: Arc<dyn crate::enumerate::Catalog> = match (directory, prefix, &self.objects) {
                    (Some(dir), _, _) => Arc::new(DirCatalog::new(dir)),
                    (None, Some(prefix), Some(store)) => Arc::new(ObjectCatalog::new(Arc::clone(store), prefix)),
                    _ => {
                        return Err(ConfigError::Invalid(
                            "source de tiles sin directory ni object store para prefix".into(),
                        )
                        .into())
                    }
                };
                TileEnumerator::new(catalog, TileNameParser::new(pattern)?)
                    .exclude_regions(exclude_regions.iter().cloned())
                    .enumerate()?
            }
            SourceConfig::Directories { root, primary_file } => {
                DirectoryEnumerator::new(root, primary_file.as_str()).enumerate()?
            }
        };

        match &self.config.auxiliary {
            Some(aux) => Ok(require_auxiliary(
                enumeration,
                &DirCatalog::new(&aux.directory),
                &aux.suffix,
            )?),
            None => Ok(enumeration),
        }
    }
}

impl std::fmt::Debug for RunSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSession")
            .field("config", &self.config.config_name)
            .field("ctx", &self.ctx)
            .field("objects", &self.objects.is_some())
            .finish()
    }
}
