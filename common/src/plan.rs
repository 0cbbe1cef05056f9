//! Qué etapas corre cada unidad y cuáles son sus salidas finales.

use std::sync::Arc;

use crate::{
    config::ApplyConfig,
    error::ConfigError,
    object_store::ObjectStore,
    operations::{polygonize, threshold_mask, CommandOperation, CommandSpec, DownloadInputs, UploadOutputs},
    stage::{Commit, Stage, StageOperation},
    unit::{Artifact, RunLayout, WorkUnit},
};

/// Arma el pipeline de una unidad.
///
/// Separado del runner para poder probar el protocolo con operaciones falsas.
pub trait StagePlanner: Send + Sync {
    fn stages_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Stage>;

    /// Salidas cuya existencia conjunta significa "unidad terminada".
    ///
    /// No incluye copias locales de entradas: borrarlas no invalida la unidad.
    fn deliverables_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Artifact>;
}

/// Pipeline estándar de aplicación del modelo:
///
/// ```text
/// [download] -> infer -> classify -> mask -> vectorize -> [publish]
/// ```
pub struct ApplicationPlan {
    inference: Arc<dyn StageOperation>,
    classify: Arc<dyn StageOperation>,
    mask: Arc<dyn StageOperation>,
    vectorize: Arc<dyn StageOperation>,
    objects: Option<Arc<dyn ObjectStore>>,
    upload_prefix: Option<String>,
}

impl ApplicationPlan {
    pub fn new(
        inference: CommandSpec,
        classify: CommandSpec,
        gdal_calc: &str,
        gdal_polygonize: &str,
        min_reef: i32,
    ) -> Self {
        Self {
            inference: Arc::new(CommandOperation::new(inference)),
            classify: Arc::new(CommandOperation::new(classify)),
            mask: Arc::new(threshold_mask(gdal_calc, min_reef)),
            vectorize: Arc::new(polygonize(gdal_polygonize)),
            objects: None,
            upload_prefix: None,
        }
    }

    pub fn from_config(
        config: &ApplyConfig,
        objects: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self, ConfigError> {
        if config.upload_prefix.is_some() && objects.is_none() {
            return Err(ConfigError::Invalid(
                "upload_prefix configurado sin object store".into(),
            ));
        }
        let mut plan = Self::new(
            config.commands.inference.clone(),
            config.commands.classify.clone(),
            &config.tools.gdal_calc,
            &config.tools.gdal_polygonize,
            config.encodings.min_reef(),
        );
        plan.objects = objects;
        plan.upload_prefix = config.upload_prefix.clone();
        Ok(plan)
    }

    /// Reemplaza las operaciones del modelo (tests, herramientas embebidas).
    pub fn with_operations(
        mut self,
        inference: Arc<dyn StageOperation>,
        classify: Arc<dyn StageOperation>,
        mask: Arc<dyn StageOperation>,
        vectorize: Arc<dyn StageOperation>,
    ) -> Self {
        self.inference = inference;
        self.classify = classify;
        self.mask = mask;
        self.vectorize = vectorize;
        self
    }

    pub fn with_objects(mut self, objects: Arc<dyn ObjectStore>, upload_prefix: Option<String>) -> Self {
        self.objects = Some(objects);
        self.upload_prefix = upload_prefix;
        self
    }

    /// Entradas locales (principal + contexto) y, si hacen falta, los pares de descarga.
    fn local_inputs(&self, unit: &WorkUnit, layout: &RunLayout) -> (Vec<Artifact>, Vec<(Artifact, Artifact)>) {
        let mut locals = Vec::new();
        let mut downloads = Vec::new();

        let primary_stem = unit.primary.stem().unwrap_or_else(|| unit.key.clone());
        let sources = std::iter::once((&unit.primary, primary_stem, "focal")).chain(
            unit.context
                .iter()
                .filter_map(|a| a.stem().map(|s| (a, s, "context"))),
        );
        for (artifact, stem, suffix) in sources {
            match artifact {
                Artifact::File(_) => locals.push(artifact.clone()),
                Artifact::Object(_) => {
                    let local = Artifact::File(layout.input_copy(unit, &stem, suffix, "tif"));
                    downloads.push((artifact.clone(), local.clone()));
                    locals.push(local);
                }
            }
        }
        (locals, downloads)
    }

    fn rasters(&self, unit: &WorkUnit, layout: &RunLayout) -> [Artifact; 4] {
        [
            Artifact::File(layout.output_file(unit, "prob", "tif")),
            Artifact::File(layout.output_file(unit, "mle", "tif")),
            Artifact::File(layout.output_file(unit, "reefs", "tif")),
            Artifact::File(layout.output_file(unit, "reefs", "shp")),
        ]
    }

    /// `{prefix}/[{region}/]{unit}_{suffix}_{version}.tif`
    fn published(&self, unit: &WorkUnit, layout: &RunLayout) -> Option<[Artifact; 2]> {
        let prefix = self.upload_prefix.as_deref()?.trim_end_matches('/');
        let dir = match &unit.region {
            Some(region) => format!("{prefix}/{region}"),
            None => prefix.to_string(),
        };
        let key = |suffix: &str| {
            Artifact::Object(format!("{}/{}_{}_{}.tif", dir, unit.key, suffix, layout.version()))
        };
        Some([key("prob"), key("mle")])
    }
}

impl StagePlanner for ApplicationPlan {
    fn stages_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Stage> {
        let (locals, downloads) = self.local_inputs(unit, layout);
        let [prob, mle, reefs, shapes] = self.rasters(unit, layout);
        let mut stages = Vec::new();

        if let (Some(store), false) = (&self.objects, downloads.is_empty()) {
            let (remote, local): (Vec<_>, Vec<_>) = downloads.into_iter().unzip();
            stages.push(
                Stage::new("download", Arc::new(DownloadInputs::new(Arc::clone(store))))
                    .inputs(remote)
                    .outputs(local),
            );
        }

        stages.push(
            Stage::new("infer", Arc::clone(&self.inference))
                .inputs(locals)
                .outputs([prob.clone()]),
        );
        stages.push(
            Stage::new("classify", Arc::clone(&self.classify))
                .inputs([prob.clone()])
                .outputs([mle.clone()]),
        );
        stages.push(
            Stage::new("mask", Arc::clone(&self.mask))
                .inputs([mle.clone()])
                .outputs([reefs.clone()]),
        );
        // gdal_polygonize genera .dbf/.shx/.prj al lado del .shp
        stages.push(
            Stage::new("vectorize", Arc::clone(&self.vectorize))
                .inputs([reefs])
                .outputs([shapes])
                .commit(Commit::Direct),
        );

        if let (Some(store), Some(keys)) = (&self.objects, self.published(unit, layout)) {
            stages.push(
                Stage::new("publish", Arc::new(UploadOutputs::new(Arc::clone(store))))
                    .inputs([prob, mle])
                    .outputs(keys),
            );
        }
        stages
    }

    fn deliverables_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Artifact> {
        let mut out: Vec<Artifact> = self.rasters(unit, layout).into();
        if self.objects.is_some() {
            if let Some(keys) = self.published(unit, layout) {
                out.extend(keys);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object_store::LocalObjectStore, unit::VersionTag};

    fn plan() -> ApplicationPlan {
        ApplicationPlan::new(
            CommandSpec::new("apply_model", ["{inputs}", "{output}"]),
            CommandSpec::new("calc_mle", ["{input}", "{output}"]),
            "gdal_calc.py",
            "gdal_polygonize.py",
            3,
        )
    }

    fn layout() -> RunLayout {
        RunLayout::new("/out", "cfg", "apply", VersionTag::new("v1").unwrap())
    }

    fn names(stages: &[Stage]) -> Vec<&str> {
        stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn unidad_local_no_descarga_ni_publica() {
        let unit = WorkUnit::new("reef_a", Artifact::file("/eval/reef_a/features.vrt"));
        let stages = plan().stages_for(&unit, &layout());

        assert_eq!(names(&stages), vec!["infer", "classify", "mask", "vectorize"]);
        assert_eq!(stages[0].inputs, vec![Artifact::file("/eval/reef_a/features.vrt")]);
        assert_eq!(
            stages[1].outputs,
            vec![Artifact::file("/out/cfg/v1/reef_a/reef_a_mle_v1.tif")]
        );
        assert_eq!(stages[3].commit, Commit::Direct);
        assert_eq!(plan().deliverables_for(&unit, &layout()).len(), 4);
    }

    #[test]
    fn tile_remoto_descarga_contexto_y_publica() {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new("/bucket"));
        let plan = plan().with_objects(store, Some("applied/".into()));

        let mut unit = WorkUnit::new(
            "L15-0001E-0001N",
            Artifact::object("mosaic/oceania/L15-0001E-0001N.tif"),
        )
        .with_region("oceania");
        unit.context = vec![Artifact::object("mosaic/oceania/L15-0002E-0001N.tif")];

        let stages = plan.stages_for(&unit, &layout());
        assert_eq!(
            names(&stages),
            vec!["download", "infer", "classify", "mask", "vectorize", "publish"]
        );
        assert_eq!(stages[0].inputs.len(), 2);
        assert_eq!(
            stages[0].outputs[1],
            Artifact::file("/out/cfg/v1/oceania/L15-0001E-0001N/L15-0002E-0001N_context.tif")
        );
        // infer consume las copias locales
        assert_eq!(stages[1].inputs, stages[0].outputs);
        assert_eq!(
            stages[5].outputs[0],
            Artifact::object("applied/oceania/L15-0001E-0001N_prob_v1.tif")
        );

        let deliverables = plan.deliverables_for(&unit, &layout());
        assert_eq!(deliverables.len(), 6);
        assert!(!deliverables.contains(&stages[0].outputs[0]));
    }
}
