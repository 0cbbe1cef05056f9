//! Ejecución secuencial de las etapas de una unidad.
//!
//! Cada etapa es re-entrante por inspección de salidas: si todas sus salidas
//! declaradas existen, no se ejecuta. Así, volver a correr una unidad que
//! quedó a medias sólo rehace lo que falta.

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::{
    error::{OperationError, StageFailure},
    probe::ArtifactProbe,
    stage::{Commit, Stage, StageIo},
    unit::{Artifact, VersionTag, WorkUnit},
};

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Saltear etapas cuyas salidas ya existen (desactivado al recalcular).
    pub skip_existing: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Ruta temporal de una salida: `A_prob_v1.tif` -> `A_prob_v1.partial.tif`.
///
/// Se conserva la extensión porque las herramientas GDAL eligen el driver por ella.
pub fn partial_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    path.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Corre `stages` en orden sobre `unit`.
///
/// Ante la primera falla se aborta: no corre ninguna etapa posterior y las
/// salidas de las etapas anteriores quedan en disco para el próximo intento.
pub fn run_pipeline(
    unit: &WorkUnit,
    stages: &[Stage],
    version: &VersionTag,
    probe: &ArtifactProbe,
    options: PipelineOptions,
) -> Result<PipelineReport, StageFailure> {
    let mut report = PipelineReport::default();

    for (idx, stage) in stages.iter().enumerate() {
        let fail = |cause: OperationError| StageFailure {
            unit: unit.key.clone(),
            stage: stage.name.clone(),
            cause,
        };

        // 1) ¿Ya están todas las salidas? Una salida con parcial pendiente no cuenta
        if options.skip_existing && !stage.outputs.is_empty() {
            let done = probe.all_exist(&stage.outputs).map_err(|e| fail(e.into()))?;
            if done && !interrupted(&stage.outputs) {
                debug!(unit = %unit.key, stage = %stage.name, "salteando etapa: salidas presentes");
                report.skipped.push(stage.name.clone());
                continue;
            }
            if done {
                warn!(unit = %unit.key, stage = %stage.name, "salidas de un intento interrumpido, se rehace la etapa");
            }
        }

        // 2) Precondiciones: todas las entradas deben existir
        let missing = probe.missing(&stage.inputs).map_err(|e| fail(e.into()))?;
        if let Some(first) = missing.first() {
            return Err(fail(OperationError::MissingInput(first.to_string())));
        }

        // 3) Destinos de escritura
        let targets = prepare_targets(stage).map_err(fail)?;

        info!(
            unit = %unit.key,
            stage = %stage.name,
            "ejecutando etapa {}/{}",
            idx + 1,
            stages.len()
        );
        let io = StageIo {
            unit,
            version,
            inputs: &stage.inputs,
            outputs: &targets,
        };

        // 4) Ejecutar y publicar las salidas
        if let Err(cause) = stage.operation().run(&io) {
            discard_targets(stage, &targets);
            return Err(fail(cause));
        }
        commit_targets(stage, &targets).map_err(fail)?;
        report.executed.push(stage.name.clone());
    }

    Ok(report)
}

/// `true` si alguna salida local tiene su parcial en disco: un intento
/// anterior murió a mitad de escritura y la salida final no es confiable.
pub fn interrupted(artifacts: &[Artifact]) -> bool {
    artifacts
        .iter()
        .filter_map(|a| a.as_path())
        .any(|path| partial_path(path).exists())
}

/// Borra las salidas locales declaradas (recalcular).
///
/// En etapas `Direct` también se borran los archivos compañeros del
/// shapefile (`.dbf`, `.shx`, `.prj`, ...).
pub fn clear_outputs(stages: &[Stage]) -> io::Result<usize> {
    let mut removed = 0;
    for stage in stages {
        for path in stage.outputs.iter().filter_map(|a| a.as_path()) {
            for target in stage_files(stage, path) {
                if target.exists() {
                    fs::remove_file(&target)?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

/// Compañeros de un shapefile que escribe `gdal_polygonize.py`.
const SHAPEFILE_SIDECARS: &[&str] = &["dbf", "shx", "prj", "cpg", "qix", "sbn", "sbx", "shp.xml"];

fn sidecars(path: &Path) -> Vec<PathBuf> {
    let is_shapefile = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("shp"));
    if !is_shapefile {
        return Vec::new();
    }
    SHAPEFILE_SIDECARS
        .iter()
        .map(|ext| path.with_extension(ext))
        .collect()
}

/// Todo lo que una etapa puede dejar en disco por cada salida declarada.
fn stage_files(stage: &Stage, path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf(), partial_path(path)];
    if stage.commit == Commit::Direct {
        files.extend(sidecars(path));
    }
    files
}

fn prepare_targets(stage: &Stage) -> Result<Vec<Artifact>, OperationError> {
    let mut targets = Vec::with_capacity(stage.outputs.len());
    for output in &stage.outputs {
        let target = match (output, stage.commit) {
            (Artifact::File(path), commit) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let partial = partial_path(path);
                match commit {
                    Commit::Staged => {
                        // restos de un intento anterior que murió a mitad de escritura
                        remove_if_exists(&partial)?;
                        Artifact::File(partial)
                    }
                    Commit::Direct => {
                        // se escribe en el destino final: el parcial vacío marca la
                        // escritura en curso hasta que la etapa termina bien
                        for file in stage_files(stage, path) {
                            remove_if_exists(&file)?;
                        }
                        fs::write(&partial, b"")?;
                        output.clone()
                    }
                }
            }
            (Artifact::Object(_), _) => output.clone(),
        };
        targets.push(target);
    }
    Ok(targets)
}

/// Descarta lo escrito por una etapa que falló.
///
/// En `Direct` la salida final está a medio escribir, así que se borra junto
/// con sus compañeros; si no, el próximo intento la daría por hecha.
fn discard_targets(stage: &Stage, targets: &[Artifact]) {
    let files: Vec<PathBuf> = match stage.commit {
        Commit::Staged => targets
            .iter()
            .filter_map(|t| t.as_path().map(Path::to_path_buf))
            .collect(),
        Commit::Direct => stage
            .outputs
            .iter()
            .filter_map(|o| o.as_path())
            .flat_map(|path| stage_files(stage, path))
            .collect(),
    };
    for path in files {
        if let Err(e) = remove_if_exists(&path) {
            warn!(stage = %stage.name, "no se pudo borrar la salida parcial {}: {}", path.display(), e);
        }
    }
}

fn commit_targets(stage: &Stage, targets: &[Artifact]) -> Result<(), OperationError> {
    let local: Vec<(&Path, &Path)> = stage
        .outputs
        .iter()
        .zip(targets)
        .filter_map(|(output, target)| Some((output.as_path()?, target.as_path()?)))
        .collect();

    if let Some((final_path, _)) = local.iter().find(|(_, written)| !written.exists()) {
        discard_targets(stage, targets);
        return Err(OperationError::MissingOutput(final_path.display().to_string()));
    }
    for (final_path, written) in local {
        match stage.commit {
            Commit::Staged => fs::rename(written, final_path)?,
            Commit::Direct => remove_if_exists(&partial_path(final_path))?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use crate::stage::StageOperation;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("pipeline_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    /// Operación falsa: escribe el nombre de la etapa en cada salida y cuenta llamadas.
    fn writer(calls: Arc<AtomicUsize>, content: &'static str) -> Arc<dyn StageOperation> {
        Arc::new(move |io: &StageIo<'_>| -> Result<(), OperationError> {
            calls.fetch_add(1, Ordering::SeqCst);
            for path in io.output_paths() {
                fs::write(path, content)?;
            }
            Ok(())
        })
    }

    fn failing(calls: Arc<AtomicUsize>) -> Arc<dyn StageOperation> {
        Arc::new(move |io: &StageIo<'_>| -> Result<(), OperationError> {
            calls.fetch_add(1, Ordering::SeqCst);
            // deja basura a medio escribir antes de fallar
            for path in io.output_paths() {
                fs::write(path, "basura")?;
            }
            Err(OperationError::Failed {
                program: "gdal_calc.py".into(),
                status: Some(1),
                diagnostic: "ERROR 4: no such file".into(),
            })
        })
    }

    fn version() -> VersionTag {
        VersionTag::new("v1").unwrap()
    }

    #[test]
    fn partial_path_conserva_la_extension() {
        assert_eq!(
            partial_path(Path::new("/d/A_prob_v1.tif")),
            PathBuf::from("/d/A_prob_v1.partial.tif")
        );
        assert_eq!(partial_path(Path::new("/d/salida")), PathBuf::from("/d/salida.partial"));
    }

    #[test]
    fn salida_existente_saltea_la_etapa() {
        let dir = temp_dir("skip");
        let input = dir.join("A.tif");
        let prob = dir.join("A_prob.tif");
        let mle = dir.join("A_mle.tif");
        fs::write(&input, "features").unwrap();
        fs::write(&prob, "ya estaba").unwrap();

        let infer_calls = Arc::new(AtomicUsize::new(0));
        let classify_calls = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new("infer", writer(infer_calls.clone(), "prob"))
                .inputs([Artifact::File(input.clone())])
                .outputs([Artifact::File(prob.clone())]),
            Stage::new("classify", writer(classify_calls.clone(), "mle"))
                .inputs([Artifact::File(prob.clone())])
                .outputs([Artifact::File(mle.clone())]),
        ];

        let unit = WorkUnit::new("A", Artifact::File(input));
        let report =
            run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default())
                .unwrap();

        assert_eq!(infer_calls.load(Ordering::SeqCst), 0);
        assert_eq!(classify_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.skipped, vec!["infer"]);
        assert_eq!(report.executed, vec!["classify"]);
        assert_eq!(fs::read_to_string(&prob).unwrap(), "ya estaba");
        assert_eq!(fs::read_to_string(&mle).unwrap(), "mle");
        assert!(!partial_path(&mle).exists());
    }

    #[test]
    fn falla_aborta_y_no_deja_parciales() {
        let dir = temp_dir("abort");
        let input = dir.join("A.tif");
        fs::write(&input, "features").unwrap();
        let prob = dir.join("A_prob.tif");
        let mle = dir.join("A_mle.tif");
        let reefs = dir.join("A_reefs.tif");

        let later_calls = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            Stage::new("infer", writer(Arc::new(AtomicUsize::new(0)), "prob"))
                .inputs([Artifact::File(input.clone())])
                .outputs([Artifact::File(prob.clone())]),
            Stage::new("classify", failing(Arc::new(AtomicUsize::new(0))))
                .inputs([Artifact::File(prob.clone())])
                .outputs([Artifact::File(mle.clone())]),
            Stage::new("mask", writer(later_calls.clone(), "reefs"))
                .inputs([Artifact::File(mle.clone())])
                .outputs([Artifact::File(reefs.clone())]),
        ];

        let unit = WorkUnit::new("A", Artifact::File(input));
        let err = run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default())
            .unwrap_err();

        assert_eq!(err.stage, "classify");
        assert_eq!(err.unit, "A");
        assert!(err.to_string().contains("ERROR 4"));
        assert!(prob.exists());
        assert!(!mle.exists());
        assert!(!partial_path(&mle).exists());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn entrada_faltante_es_falla_de_etapa() {
        let dir = temp_dir("missing");
        let calls = Arc::new(AtomicUsize::new(0));
        let stages = vec![Stage::new("infer", writer(calls.clone(), "prob"))
            .inputs([Artifact::File(dir.join("no_existe.vrt"))])
            .outputs([Artifact::File(dir.join("A_prob.tif"))])];

        let unit = WorkUnit::new("A", Artifact::File(dir.join("no_existe.vrt")));
        let err = run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default())
            .unwrap_err();

        assert!(matches!(err.cause, OperationError::MissingInput(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn operacion_que_no_produce_su_salida_falla() {
        let dir = temp_dir("no_output");
        let stages = vec![Stage::new(
            "vectorize",
            Arc::new(|_: &StageIo<'_>| -> Result<(), OperationError> { Ok(()) }) as Arc<dyn StageOperation>,
        )
        .outputs([Artifact::File(dir.join("A.shp"))])
        .commit(Commit::Direct)];

        let unit = WorkUnit::new("A", Artifact::File(dir.join("A.tif")));
        let err = run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default())
            .unwrap_err();
        assert!(matches!(err.cause, OperationError::MissingOutput(_)));
    }

    /// Escribe un shapefile a medias y falla en la primera llamada; después anda.
    fn flaky_polygonize(calls: Arc<AtomicUsize>) -> Arc<dyn StageOperation> {
        Arc::new(move |io: &StageIo<'_>| -> Result<(), OperationError> {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            for path in io.output_paths() {
                fs::write(path, "shp")?;
                fs::write(path.with_extension("dbf"), "dbf")?;
            }
            if n == 0 {
                return Err(OperationError::Failed {
                    program: "gdal_polygonize.py".into(),
                    status: Some(0),
                    diagnostic: "ERROR 1: disco lleno".into(),
                });
            }
            Ok(())
        })
    }

    #[test]
    fn falla_en_etapa_direct_borra_el_shapefile_y_se_reintenta() {
        let dir = temp_dir("direct_fail");
        let raster = dir.join("A_reefs_v1.tif");
        let shp = dir.join("A_reefs_v1.shp");
        fs::write(&raster, "reefs").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let stages = vec![Stage::new("vectorize", flaky_polygonize(calls.clone()))
            .inputs([Artifact::File(raster.clone())])
            .outputs([Artifact::File(shp.clone())])
            .commit(Commit::Direct)];
        let unit = WorkUnit::new("A", Artifact::File(raster.clone()));
        let run = || run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default());

        let err = run().unwrap_err();
        assert_eq!(err.stage, "vectorize");
        assert!(!shp.exists());
        assert!(!dir.join("A_reefs_v1.dbf").exists());
        assert!(!partial_path(&shp).exists());
        // el raster con el mismo nombre base no es un compañero del shapefile
        assert!(raster.exists());

        let report = run().unwrap();
        assert_eq!(report.executed, vec!["vectorize"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(shp.exists());
        assert!(!partial_path(&shp).exists());
    }

    #[test]
    fn escritura_interrumpida_no_cuenta_como_salida() {
        let dir = temp_dir("direct_crash");
        let raster = dir.join("A_reefs_v1.tif");
        let shp = dir.join("A_reefs_v1.shp");
        fs::write(&raster, "reefs").unwrap();
        // un worker murió con el shapefile a medias
        fs::write(&shp, "mitad").unwrap();
        fs::write(partial_path(&shp), "").unwrap();
        assert!(interrupted(&[Artifact::File(shp.clone())]));

        let calls = Arc::new(AtomicUsize::new(1));
        let stages = vec![Stage::new("vectorize", flaky_polygonize(calls.clone()))
            .inputs([Artifact::File(raster.clone())])
            .outputs([Artifact::File(shp.clone())])
            .commit(Commit::Direct)];
        let unit = WorkUnit::new("A", Artifact::File(raster));
        let report =
            run_pipeline(&unit, &stages, &version(), &ArtifactProbe::local(), PipelineOptions::default())
                .unwrap();

        assert_eq!(report.executed, vec!["vectorize"]);
        assert_eq!(fs::read_to_string(&shp).unwrap(), "shp");
        assert!(!interrupted(&[Artifact::File(shp)]));
    }

    #[test]
    fn clear_outputs_borra_shapefile_completo() {
        let dir = temp_dir("clear");
        let raster = dir.join("A_reefs_v1.tif");
        let shp = dir.join("A_reefs_v1.shp");
        for p in [&raster, &shp, &dir.join("A_reefs_v1.dbf"), &dir.join("A_reefs_v1.shx")] {
            fs::write(p, "x").unwrap();
        }
        let noop: Arc<dyn StageOperation> =
            Arc::new(|_: &StageIo<'_>| -> Result<(), OperationError> { Ok(()) });
        let stages = vec![
            Stage::new("mask", noop.clone()).outputs([Artifact::File(raster.clone())]),
            Stage::new("vectorize", noop)
                .outputs([Artifact::File(shp.clone())])
                .commit(Commit::Direct),
        ];

        assert_eq!(clear_outputs(&stages).unwrap(), 4);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn sin_skip_existing_se_rehace_todo() {
        let dir = temp_dir("force");
        let out = dir.join("A_prob.tif");
        fs::write(&out, "viejo").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let stages = vec![Stage::new("infer", writer(calls.clone(), "nuevo"))
            .outputs([Artifact::File(out.clone())])];

        let unit = WorkUnit::new("A", Artifact::File(dir.join("A.tif")));
        run_pipeline(
            &unit,
            &stages,
            &version(),
            &ArtifactProbe::local(),
            PipelineOptions { skip_existing: false },
        )
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "nuevo");
    }
}
