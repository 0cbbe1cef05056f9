//! Flujo completo enumerar -> reclamar -> pipeline -> marcar, con operaciones falsas.

use chrono::{DateTime, Utc};
use common::{
    claim::{ClaimOutcome, ClaimPolicy, Claimer},
    completion::CompletionTracker,
    enumerate::{DirCatalog, TileEnumerator, TileNameParser, DEFAULT_TILE_PATTERN},
    Artifact, GridCoord, OperationError, RunContext, RunLayout, Runner, Stage, StageIo, StageOperation,
    StagePlanner, UnitOutcome, VersionTag, WorkUnit, WorkerIdentity,
};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

fn temp_dir(sub: &str) -> PathBuf {
    let base = env::temp_dir().join("apply_workflow_tests").join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

fn layout(root: &Path) -> RunLayout {
    RunLayout::new(root, "dense_unet", "apply", VersionTag::new("lwr").unwrap())
}

/// Contenido completo de un árbol de directorios (ruta relativa -> bytes).
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    out
}

/// Etapas infer -> classify -> mask con contadores por etapa.
///
/// `fail_once` hace fallar la etapa con ese nombre sólo en su primer intento.
struct CountingPlan {
    calls: BTreeMap<&'static str, Arc<AtomicUsize>>,
    fail_once: Option<(&'static str, Arc<AtomicBool>)>,
}

const STAGES: [(&str, &str); 3] = [("infer", "prob"), ("classify", "mle"), ("mask", "reefs")];

impl CountingPlan {
    fn new() -> Self {
        Self {
            calls: STAGES
                .iter()
                .map(|(name, _)| (*name, Arc::new(AtomicUsize::new(0))))
                .collect(),
            fail_once: None,
        }
    }

    fn failing_once(stage: &'static str) -> Self {
        Self {
            fail_once: Some((stage, Arc::new(AtomicBool::new(true)))),
            ..Self::new()
        }
    }

    fn calls(&self, stage: &str) -> usize {
        self.calls[stage].load(Ordering::SeqCst)
    }

    fn operation(&self, stage: &'static str) -> Arc<dyn StageOperation> {
        let calls = self.calls[stage].clone();
        let fail = self
            .fail_once
            .as_ref()
            .filter(|(name, _)| *name == stage)
            .map(|(_, flag)| flag.clone());
        Arc::new(move |io: &StageIo<'_>| -> Result<(), OperationError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(flag) = &fail {
                if flag.swap(false, Ordering::SeqCst) {
                    return Err(OperationError::Failed {
                        program: stage.to_string(),
                        status: Some(1),
                        diagnostic: "falla simulada".into(),
                    });
                }
            }
            for path in io.output_paths() {
                fs::write(path, format!("{stage}:{}", io.unit.key))?;
            }
            Ok(())
        })
    }
}

impl StagePlanner for CountingPlan {
    fn stages_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Stage> {
        let mut previous = unit.primary.clone();
        STAGES
            .iter()
            .map(|&(name, suffix)| {
                let output = Artifact::File(layout.output_file(unit, suffix, "tif"));
                let stage = Stage::new(name, self.operation(name))
                    .inputs([previous.clone()])
                    .outputs([output.clone()]);
                previous = output;
                stage
            })
            .collect()
    }

    fn deliverables_for(&self, unit: &WorkUnit, layout: &RunLayout) -> Vec<Artifact> {
        STAGES
            .iter()
            .map(|(_, suffix)| Artifact::File(layout.output_file(unit, suffix, "tif")))
            .collect()
    }
}

fn catalog(dir: &Path, keys: &[&str]) -> Vec<WorkUnit> {
    keys.iter()
        .map(|k| {
            let input = dir.join("catalog").join(format!("{k}.vrt"));
            fs::create_dir_all(input.parent().unwrap()).unwrap();
            fs::write(&input, "features").unwrap();
            WorkUnit::new(*k, Artifact::File(input))
        })
        .collect()
}

fn runner(root: &Path, plan: Arc<CountingPlan>, recalculate_since: Option<DateTime<Utc>>) -> Runner {
    let ctx = RunContext::local(layout(root), WorkerIdentity::named("w-1"));
    Runner::new(
        ctx,
        plan,
        ClaimPolicy {
            max_age: None,
            recalculate_since,
        },
    )
}

#[test]
fn segunda_corrida_no_cambia_nada_en_disco() {
    let dir = temp_dir("idempotence");
    let out = dir.join("out");
    let units = catalog(&dir, &["reef_a", "reef_b"]);
    let plan = Arc::new(CountingPlan::new());

    let first = runner(&out, plan.clone(), None).run(&units).unwrap();
    assert_eq!(first.completed.len(), 2);
    let before = snapshot(&out);

    let second = runner(&out, plan.clone(), None).run(&units).unwrap();
    assert_eq!(second.already_complete, 2);
    assert!(second.completed.is_empty());
    assert_eq!(snapshot(&out), before);
    for (name, _) in STAGES {
        assert_eq!(plan.calls(name), 2, "etapa {name}");
    }
}

#[test]
fn reanuda_desde_la_etapa_que_fallo() {
    let dir = temp_dir("resume");
    let out = dir.join("out");
    let units = catalog(&dir, &["reef_a"]);
    let unit = &units[0];
    let layout = layout(&out);
    let plan = Arc::new(CountingPlan::failing_once("classify"));

    // 1) Primer intento: falla classify
    let summary = runner(&out, plan.clone(), None).run(&units).unwrap();
    assert_eq!(summary.failed.len(), 1);
    assert!(layout.output_file(unit, "prob", "tif").exists());
    assert!(!layout.output_file(unit, "mle", "tif").exists());
    assert!(!layout.completion_marker(unit).exists());
    assert!(!layout.claim_marker(unit).exists());

    // 2) Segundo intento: infer se saltea, el resto corre
    let summary = runner(&out, plan.clone(), None).run(&units).unwrap();
    assert_eq!(summary.completed, vec!["reef_a".to_string()]);
    assert_eq!(plan.calls("infer"), 1);
    assert_eq!(plan.calls("classify"), 2);
    assert_eq!(plan.calls("mask"), 1);
    assert!(layout.completion_marker(unit).exists());
    assert!(summary.aggregate.all_complete());
}

#[test]
fn agregado_sigue_a_los_marcadores_por_unidad() {
    let dir = temp_dir("aggregate");
    let out = dir.join("out");
    let units = catalog(&dir, &["a", "b", "c"]);
    let plan = Arc::new(CountingPlan::new());
    let layout = layout(&out);

    let summary = runner(&out, plan, None).run(&units).unwrap();
    assert!(summary.aggregate.all_complete());
    assert!(layout.aggregate_marker().exists());

    fs::remove_file(layout.completion_marker(&units[1])).unwrap();
    let tracker = CompletionTracker::new(RunContext::local(layout.clone(), WorkerIdentity::named("op")));
    let report = tracker.check_all_complete(&units).unwrap();
    assert!(!report.all_complete());
    assert_eq!(report.complete, 2);
    assert!(!layout.aggregate_marker().exists());
}

#[test]
fn salida_precreada_saltea_infer() {
    let dir = temp_dir("scenario");
    let out = dir.join("out");
    let units = catalog(&dir, &["A"]);
    let layout = layout(&out);
    let prob = layout.output_file(&units[0], "prob", "tif");
    fs::create_dir_all(prob.parent().unwrap()).unwrap();
    fs::write(&prob, "precreado").unwrap();

    let plan = Arc::new(CountingPlan::new());
    let outcome = runner(&out, plan.clone(), None).process_unit(&units[0]).unwrap();

    match outcome {
        UnitOutcome::Completed(report) => {
            assert_eq!(report.skipped, vec!["infer".to_string()]);
            assert_eq!(report.executed, vec!["classify".to_string(), "mask".to_string()]);
        }
        other => panic!("resultado inesperado: {other:?}"),
    }
    assert_eq!(plan.calls("infer"), 0);
    assert_eq!(plan.calls("classify"), 1);
    assert_eq!(fs::read_to_string(&prob).unwrap(), "precreado");
}

#[test]
fn recalcular_ignora_salidas_y_marcadores() {
    let dir = temp_dir("recalculate");
    let out = dir.join("out");
    let units = catalog(&dir, &["A"]);
    let plan = Arc::new(CountingPlan::new());

    runner(&out, plan.clone(), None).run(&units).unwrap();
    let summary = runner(&out, plan.clone(), Some(Utc::now())).run(&units).unwrap();

    assert_eq!(summary.completed.len(), 1);
    assert_eq!(plan.calls("infer"), 2);
    assert!(summary.aggregate.all_complete());
}

#[test]
fn reclamos_concurrentes_tienen_un_solo_ganador() {
    let dir = temp_dir("race");
    let layout = layout(&dir);
    let unit = WorkUnit::new("L15-0001E-0001N", Artifact::file("/in/L15-0001E-0001N.tif"));
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let barrier = barrier.clone();
            let layout = layout.clone();
            let unit = unit.clone();
            thread::spawn(move || {
                let ctx = RunContext::local(layout, WorkerIdentity::named(format!("w-{i}")));
                let claimer = Claimer::new(ctx, ClaimPolicy::default());
                barrier.wait();
                match claimer.try_claim(&unit, &[]).unwrap() {
                    // el guard se mantiene hasta que todos intentaron
                    ClaimOutcome::Claimed(guard) => Some(guard),
                    ClaimOutcome::AlreadyClaimed => None,
                    ClaimOutcome::AlreadyComplete => panic!("la unidad no estaba completa"),
                }
            })
        })
        .collect();

    let guards: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(guards.len(), 1);
    drop(guards);
    assert!(!layout.claim_marker(&unit).exists());
}

#[test]
fn enumeracion_de_tiles_arma_el_vecindario() {
    let dir = temp_dir("adjacency");
    for (x, y) in [(0, 0), (1, 0), (0, 1), (2, 2)] {
        let p = dir.join("mosaic").join(format!("L15-{x:04}E-{y:04}N.tif"));
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, "x").unwrap();
    }

    let enumeration = TileEnumerator::new(
        Arc::new(DirCatalog::new(&dir)),
        TileNameParser::new(DEFAULT_TILE_PATTERN).unwrap(),
    )
    .enumerate()
    .unwrap();

    let origin = enumeration
        .units
        .iter()
        .find(|u| u.coord == Some(GridCoord::new(0, 0)))
        .unwrap();
    let mut context: Vec<String> = origin.context.iter().filter_map(|a| a.stem()).collect();
    context.sort();
    assert_eq!(context, vec!["L15-0000E-0001N", "L15-0001E-0000N"]);
}
