//! Loop de aplicación de un worker: reclamar, correr el pipeline, marcar.
//!
//! Cada proceso recorre la lista completa de unidades; la coordinación entre
//! procesos es sólo a través de los marcadores en disco.

use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};
use tracing::{error, info, warn};

use crate::{
    claim::{ClaimOutcome, ClaimPolicy, Claimer},
    completion::{AggregateReport, CompletionTracker},
    context::RunContext,
    error::{ClaimError, StageFailure, StoreError},
    pipeline::{clear_outputs, run_pipeline, PipelineOptions, PipelineReport},
    plan::StagePlanner,
    unit::{UnitKey, WorkUnit},
};

#[derive(Debug)]
pub enum UnitOutcome {
    /// Este worker corrió el pipeline completo y marcó la unidad.
    Completed(PipelineReport),
    AlreadyComplete,
    /// Otro worker la tiene reclamada.
    AlreadyClaimed,
    Failed(StageFailure),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub completed: Vec<UnitKey>,
    pub already_complete: usize,
    pub already_claimed: usize,
    /// (unidad, diagnóstico)
    pub failed: Vec<(UnitKey, String)>,
    pub aggregate: AggregateReport,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} unidades: {} procesadas, {} ya completas, {} reclamadas por otro worker, {} fallidas; \
             {}/{} completas en total",
            self.total,
            self.completed.len(),
            self.already_complete,
            self.already_claimed,
            self.failed.len(),
            self.aggregate.complete,
            self.aggregate.total
        )
    }
}

pub struct Runner {
    ctx: RunContext,
    claimer: Claimer,
    tracker: CompletionTracker,
    planner: Arc<dyn StagePlanner>,
    recalculate_since: Option<DateTime<Utc>>,
}

impl Runner {
    pub fn new(ctx: RunContext, planner: Arc<dyn StagePlanner>, policy: ClaimPolicy) -> Self {
        let recalculate_since = policy.recalculate_since;
        Self {
            claimer: Claimer::new(ctx.clone(), policy),
            tracker: CompletionTracker::new(ctx.clone()),
            ctx,
            planner,
            recalculate_since,
        }
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Una unidad: reclamo, pipeline y marcador de completitud.
    ///
    /// Sólo devuelve error si falla el almacén de marcadores; una falla de etapa
    /// es un `UnitOutcome::Failed` y la unidad queda libre para reintentar.
    pub fn process_unit(&self, unit: &WorkUnit) -> Result<UnitOutcome, ClaimError> {
        let layout = &self.ctx.layout;
        let deliverables = self.planner.deliverables_for(unit, layout);

        // 1) Reclamo
        let guard = match self.claimer.try_claim(unit, &deliverables)? {
            ClaimOutcome::Claimed(guard) => guard,
            ClaimOutcome::AlreadyComplete => return Ok(UnitOutcome::AlreadyComplete),
            ClaimOutcome::AlreadyClaimed => return Ok(UnitOutcome::AlreadyClaimed),
        };

        let stages = self.planner.stages_for(unit, layout);

        // 2) Recalcular: se invalida todo lo anterior a la época de la unidad
        let recalculate = self.recalculate_since.is_some();
        if recalculate {
            self.tracker.invalidate_unit(unit)?;
            match clear_outputs(&stages) {
                Ok(n) if n > 0 => info!(unit = %unit.key, "recalcular: {} salidas previas borradas", n),
                Ok(_) => {}
                Err(e) => warn!(unit = %unit.key, "recalcular: no se pudieron borrar salidas previas: {}", e),
            }
        }

        // 3) Pipeline
        let options = PipelineOptions {
            skip_existing: !recalculate,
        };
        match run_pipeline(unit, &stages, layout.version(), &self.ctx.probe, options) {
            Ok(report) => {
                // el marcador se escribe antes de soltar el reclamo
                self.tracker.mark_unit_complete(unit)?;
                info!(
                    unit = %unit.key,
                    version = %layout.version(),
                    "unidad completa ({} etapas ejecutadas, {} salteadas)",
                    report.executed.len(),
                    report.skipped.len()
                );
                guard.release()?;
                Ok(UnitOutcome::Completed(report))
            }
            Err(failure) => {
                error!(
                    unit = %unit.key,
                    version = %layout.version(),
                    stage = %failure.stage,
                    "{}",
                    failure
                );
                drop(guard);
                Ok(UnitOutcome::Failed(failure))
            }
        }
    }

    /// Recorre todas las unidades y al final re-evalúa el agregado.
    pub fn run(&self, units: &[WorkUnit]) -> Result<RunSummary, StoreError> {
        if let Some(since) = self.recalculate_since {
            if self.tracker.invalidate_aggregate_before(since)? {
                info!("recalcular: marcador agregado invalidado");
            }
        }

        let mut completed = Vec::new();
        let mut already_complete = 0;
        let mut already_claimed = 0;
        let mut failed = Vec::new();

        for (idx, unit) in units.iter().enumerate() {
            info!(unit = %unit.key, "unidad {} de {}", idx + 1, units.len());
            match self.process_unit(unit) {
                Ok(UnitOutcome::Completed(_)) => completed.push(unit.key.clone()),
                Ok(UnitOutcome::AlreadyComplete) => already_complete += 1,
                Ok(UnitOutcome::AlreadyClaimed) => already_claimed += 1,
                Ok(UnitOutcome::Failed(failure)) => {
                    failed.push((unit.key.clone(), failure.to_string()));
                }
                Err(e) => {
                    error!(unit = %unit.key, "error de marcadores: {}", e);
                    failed.push((unit.key.clone(), e.to_string()));
                }
            }
        }

        let aggregate = self
            .tracker
            .check_all_complete_since(units, self.recalculate_since)?;
        let summary = RunSummary {
            total: units.len(),
            completed,
            already_complete,
            already_claimed,
            failed,
            aggregate,
        };
        info!("{}", summary);
        Ok(summary)
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("ctx", &self.ctx)
            .field("recalculate_since", &self.recalculate_since)
            .finish()
    }
}
