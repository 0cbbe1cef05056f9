//! Inspección del estado de una corrida desde afuera (cliente de operador).
//!
//! Todo se deduce de los marcadores y de las salidas en disco; no hay otro
//! registro de estado.

use serde::Serialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    claim::inspect_claim,
    completion::CompletionTracker,
    context::RunContext,
    error::{ClaimError, StoreError},
    plan::StagePlanner,
    unit::{UnitKey, WorkUnit},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Complete,
    Claimed {
        owner: String,
        age: Option<Duration>,
    },
    /// Algunas etapas ya tienen sus salidas, pero no hay reclamo ni marcador.
    Partial,
    Pending,
}

impl UnitState {
    pub fn label(&self) -> &'static str {
        match self {
            UnitState::Complete => "complete",
            UnitState::Claimed { .. } => "claimed",
            UnitState::Partial => "partial",
            UnitState::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub unit: UnitKey,
    pub state: UnitState,
    pub stages_done: usize,
    pub stages_total: usize,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} {:<9} {}/{}",
            self.unit,
            self.state.label(),
            self.stages_done,
            self.stages_total
        )?;
        if let UnitState::Claimed { owner, age } = &self.state {
            write!(f, "  {}", owner)?;
            if let Some(age) = age {
                write!(f, " hace {}s", age.as_secs())?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub complete: usize,
    pub claimed: usize,
    pub partial: usize,
    pub pending: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.complete + self.claimed + self.partial + self.pending
    }
}

pub fn inspect_unit(
    ctx: &RunContext,
    planner: &dyn StagePlanner,
    unit: &WorkUnit,
) -> Result<UnitStatus, ClaimError> {
    let stages = planner.stages_for(unit, &ctx.layout);
    let stages_total = stages.len();
    let tracker = CompletionTracker::new(ctx.clone());

    if tracker.is_unit_complete(unit)? {
        return Ok(UnitStatus {
            unit: unit.key.clone(),
            state: UnitState::Complete,
            stages_done: stages_total,
            stages_total,
        });
    }

    let mut stages_done = 0;
    for stage in &stages {
        if ctx.probe.all_exist(&stage.outputs)? {
            stages_done += 1;
        }
    }

    let state = match inspect_claim(ctx.store.as_ref(), &ctx.layout.claim_marker(unit))? {
        Some(claim) => UnitState::Claimed {
            owner: claim
                .record
                .map(|r| format!("{}@{} (pid {})", r.worker_id, r.hostname, r.pid))
                .unwrap_or_else(|| "desconocido".to_string()),
            age: claim.age,
        },
        None if stages_done > 0 => UnitState::Partial,
        None => UnitState::Pending,
    };

    Ok(UnitStatus {
        unit: unit.key.clone(),
        state,
        stages_done,
        stages_total,
    })
}

pub fn inspect_all(
    ctx: &RunContext,
    planner: &dyn StagePlanner,
    units: &[WorkUnit],
) -> Result<Vec<UnitStatus>, ClaimError> {
    units
        .iter()
        .map(|unit| inspect_unit(ctx, planner, unit))
        .collect()
}

pub fn count_states(statuses: &[UnitStatus]) -> StatusCounts {
    let mut counts = StatusCounts::default();
    for status in statuses {
        match status.state {
            UnitState::Complete => counts.complete += 1,
            UnitState::Claimed { .. } => counts.claimed += 1,
            UnitState::Partial => counts.partial += 1,
            UnitState::Pending => counts.pending += 1,
        }
    }
    counts
}

/* =========================
   Reporte CSV
   ========================= */

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    unit: &'a str,
    state: &'a str,
    stages_done: usize,
    stages_total: usize,
    claimed_by: Option<&'a str>,
    claim_age_secs: Option<u64>,
}

pub fn write_csv_report<W: std::io::Write>(writer: W, statuses: &[UnitStatus]) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    for status in statuses {
        let (claimed_by, claim_age_secs) = match &status.state {
            UnitState::Claimed { owner, age } => (Some(owner.as_str()), age.map(|a| a.as_secs())),
            _ => (None, None),
        };
        wtr.serialize(CsvRow {
            unit: &status.unit,
            state: status.state.label(),
            stages_done: status.stages_done,
            stages_total: status.stages_total,
            claimed_by,
            claim_age_secs,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/* =========================
   Liberación manual y resultados
   ========================= */

/// Qué reclamos soltar con `client unlock`.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    /// Unidades puntuales; vacío = todas.
    pub units: Vec<UnitKey>,
    /// Sólo reclamos más viejos que esto.
    pub older_than: Option<Duration>,
}

impl ReleaseFilter {
    fn selects(&self, unit: &WorkUnit) -> bool {
        self.units.is_empty() || self.units.iter().any(|k| k == &unit.key)
    }
}

/// Borra reclamos según el filtro; devuelve los marcadores borrados.
///
/// Es la limpieza manual de reclamos que dejó un worker muerto.
pub fn release_claims(
    ctx: &RunContext,
    units: &[WorkUnit],
    filter: &ReleaseFilter,
) -> Result<Vec<PathBuf>, StoreError> {
    let mut released = Vec::new();
    for unit in units.iter().filter(|u| filter.selects(u)) {
        let marker = ctx.layout.claim_marker(unit);
        let Some(claim) = inspect_claim(ctx.store.as_ref(), &marker)? else {
            continue;
        };
        if let Some(min_age) = filter.older_than {
            match claim.age {
                Some(age) if age > min_age => {}
                _ => continue,
            }
        }
        if ctx.store.remove(&marker)? {
            warn!(unit = %unit.key, "reclamo liberado a mano: {}", marker.display());
            released.push(marker);
        }
    }
    info!("{} reclamos liberados", released.len());
    Ok(released)
}

/// Archivos dentro del directorio de una unidad, ordenados.
pub fn unit_files(unit_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    match fs::read_dir(unit_dir) {
        Ok(entries) => {
            for entry in entries {
                let path = entry?.path();
                if path.is_file() {
                    files.push(path);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    files.sort();
    Ok(files)
}
