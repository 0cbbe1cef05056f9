//! Protocolo de reclamo de unidades.
//!
//! Un worker reclama una unidad creando `{unit_dir}/{run_name}.lock` con
//! create-exclusive. No hay espera entre workers: si el marcador existe, la
//! unidad se saltea y el worker sigue con la siguiente.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

use crate::{
    completion::CompletionTracker,
    context::RunContext,
    error::{ClaimError, StoreError},
    pipeline::interrupted,
    store::MarkerStore,
    unit::{Artifact, WorkUnit},
    worker::WorkerId,
};

/// Contenido del marcador de reclamo (sólo diagnóstico).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub pid: u32,
    pub claimed_at: DateTime<Utc>,
}

/// Política de reclamo de la corrida.
#[derive(Debug, Clone, Default)]
pub struct ClaimPolicy {
    /// Edad a partir de la cual un reclamo se considera abandonado.
    /// `None`: nunca se recupera un reclamo ajeno (hay que limpiarlo a mano).
    pub max_age: Option<Duration>,
    /// Época de un recálculo: sólo cuentan como completas las unidades
    /// marcadas después de este instante. Todos los workers del mismo envío
    /// comparten la época, así cada unidad se rehace una sola vez.
    pub recalculate_since: Option<DateTime<Utc>>,
}

impl ClaimPolicy {
    pub fn recalculating(&self) -> bool {
        self.recalculate_since.is_some()
    }
}

/// Estado de un reclamo existente.
#[derive(Debug, Clone)]
pub struct ClaimInfo {
    pub marker: PathBuf,
    pub record: Option<ClaimRecord>,
    pub age: Option<Duration>,
    raw: Vec<u8>,
}

/// Lee un reclamo existente, `None` si no hay marcador.
///
/// Si el contenido no se puede interpretar (vacío o a medio escribir) la edad
/// se calcula con la fecha de modificación del archivo.
pub fn inspect_claim(store: &dyn MarkerStore, marker: &Path) -> Result<Option<ClaimInfo>, StoreError> {
    let Some(raw) = store.read(marker)? else {
        return Ok(None);
    };
    let record: Option<ClaimRecord> = serde_json::from_slice(&raw).ok();

    let age = match &record {
        Some(r) => (Utc::now() - r.claimed_at).to_std().ok(),
        None => store
            .modified(marker)?
            .and_then(|t| SystemTime::now().duration_since(t).ok()),
    };

    Ok(Some(ClaimInfo {
        marker: marker.to_path_buf(),
        record,
        age,
        raw,
    }))
}

/// Reclamo vivo. El marcador se borra al hacer `release` o al salir de scope,
/// por cualquier camino (éxito, error, panic).
///
/// Sólo se borra si sigue siendo el que escribió este worker: si el reclamo se
/// dio por abandonado y otro lo tomó, el del sucesor no se toca.
pub struct ClaimGuard {
    store: Arc<dyn MarkerStore>,
    marker: PathBuf,
    payload: Vec<u8>,
    unit: String,
    released: bool,
}

impl ClaimGuard {
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.remove_own()?;
        Ok(())
    }

    fn remove_own(&self) -> Result<bool, StoreError> {
        let removed = self.store.remove_if_unchanged(&self.marker, &self.payload)?;
        if removed {
            debug!(unit = %self.unit, "reclamo liberado");
        } else {
            warn!(
                unit = %self.unit,
                "el lock {} ya no es de este worker, no se borra",
                self.marker.display()
            );
        }
        Ok(removed)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_own() {
            warn!(
                unit = %self.unit,
                "no se pudo borrar el lock {}: {} (queda como reclamo huérfano)",
                self.marker.display(),
                e
            );
        }
    }
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("marker", &self.marker)
            .field("unit", &self.unit)
            .finish()
    }
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(ClaimGuard),
    AlreadyComplete,
    AlreadyClaimed,
}

#[derive(Debug, Clone)]
pub struct Claimer {
    ctx: RunContext,
    tracker: CompletionTracker,
    policy: ClaimPolicy,
}

impl Claimer {
    pub fn new(ctx: RunContext, policy: ClaimPolicy) -> Self {
        let tracker = CompletionTracker::new(ctx.clone());
        Self {
            ctx,
            tracker,
            policy,
        }
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    fn record(&self) -> ClaimRecord {
        ClaimRecord {
            worker_id: self.ctx.identity.worker_id.clone(),
            hostname: self.ctx.identity.hostname.clone(),
            pid: self.ctx.identity.pid,
            claimed_at: Utc::now(),
        }
    }

    /// Intenta reclamar `unit` para este worker.
    ///
    /// `deliverables` son las salidas finales de la unidad: si ya existen todas
    /// pero falta el marcador de completitud, se vuelve a afirmar la
    /// completitud sin correr ninguna etapa. Eso se hace con el reclamo tomado,
    /// nunca sobre salidas que otro worker está escribiendo.
    pub fn try_claim(
        &self,
        unit: &WorkUnit,
        deliverables: &[Artifact],
    ) -> Result<ClaimOutcome, ClaimError> {
        let since = self.policy.recalculate_since;

        // 1) Completitud
        if self.tracker.is_complete_since(unit, since)? {
            debug!(unit = %unit.key, "salteando: unidad completa");
            return Ok(ClaimOutcome::AlreadyComplete);
        }

        let marker = self.ctx.layout.claim_marker(unit);
        let payload = serde_json::to_vec(&self.record())?;

        // 2) Reclamo existente (sin bloquear)
        if let Some(existing) = inspect_claim(self.ctx.store.as_ref(), &marker)? {
            if !self.reclaim_if_abandoned(unit, &existing)? {
                debug!(unit = %unit.key, "salteando: lock existente en {}", marker.display());
                return Ok(ClaimOutcome::AlreadyClaimed);
            }
        }

        // 3) Adquisición atómica
        if !self.ctx.store.create_exclusive(&marker, &payload)? {
            debug!(unit = %unit.key, "salteando: otro worker ganó el lock {}", marker.display());
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        let guard = ClaimGuard {
            store: Arc::clone(&self.ctx.store),
            marker,
            payload,
            unit: unit.key.clone(),
            released: false,
        };

        // 4) Otro worker pudo terminarla entre 1) y 3)
        if self.tracker.is_complete_since(unit, since)? {
            guard.release()?;
            debug!(unit = %unit.key, "salteando: completada mientras se reclamaba");
            return Ok(ClaimOutcome::AlreadyComplete);
        }

        // 5) Re-afirmar: salidas finales presentes y ninguna a medio escribir
        if since.is_none()
            && self.ctx.probe.all_exist(deliverables)?
            && !interrupted(deliverables)
        {
            self.tracker.mark_unit_complete(unit)?;
            guard.release()?;
            debug!(unit = %unit.key, "salteando: las salidas ya existen, completitud re-afirmada");
            return Ok(ClaimOutcome::AlreadyComplete);
        }

        info!(unit = %unit.key, worker = %self.ctx.identity.worker_id, "unidad reclamada");
        Ok(ClaimOutcome::Claimed(guard))
    }

    /// Borra un reclamo ajeno si superó `max_age` y su contenido no cambió
    /// desde que se observó. Devuelve `true` si se borró.
    fn reclaim_if_abandoned(&self, unit: &WorkUnit, existing: &ClaimInfo) -> Result<bool, StoreError> {
        let (Some(max_age), Some(age)) = (self.policy.max_age, existing.age) else {
            return Ok(false);
        };
        if age <= max_age {
            return Ok(false);
        }

        // si otro worker ya lo recuperó y escribió el suyo, el contenido difiere y no se borra
        if !self
            .ctx
            .store
            .remove_if_unchanged(&existing.marker, &existing.raw)?
        {
            return Ok(false);
        }

        let owner = existing
            .record
            .as_ref()
            .map(|r| format!("{}@{}", r.worker_id, r.hostname))
            .unwrap_or_else(|| "desconocido".to_string());
        warn!(
            unit = %unit.key,
            "reclamo de {} abandonado hace {:?} (máximo {:?}), se recupera",
            owner,
            age,
            max_age
        );
        Ok(true)
    }
}
