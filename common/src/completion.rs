//! Marcadores de completitud por unidad y agregado de la corrida.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::{
    context::RunContext,
    error::StoreError,
    unit::WorkUnit,
    worker::WorkerId,
};

/// Contenido del marcador `.complete` (sólo diagnóstico).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub worker_id: WorkerId,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateReport {
    pub total: usize,
    pub complete: usize,
    /// El marcador agregado existe al terminar el chequeo.
    pub aggregate_present: bool,
}

impl AggregateReport {
    pub fn all_complete(&self) -> bool {
        self.aggregate_present
    }

    pub fn pending(&self) -> usize {
        self.total - self.complete
    }
}

#[derive(Debug, Clone)]
pub struct CompletionTracker {
    ctx: RunContext,
}

impl CompletionTracker {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    fn record(&self) -> Result<Vec<u8>, StoreError> {
        let record = CompletionRecord {
            worker_id: self.ctx.identity.worker_id.clone(),
            completed_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    /// Contenido y fecha de un marcador, `None` si no existe.
    ///
    /// Si el contenido no se puede interpretar se usa la fecha de modificación.
    fn read_marker(&self, marker: &Path) -> Result<Option<(Vec<u8>, Option<DateTime<Utc>>)>, StoreError> {
        let Some(raw) = self.ctx.store.read(marker)? else {
            return Ok(None);
        };
        let at = match serde_json::from_slice::<CompletionRecord>(&raw) {
            Ok(record) => Some(record.completed_at),
            Err(_) => self.ctx.store.modified(marker)?.map(DateTime::<Utc>::from),
        };
        Ok(Some((raw, at)))
    }

    pub fn is_unit_complete(&self, unit: &WorkUnit) -> Result<bool, StoreError> {
        self.ctx
            .store
            .exists(&self.ctx.layout.completion_marker(unit))
    }

    /// Momento en que se completó la unidad, `None` si no hay marcador.
    pub fn completed_at(&self, unit: &WorkUnit) -> Result<Option<DateTime<Utc>>, StoreError> {
        let marker = self.ctx.layout.completion_marker(unit);
        Ok(self.read_marker(&marker)?.and_then(|(_, at)| at))
    }

    /// Completa y, con `since`, completada después de ese instante.
    ///
    /// Un recálculo sólo acepta marcadores escritos en su propia época; los
    /// anteriores cuentan como pendientes.
    pub fn is_complete_since(&self, unit: &WorkUnit, since: Option<DateTime<Utc>>) -> Result<bool, StoreError> {
        match since {
            None => self.is_unit_complete(unit),
            Some(since) => Ok(self.completed_at(unit)?.is_some_and(|at| at > since)),
        }
    }

    /// Crea el marcador de la unidad. Nunca lo reescribe si ya existía;
    /// devuelve `true` sólo si esta llamada lo creó.
    pub fn mark_unit_complete(&self, unit: &WorkUnit) -> Result<bool, StoreError> {
        let marker = self.ctx.layout.completion_marker(unit);
        let created = self.ctx.store.create_exclusive(&marker, &self.record()?)?;
        if created {
            debug!(unit = %unit.key, "marcador de completitud creado en {}", marker.display());
        }
        Ok(created)
    }

    /// Borra el marcador de la unidad (recalcular).
    pub fn invalidate_unit(&self, unit: &WorkUnit) -> Result<bool, StoreError> {
        self.ctx
            .store
            .remove(&self.ctx.layout.completion_marker(unit))
    }

    pub fn invalidate_aggregate(&self) -> Result<bool, StoreError> {
        self.ctx.store.remove(&self.ctx.layout.aggregate_marker())
    }

    /// Borra el agregado sólo si es anterior a `since`: otro worker del mismo
    /// recálculo puede haberlo recreado ya.
    pub fn invalidate_aggregate_before(&self, since: DateTime<Utc>) -> Result<bool, StoreError> {
        let marker = self.ctx.layout.aggregate_marker();
        match self.read_marker(&marker)? {
            Some((raw, at)) if at.map_or(true, |at| at <= since) => {
                self.ctx.store.remove_if_unchanged(&marker, &raw)
            }
            _ => Ok(false),
        }
    }

    pub fn incomplete_units<'u>(
        &self,
        units: &'u [WorkUnit],
    ) -> Result<Vec<&'u WorkUnit>, StoreError> {
        self.incomplete_units_since(units, None)
    }

    pub fn incomplete_units_since<'u>(
        &self,
        units: &'u [WorkUnit],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<&'u WorkUnit>, StoreError> {
        let mut out = Vec::new();
        for unit in units {
            if !self.is_complete_since(unit, since)? {
                out.push(unit);
            }
        }
        Ok(out)
    }

    pub fn check_all_complete(&self, units: &[WorkUnit]) -> Result<AggregateReport, StoreError> {
        self.check_all_complete_since(units, None)
    }

    /// Re-escanea todas las unidades; sin contador acumulado, así es correcto
    /// aunque se salteen o repitan invocaciones.
    ///
    /// - Todas completas (desde `since`, si se da): crea (o confirma) el marcador agregado.
    /// - Alguna pendiente: el agregado no debe existir; si quedó de antes se borra.
    /// - Catálogo vacío: nunca se considera completo.
    pub fn check_all_complete_since(
        &self,
        units: &[WorkUnit],
        since: Option<DateTime<Utc>>,
    ) -> Result<AggregateReport, StoreError> {
        let total = units.len();
        let complete = total - self.incomplete_units_since(units, since)?.len();
        let marker = self.ctx.layout.aggregate_marker();

        if total > 0 && complete == total {
            if self.ctx.store.create_exclusive(&marker, &self.record()?)? {
                info!(
                    "las {} unidades están completas, marcador agregado creado en {}",
                    total,
                    marker.display()
                );
            }
            return Ok(AggregateReport {
                total,
                complete,
                aggregate_present: true,
            });
        }

        if self.ctx.store.remove(&marker)? {
            warn!(
                "marcador agregado {} borrado: {}/{} unidades completas",
                marker.display(),
                complete,
                total
            );
        }
        Ok(AggregateReport {
            total,
            complete,
            aggregate_present: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        unit::{Artifact, RunLayout, VersionTag},
        worker::WorkerIdentity,
    };
    use std::{env, fs, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("completion_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn tracker(dir: &PathBuf) -> (CompletionTracker, RunLayout) {
        let layout = RunLayout::new(dir, "cfg", "apply", VersionTag::new("v1").unwrap());
        let ctx = RunContext::local(layout.clone(), WorkerIdentity::named("w-test"));
        (CompletionTracker::new(ctx), layout)
    }

    fn units(keys: &[&str]) -> Vec<WorkUnit> {
        keys.iter()
            .map(|k| WorkUnit::new(*k, Artifact::file(format!("/in/{k}.tif"))))
            .collect()
    }

    #[test]
    fn mark_unit_complete_no_reescribe_el_marcador() {
        let dir = temp_dir("idempotent");
        let (tracker, layout) = tracker(&dir);
        let unit = &units(&["A"])[0];

        assert!(!tracker.is_unit_complete(unit).unwrap());
        assert!(tracker.mark_unit_complete(unit).unwrap());
        let first = fs::read(layout.completion_marker(unit)).unwrap();
        let record: CompletionRecord = serde_json::from_slice(&first).unwrap();
        assert_eq!(record.worker_id, "w-test");
        assert_eq!(tracker.completed_at(unit).unwrap(), Some(record.completed_at));

        assert!(!tracker.mark_unit_complete(unit).unwrap());
        assert_eq!(fs::read(layout.completion_marker(unit)).unwrap(), first);
    }

    #[test]
    fn agregado_existe_sii_todas_las_unidades_estan_completas() {
        let dir = temp_dir("aggregate");
        let (tracker, layout) = tracker(&dir);
        let all = units(&["A", "B", "C"]);

        tracker.mark_unit_complete(&all[0]).unwrap();
        tracker.mark_unit_complete(&all[1]).unwrap();
        let report = tracker.check_all_complete(&all).unwrap();
        assert!(!report.all_complete());
        assert_eq!(report.pending(), 1);
        assert!(!layout.aggregate_marker().exists());

        tracker.mark_unit_complete(&all[2]).unwrap();
        assert!(tracker.check_all_complete(&all).unwrap().all_complete());
        assert!(layout.aggregate_marker().exists());

        // borrar una unidad invalida el agregado en el siguiente chequeo
        tracker.invalidate_unit(&all[1]).unwrap();
        let report = tracker.check_all_complete(&all).unwrap();
        assert!(!report.all_complete());
        assert!(!layout.aggregate_marker().exists());
    }

    #[test]
    fn marcadores_anteriores_a_la_epoca_cuentan_como_pendientes() {
        let dir = temp_dir("epoch");
        let (tracker, layout) = tracker(&dir);
        let all = units(&["A", "B"]);

        tracker.mark_unit_complete(&all[0]).unwrap();
        tracker.check_all_complete(&all[..1]).unwrap();
        assert!(layout.aggregate_marker().exists());

        let epoch = Utc::now();
        assert!(tracker.is_complete_since(&all[0], None).unwrap());
        assert!(!tracker.is_complete_since(&all[0], Some(epoch)).unwrap());
        assert!(tracker.invalidate_aggregate_before(epoch).unwrap());

        tracker.mark_unit_complete(&all[1]).unwrap();
        assert!(tracker.is_complete_since(&all[1], Some(epoch)).unwrap());
        let report = tracker.check_all_complete_since(&all, Some(epoch)).unwrap();
        assert_eq!(report.complete, 1);
        assert!(!report.all_complete());

        // un agregado posterior a la época no se invalida
        tracker.check_all_complete(&all[1..]).unwrap();
        assert!(!tracker.invalidate_aggregate_before(epoch).unwrap());
        assert!(layout.aggregate_marker().exists());
    }

    #[test]
    fn catalogo_vacio_no_es_completo() {
        let dir = temp_dir("empty");
        let (tracker, layout) = tracker(&dir);
        let report = tracker.check_all_complete(&[]).unwrap();
        assert!(!report.all_complete());
        assert!(!layout.aggregate_marker().exists());
    }
}
