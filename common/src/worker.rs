use serde::{Deserialize, Serialize};
use std::env;

pub type WorkerId = String;

/// Identidad del proceso worker que queda escrita en los marcadores.
///
/// Sólo se usa para diagnóstico: la exclusión mutua depende únicamente de la
/// existencia del marcador, no de su contenido.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub pid: u32,
    /// Índice de la tarea dentro del job array (SLURM_ARRAY_TASK_ID), si existe.
    pub array_task: Option<u32>,
}

impl WorkerIdentity {
    /// Identidad nueva para este proceso: uuid + host + pid.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let array_task = env::var("SLURM_ARRAY_TASK_ID")
            .ok()
            .and_then(|s| s.parse::<u32>().ok());

        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            hostname,
            pid: std::process::id(),
            array_task,
        }
    }

    /// Identidad fija, útil en tests y en herramientas de operador.
    pub fn named(worker_id: impl Into<WorkerId>) -> Self {
        Self {
            worker_id: worker_id.into(),
            hostname: "localhost".to_string(),
            pid: std::process::id(),
            array_task: None,
        }
    }
}

/// Posición de este proceso dentro de un job array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArraySlot {
    pub index: u32,
    pub count: u32,
}

impl ArraySlot {
    /// Lee SLURM_ARRAY_TASK_ID / SLURM_ARRAY_TASK_COUNT.
    pub fn from_env() -> Option<Self> {
        let index = env::var("SLURM_ARRAY_TASK_ID")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())?;
        let count = env::var("SLURM_ARRAY_TASK_COUNT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())?;
        Self::new(index, count)
    }

    pub fn new(index: u32, count: u32) -> Option<Self> {
        if count == 0 {
            return None;
        }
        Some(Self {
            index: index % count,
            count,
        })
    }
}
