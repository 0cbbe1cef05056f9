use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc};

use crate::{
    error::OperationError,
    unit::{Artifact, VersionTag, WorkUnit},
};

/// Lo que ve el cuerpo de una etapa al ejecutarse.
///
/// `outputs` son los destinos de escritura: con commit `Staged` apuntan a los
/// nombres `.partial` y no a las rutas finales.
#[derive(Debug)]
pub struct StageIo<'a> {
    pub unit: &'a WorkUnit,
    pub version: &'a VersionTag,
    pub inputs: &'a [Artifact],
    pub outputs: &'a [Artifact],
}

impl<'a> StageIo<'a> {
    /// Rutas locales de las entradas, en orden.
    pub fn input_paths(&self) -> Vec<&'a Path> {
        self.inputs.iter().filter_map(|a| a.as_path()).collect()
    }

    pub fn output_paths(&self) -> Vec<&'a Path> {
        self.outputs.iter().filter_map(|a| a.as_path()).collect()
    }
}

/// Cuerpo de una etapa: una operación externa con entradas y salidas explícitas.
pub trait StageOperation: Send + Sync {
    fn run(&self, io: &StageIo<'_>) -> Result<(), OperationError>;
}

impl<F> StageOperation for F
where
    F: Fn(&StageIo<'_>) -> Result<(), OperationError> + Send + Sync,
{
    fn run(&self, io: &StageIo<'_>) -> Result<(), OperationError> {
        self(io)
    }
}

/// Cómo llegan las salidas locales a su ruta final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Commit {
    /// Se escribe en `{stem}.partial.{ext}` y se renombra al terminar bien.
    #[default]
    Staged,
    /// Se escribe directo en la ruta final (herramientas que generan archivos
    /// auxiliares, como los shapefiles).
    Direct,
}

/// Un paso del pipeline de una unidad.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
    pub commit: Commit,
    operation: Arc<dyn StageOperation>,
}

impl Stage {
    pub fn new(name: impl Into<String>, operation: Arc<dyn StageOperation>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            commit: Commit::default(),
            operation,
        }
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = Artifact>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = Artifact>) -> Self {
        self.outputs = outputs.into_iter().collect();
        self
    }

    pub fn commit(mut self, commit: Commit) -> Self {
        self.commit = commit;
        self
    }

    pub fn operation(&self) -> &dyn StageOperation {
        self.operation.as_ref()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("commit", &self.commit)
            .finish()
    }
}
