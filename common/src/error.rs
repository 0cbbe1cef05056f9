//! Tipos de error de la librería.
//!
//! Los binarios (`worker`, `client`) los envuelven con `anyhow`.

use std::{io, path::PathBuf};
use thiserror::Error;

/// Errores del almacén de marcadores (lock / complete).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("error de E/S sobre el marcador {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no se pudo serializar el contenido del marcador: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errores del object store (bucket remoto o directorio local).
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("el object store respondió {status} para {key}")]
    Status { key: String, status: u16 },

    #[error("objeto no encontrado: {0}")]
    NotFound(String),

    #[error("URL inválida para el object store: {0}")]
    InvalidUrl(String),

    #[error("credenciales inválidas en {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },

    #[error("error de E/S en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("respuesta inválida del object store: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no hay object store configurado para resolver {0}")]
    NotConfigured(String),
}

/// Falla de una operación externa (cuerpo de una etapa).
#[derive(Error, Debug)]
pub enum OperationError {
    #[error("{program} terminó con estado {status:?}: {diagnostic}")]
    Failed {
        program: String,
        status: Option<i32>,
        diagnostic: String,
    },

    #[error("no se pudo lanzar {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("falta la entrada requerida {0}")]
    MissingInput(String),

    #[error("la operación no produjo la salida declarada {0}")]
    MissingOutput(String),

    #[error("argumentos inválidos: {0}")]
    InvalidArguments(String),

    #[error("object store: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("E/S: {0}")]
    Io(#[from] io::Error),
}

/// Falla de una etapa concreta de la unidad; el pipeline se aborta al primer caso.
#[derive(Error, Debug)]
#[error("la etapa {stage} de la unidad {unit} falló: {cause}")]
pub struct StageFailure {
    pub unit: String,
    pub stage: String,
    #[source]
    pub cause: OperationError,
}

/// Errores del protocolo de reclamo.
#[derive(Error, Debug)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no se pudo comprobar la existencia de salidas: {0}")]
    Probe(#[from] ObjectStoreError),

    #[error("no se pudo serializar el marcador de reclamo: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errores al cargar o validar la configuración.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no se pudo leer {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuración inválida en {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuración inválida: {0}")]
    Invalid(String),
}

/// Errores al enumerar unidades de trabajo.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("patrón de catálogo inválido: {0}")]
    Pattern(String),

    #[error("error de E/S en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("object store: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

/// Invariantes estructurales que invalidan la corrida completa.
#[derive(Error, Debug)]
pub enum PreflightError {
    #[error(
        "las clases de arrecife deben tener los códigos más altos: \
         reef_top={reef_top}, not_reef_top={not_reef_top}, max(land, water)={max_other}"
    )]
    EncodingOrder {
        reef_top: i32,
        not_reef_top: i32,
        max_other: i32,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errores al preparar una corrida (configuración, object store, catálogo).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
}
