//! Almacén de marcadores: la única primitiva compartida entre workers.
//!
//! El contrato es mínimo (existe / crear-si-no-existe / leer / borrar) para que
//! el protocolo de reclamo y el tracker de completitud puedan montarse sobre
//! otro backend (un servicio de locks distribuido, por ejemplo) sin tocar el
//! pipeline ni el enumerador.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;

pub trait MarkerStore: Send + Sync {
    fn exists(&self, marker: &Path) -> Result<bool, StoreError>;

    /// Crea el marcador sólo si no existe, en una única operación atómica.
    /// Devuelve `false` si ya existía (otro proceso ganó la carrera).
    fn create_exclusive(&self, marker: &Path, payload: &[u8]) -> Result<bool, StoreError>;

    /// Contenido del marcador, `None` si no existe.
    fn read(&self, marker: &Path) -> Result<Option<Vec<u8>>, StoreError>;

    fn modified(&self, marker: &Path) -> Result<Option<SystemTime>, StoreError>;

    /// Borra el marcador. Devuelve `false` si ya no existía.
    fn remove(&self, marker: &Path) -> Result<bool, StoreError>;

    /// Borra el marcador sólo si su contenido sigue siendo `expected`.
    ///
    /// Comparar y borrar tiene que ser una única operación frente a otros
    /// procesos: si entre medio otro worker reemplazó el marcador, el nuevo no
    /// se toca. Devuelve `true` si se borró.
    fn remove_if_unchanged(&self, marker: &Path, expected: &[u8]) -> Result<bool, StoreError>;
}

/// Marcadores como archivos en un filesystem compartido (NFS/Lustre/local).
#[derive(Debug, Clone, Default)]
pub struct FsMarkerStore;

impl FsMarkerStore {
    pub fn new() -> Self {
        Self
    }
}

/// `a.lock` -> `a.lock.{uuid}.tomb`, en el mismo directorio para que el rename sea atómico.
fn tombstone_path(marker: &Path) -> PathBuf {
    let name = marker
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    marker.with_file_name(format!("{}.{}.tomb", name, Uuid::new_v4()))
}

fn io_err(marker: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: marker.to_path_buf(),
        source,
    }
}

impl MarkerStore for FsMarkerStore {
    fn exists(&self, marker: &Path) -> Result<bool, StoreError> {
        match fs::metadata(marker) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(marker, e)),
        }
    }

    fn create_exclusive(&self, marker: &Path, payload: &[u8]) -> Result<bool, StoreError> {
        if let Some(parent) = marker.parent() {
            if !parent.as_os_str().is_empty() {
                // create_dir_all tolera que otro worker cree el directorio a la vez
                fs::create_dir_all(parent).map_err(|e| io_err(marker, e))?;
            }
        }

        // O_CREAT | O_EXCL: chequeo de existencia y creación en una sola llamada
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(marker)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_err(marker, e)),
        };

        if !payload.is_empty() {
            file.write_all(payload).map_err(|e| io_err(marker, e))?;
            file.sync_all().map_err(|e| io_err(marker, e))?;
        }
        Ok(true)
    }

    fn read(&self, marker: &Path) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(marker) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(marker, e)),
        }
    }

    fn modified(&self, marker: &Path) -> Result<Option<SystemTime>, StoreError> {
        match fs::metadata(marker) {
            Ok(meta) => meta.modified().map(Some).map_err(|e| io_err(marker, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(marker, e)),
        }
    }

    fn remove(&self, marker: &Path) -> Result<bool, StoreError> {
        match fs::remove_file(marker) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(marker, e)),
        }
    }

    fn remove_if_unchanged(&self, marker: &Path, expected: &[u8]) -> Result<bool, StoreError> {
        // 1) rename a una lápida propia: de todos los que compiten, uno solo se lleva el archivo
        let tombstone = tombstone_path(marker);
        match fs::rename(marker, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(marker, e)),
        }

        // 2) ¿Era el marcador observado?
        let taken = fs::read(&tombstone).map_err(|e| io_err(&tombstone, e))?;
        if taken == expected {
            fs::remove_file(&tombstone).map_err(|e| io_err(&tombstone, e))?;
            return Ok(true);
        }

        // 3) No: se devuelve con hard_link, que falla si alguien ya creó otro marcador
        match fs::hard_link(&tombstone, marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => warn!(
                "el marcador {} fue reemplazado mientras se comparaba; se descarta el anterior",
                marker.display()
            ),
            Err(e) => return Err(io_err(marker, e)),
        }
        fs::remove_file(&tombstone).map_err(|e| io_err(&tombstone, e))?;
        Ok(false)
    }
}
