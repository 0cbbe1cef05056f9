//! Enumeración de unidades de trabajo a partir de un catálogo de entrada.
//!
//! Dos formas de catálogo:
//! - tiles de un mosaico (`L15-XXXXE-YYYYN.tif`), con vecinos 8-conexos como contexto;
//! - directorios de arrecifes (calibración / validación), uno por unidad.
//!
//! La enumeración no depende del estado de claims ni de completitud; sólo lee
//! el catálogo y devuelve la lista ordenada de unidades.

use glob::glob;
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

use crate::{
    error::EnumerationError,
    object_store::ObjectStore,
    unit::{Artifact, GridCoord, WorkUnit},
    worker::ArraySlot,
};

pub const DEFAULT_TILE_PATTERN: &str = r"L15-(?P<x>\d+)E-(?P<y>\d+)N";

/* =========================
   Catálogos
   ========================= */

/// Fuente listable de recursos con nombre.
///
/// Los nombres son relativos a la raíz del catálogo y usan `/` como separador.
pub trait Catalog: Send + Sync {
    fn list_names(&self) -> Result<Vec<String>, EnumerationError>;

    /// Artefacto que corresponde a un nombre devuelto por `list_names`.
    fn locate(&self, name: &str) -> Artifact;
}

/// Directorio local recorrido recursivamente.
#[derive(Debug, Clone)]
pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Catalog for DirCatalog {
    fn list_names(&self) -> Result<Vec<String>, EnumerationError> {
        if !self.root.is_dir() {
            return Err(EnumerationError::Io {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "el catálogo no existe"),
            });
        }
        let pattern = format!("{}/**/*", glob::Pattern::escape(&self.root.to_string_lossy()));
        let entries = glob(&pattern).map_err(|e| EnumerationError::Pattern(e.to_string()))?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| EnumerationError::Io {
                path: e.path().to_path_buf(),
                source: e.into_error(),
            })?;
            if !path.is_file() {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(&self.root) {
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn locate(&self, name: &str) -> Artifact {
        let mut path = self.root.clone();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        Artifact::File(path)
    }
}

/// Prefijo de un object store.
#[derive(Clone)]
pub struct ObjectCatalog {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectCatalog {
    /// `prefix` se normaliza para terminar en `/` (salvo que sea vacío).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        let prefix = prefix.trim_start_matches('/');
        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self { store, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Catalog for ObjectCatalog {
    fn list_names(&self) -> Result<Vec<String>, EnumerationError> {
        let keys = self.store.list(&self.prefix)?;
        let mut names: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .filter(|n| !n.is_empty() && !n.ends_with('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    fn locate(&self, name: &str) -> Artifact {
        Artifact::Object(format!("{}{}", self.prefix, name))
    }
}

impl std::fmt::Debug for ObjectCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCatalog")
            .field("prefix", &self.prefix)
            .finish()
    }
}

/* =========================
   Resultado de la enumeración
   ========================= */

/// Unidad excluida porque le falta un recurso esperado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingInput {
    pub unit: String,
    pub expected: String,
}

#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub units: Vec<WorkUnit>,
    /// Faltantes no fatales (el worker decide si son fatales con `--strict-missing`).
    pub missing: Vec<MissingInput>,
    /// Nombres del catálogo que no son unidades (no matchean el patrón).
    pub ignored: Vec<String>,
    /// Nombres descartados por repetir una coordenada ya vista.
    pub duplicates: Vec<String>,
}

impl Enumeration {
    pub fn keys(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.key.as_str()).collect()
    }
}

/* =========================
   Tiles del mosaico
   ========================= */

/// Extrae la coordenada de grilla del nombre de un tile.
#[derive(Debug, Clone)]
pub struct TileNameParser {
    regex: Regex,
}

impl TileNameParser {
    /// El patrón debe tener los grupos con nombre `x` e `y`.
    pub fn new(pattern: &str) -> Result<Self, EnumerationError> {
        let regex = Regex::new(pattern).map_err(|e| EnumerationError::Pattern(e.to_string()))?;
        let names: HashSet<&str> = regex.capture_names().flatten().collect();
        if !names.contains("x") || !names.contains("y") {
            return Err(EnumerationError::Pattern(format!(
                "{pattern} debe definir los grupos (?P<x>..) y (?P<y>..)"
            )));
        }
        Ok(Self { regex })
    }

    pub fn parse(&self, stem: &str) -> Option<GridCoord> {
        let caps = self.regex.captures(stem)?;
        let x = caps.name("x")?.as_str().parse::<i32>().ok()?;
        let y = caps.name("y")?.as_str().parse::<i32>().ok()?;
        Some(GridCoord::new(x, y))
    }
}

/// Separa `region/sub/L15-0001E-0002N.tif` en (`region/sub`, `L15-0001E-0002N`).
fn split_tile_name(name: &str) -> (String, String) {
    let (region, file) = match name.rsplit_once('/') {
        Some((region, file)) => (region.to_string(), file),
        None => (String::new(), name),
    };
    let stem = file.strip_suffix(".tif").unwrap_or(file).to_string();
    (region, stem)
}

fn region_excluded(region: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|ex| {
        let ex = ex.trim_matches('/');
        !ex.is_empty() && (region == ex || region.starts_with(&format!("{ex}/")))
    })
}

pub struct TileEnumerator {
    catalog: Arc<dyn Catalog>,
    parser: TileNameParser,
    exclude_regions: Vec<String>,
}

impl TileEnumerator {
    pub fn new(catalog: Arc<dyn Catalog>, parser: TileNameParser) -> Self {
        Self {
            catalog,
            parser,
            exclude_regions: Vec::new(),
        }
    }

    pub fn exclude_regions(mut self, regions: impl IntoIterator<Item = String>) -> Self {
        self.exclude_regions = regions.into_iter().collect();
        self
    }

    pub fn enumerate(&self) -> Result<Enumeration, EnumerationError> {
        let names = self.catalog.list_names()?;
        debug!("{} recursos en el catálogo", names.len());

        let mut out = Enumeration::default();
        // coordenada -> índice en out.units
        let mut index: HashMap<GridCoord, usize> = HashMap::new();

        // 1) Filtrar y parsear
        for name in names {
            if !name.ends_with(".tif") {
                continue;
            }
            let (region, stem) = split_tile_name(&name);
            if region_excluded(&region, &self.exclude_regions) {
                continue;
            }
            let Some(coord) = self.parser.parse(&stem) else {
                out.ignored.push(name);
                continue;
            };
            if let Some(&first) = index.get(&coord) {
                warn!(
                    "coordenada {} repetida: se usa {} y se descarta {}",
                    coord, out.units[first].primary, name
                );
                out.duplicates.push(name);
                continue;
            }
            index.insert(coord, out.units.len());
            out.units.push(
                WorkUnit::new(stem, self.catalog.locate(&name))
                    .with_region(region)
                    .with_coord(coord),
            );
        }

        // 2) Contexto: vecinos 8-conexos presentes en el catálogo
        let neighbours: Vec<Vec<Artifact>> = out
            .units
            .iter()
            .map(|unit| {
                unit.coord
                    .map(|c| {
                        c.neighbours()
                            .filter_map(|n| index.get(&n))
                            .map(|&i| out.units[i].primary.clone())
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();
        for (unit, context) in out.units.iter_mut().zip(neighbours) {
            unit.context = context;
        }

        info!(
            "{} tiles enumerados ({} ignorados, {} duplicados)",
            out.units.len(),
            out.ignored.len(),
            out.duplicates.len()
        );
        Ok(out)
    }
}

/* =========================
   Directorios de arrecifes
   ========================= */

/// Cada sub-directorio de `root` es una unidad con entrada principal `primary_file`.
#[derive(Debug, Clone)]
pub struct DirectoryEnumerator {
    root: PathBuf,
    primary_file: String,
}

impl DirectoryEnumerator {
    pub fn new(root: impl Into<PathBuf>, primary_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            primary_file: primary_file.into(),
        }
    }

    pub fn enumerate(&self) -> Result<Enumeration, EnumerationError> {
        let io_err = |path: &Path, source| EnumerationError::Io {
            path: path.to_path_buf(),
            source,
        };
        let entries = fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        dirs.sort();

        let mut out = Enumeration::default();
        for name in dirs {
            let primary = self.root.join(&name).join(&self.primary_file);
            if !primary.is_file() {
                out.missing.push(MissingInput {
                    unit: name,
                    expected: primary.display().to_string(),
                });
                continue;
            }
            out.units.push(WorkUnit::new(name, Artifact::File(primary)));
        }

        info!(
            "{} directorios enumerados en {} ({} sin {})",
            out.units.len(),
            self.root.display(),
            out.missing.len(),
            self.primary_file
        );
        Ok(out)
    }
}

/* =========================
   Dataset auxiliar y orden
   ========================= */

/// Exige `{unit}{suffix}` en el catálogo auxiliar para cada unidad.
///
/// Las unidades sin recurso auxiliar se sacan de la lista y se agregan a `missing`.
pub fn require_auxiliary(
    mut enumeration: Enumeration,
    auxiliary: &dyn Catalog,
    suffix: &str,
) -> Result<Enumeration, EnumerationError> {
    // nombre de archivo -> nombre completo en el catálogo
    let mut available: HashMap<String, String> = HashMap::new();
    for name in auxiliary.list_names()? {
        let file = name.rsplit('/').next().unwrap_or(&name).to_string();
        available.entry(file).or_insert(name);
    }

    let units = std::mem::take(&mut enumeration.units);
    for mut unit in units {
        let expected = format!("{}{}", unit.key, suffix);
        match available.get(&expected) {
            Some(name) => {
                unit.auxiliary = Some(auxiliary.locate(name));
                enumeration.units.push(unit);
            }
            None => {
                debug!(unit = %unit.key, "falta el recurso auxiliar {}", expected);
                enumeration.missing.push(MissingInput {
                    unit: unit.key,
                    expected,
                });
            }
        }
    }

    if !enumeration.missing.is_empty() {
        warn!(
            "{} unidades sin recurso auxiliar; se excluyen de la corrida",
            enumeration.missing.len()
        );
    }
    Ok(enumeration)
}

/// Rota la lista para que cada tarea del array empiece en un punto distinto.
///
/// Es sólo una optimización contra la contención: el resultado de la corrida
/// no depende del orden.
pub fn rotate_for_slot(units: &mut [WorkUnit], slot: Option<ArraySlot>) {
    let Some(slot) = slot else {
        return;
    };
    if units.is_empty() {
        return;
    }
    let offset = (slot.index as usize * units.len()) / slot.count as usize;
    units.rotate_left(offset % units.len());
}
