use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::error::ConfigError;

pub type UnitKey = String;

/* --------- Coordenadas de grilla --------- */

/// Coordenada de un tile en la grilla del mosaico.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCoord {
    pub x: i32,
    pub y: i32,
}

impl GridCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Vecindario 8-conexo, sin incluir la propia coordenada.
    pub fn neighbours(self) -> impl Iterator<Item = GridCoord> {
        (-1..=1)
            .flat_map(move |dx| (-1..=1).map(move |dy| (dx, dy)))
            .filter(|&(dx, dy)| dx != 0 || dy != 0)
            .map(move |(dx, dy)| GridCoord::new(self.x + dx, self.y + dy))
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/* --------- Versión de salida --------- */

/// Etiqueta que separa conjuntos de salidas de la misma unidad
/// (versión de modelo / mapeo de respuestas).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, ConfigError> {
        let tag = tag.into();
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::Invalid("la versión no puede estar vacía".into()));
        }
        if trimmed == "." || trimmed == ".." || trimmed.contains(&['/', '\\'][..]) {
            return Err(ConfigError::Invalid(format!(
                "la versión {tag:?} no puede contener separadores de ruta"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for VersionTag {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionTag::new(s)
    }
}

impl TryFrom<String> for VersionTag {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VersionTag::new(value)
    }
}

impl From<VersionTag> for String {
    fn from(tag: VersionTag) -> Self {
        tag.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/* --------- Recursos de entrada / salida --------- */

/// Un recurso que consume o produce una etapa: archivo local u objeto remoto.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Artifact {
    File(PathBuf),
    Object(String),
}

impl Artifact {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Artifact::File(path.into())
    }

    pub fn object(key: impl Into<String>) -> Self {
        Artifact::Object(key.into())
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Artifact::File(path) => Some(path),
            Artifact::Object(_) => None,
        }
    }

    /// Nombre base sin extensión (ej: `L15-0123E-0456N`).
    pub fn stem(&self) -> Option<String> {
        match self {
            Artifact::File(path) => path.file_stem().map(|s| s.to_string_lossy().to_string()),
            Artifact::Object(key) => {
                let name = key.rsplit('/').next().unwrap_or(key);
                let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
                if stem.is_empty() {
                    None
                } else {
                    Some(stem.to_string())
                }
            }
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::File(path) => write!(f, "{}", path.display()),
            Artifact::Object(key) => write!(f, "object://{}", key),
        }
    }
}

/* --------- Unidad de trabajo --------- */

/// Ítem procesable de forma independiente (un tile o un arrecife).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub key: UnitKey,
    /// Sub-ruta dentro del catálogo (región del mosaico), si la hay.
    pub region: Option<String>,
    pub coord: Option<GridCoord>,
    pub primary: Artifact,
    /// Tiles vecinos que aportan contexto espacial.
    pub context: Vec<Artifact>,
    /// Recurso del dataset auxiliar asociado, si se exige uno.
    pub auxiliary: Option<Artifact>,
}

impl WorkUnit {
    pub fn new(key: impl Into<UnitKey>, primary: Artifact) -> Self {
        Self {
            key: key.into(),
            region: None,
            coord: None,
            primary,
            context: Vec::new(),
            auxiliary: None,
        }
    }

    pub fn with_coord(mut self, coord: GridCoord) -> Self {
        self.coord = Some(coord);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        let region = region.into();
        self.region = if region.is_empty() { None } else { Some(region) };
        self
    }
}

/* --------- Layout de marcadores y salidas --------- */

/// Rutas deterministas de una corrida:
///
/// ```text
/// {output_root}/{config_name}/{version}/               <- run_dir
/// {run_dir}/{run_name}.complete                         <- marcador agregado
/// {run_dir}/[{region}/]{unit}/{run_name}.lock           <- reclamo
/// {run_dir}/[{region}/]{unit}/{unit}.complete           <- unidad completa
/// {run_dir}/[{region}/]{unit}/{unit}_{suffix}_{version}.{ext}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: PathBuf,
    run_name: String,
    version: VersionTag,
}

impl RunLayout {
    pub fn new(
        output_root: impl AsRef<Path>,
        config_name: &str,
        run_name: &str,
        version: VersionTag,
    ) -> Self {
        let run_dir = output_root
            .as_ref()
            .join(config_name)
            .join(version.as_str());
        Self {
            run_dir,
            run_name: run_name.to_string(),
            version,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn version(&self) -> &VersionTag {
        &self.version
    }

    pub fn aggregate_marker(&self) -> PathBuf {
        self.run_dir.join(format!("{}.complete", self.run_name))
    }

    pub fn log_file(&self) -> PathBuf {
        self.run_dir.join(format!("{}.log", self.run_name))
    }

    pub fn unit_dir(&self, unit: &WorkUnit) -> PathBuf {
        let mut dir = self.run_dir.clone();
        if let Some(region) = &unit.region {
            for part in region.split('/').filter(|p| !p.is_empty()) {
                dir.push(part);
            }
        }
        dir.join(&unit.key)
    }

    pub fn claim_marker(&self, unit: &WorkUnit) -> PathBuf {
        self.unit_dir(unit).join(format!("{}.lock", self.run_name))
    }

    pub fn completion_marker(&self, unit: &WorkUnit) -> PathBuf {
        self.unit_dir(unit).join(format!("{}.complete", unit.key))
    }

    /// Salida de etapa con nombre namespaced por versión.
    pub fn output_file(&self, unit: &WorkUnit, suffix: &str, ext: &str) -> PathBuf {
        self.unit_dir(unit).join(format!(
            "{}_{}_{}.{}",
            unit.key, suffix, self.version, ext
        ))
    }

    /// Copia local de un recurso de entrada (no depende de la versión).
    pub fn input_copy(&self, unit: &WorkUnit, name: &str, suffix: &str, ext: &str) -> PathBuf {
        self.unit_dir(unit).join(format!("{}_{}.{}", name, suffix, ext))
    }
}
