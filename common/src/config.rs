//! Configuración de una corrida de aplicación (JSON).
//!
//! Ejemplo mínimo:
//!
//! ```json
//! {
//!   "config_name": "dense_unet_128",
//!   "output_root": "/scratch/applied",
//!   "source": { "kind": "directories", "root": "/scratch/evaluation_data" },
//!   "encodings": { "land": 1, "water": 2, "reef_top": 3, "not_reef_top": 4 },
//!   "commands": {
//!     "inference": { "program": "apply_model", "args": ["--features", "{input}", "--out", "{output}"] },
//!     "classify":  { "program": "calc_mle",    "args": ["{input}", "{output}"] }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};

use crate::{
    error::{ConfigError, ObjectStoreError},
    object_store::{read_access_token, HttpObjectStore, LocalObjectStore, ObjectStore, DEFAULT_GCS_BASE_URL},
    operations::CommandSpec,
    enumerate::DEFAULT_TILE_PATTERN,
};

pub const ENV_OUTPUT_ROOT: &str = "REEF_OUTPUT_ROOT";
pub const ENV_MAX_CLAIM_AGE: &str = "REEF_MAX_CLAIM_AGE_SECS";
pub const ENV_CREDENTIALS: &str = "REEF_CREDENTIALS";

fn default_run_name() -> String {
    "apply".to_string()
}

fn default_excluded_regions() -> Vec<String> {
    vec!["test".to_string()]
}

fn default_tile_pattern() -> String {
    DEFAULT_TILE_PATTERN.to_string()
}

fn default_primary_file() -> String {
    "features.vrt".to_string()
}

fn default_base_url() -> String {
    DEFAULT_GCS_BASE_URL.to_string()
}

fn default_gdal_calc() -> String {
    "gdal_calc.py".to_string()
}

fn default_gdal_polygonize() -> String {
    "gdal_polygonize.py".to_string()
}

/// De dónde salen las unidades de trabajo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Tiles de un mosaico, en un directorio local o bajo un prefijo del object store.
    Tiles {
        #[serde(default)]
        directory: Option<PathBuf>,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_excluded_regions")]
        exclude_regions: Vec<String>,
        #[serde(default = "default_tile_pattern")]
        pattern: String,
    },
    /// Un sub-directorio por arrecife (calibración / validación).
    Directories {
        root: PathBuf,
        #[serde(default = "default_primary_file")]
        primary_file: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxiliaryConfig {
    pub directory: PathBuf,
    /// Cada unidad necesita `{unit}{suffix}` dentro de `directory`.
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// URL base de la API; `file:///ruta` usa un directorio local como bucket.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub bucket: String,
    /// Archivos de credenciales candidatos, en orden de preferencia.
    #[serde(default)]
    pub credential_paths: Vec<PathBuf>,
    /// Bucket público: se permite no tener credenciales.
    #[serde(default)]
    pub anonymous: bool,
}

impl ObjectStoreConfig {
    /// Construye el cliente una sola vez; se pasa explícitamente a quien lo use.
    pub fn connect(&self, credentials: Option<&Path>) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
        if let Some(root) = self.base_url.strip_prefix("file://") {
            let root = Path::new(root).join(&self.bucket);
            info!("object store local en {}", root.display());
            return Ok(Arc::new(LocalObjectStore::new(root)));
        }

        let token = match credentials {
            Some(path) => Some(read_access_token(path)?),
            None => None,
        };
        info!("object store {} (bucket {})", self.base_url, self.bucket);
        Ok(Arc::new(HttpObjectStore::new(&self.base_url, &self.bucket, token)?))
    }
}

/// Códigos de clase del raster MLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encodings {
    pub land: i32,
    pub water: i32,
    pub reef_top: i32,
    pub not_reef_top: i32,
}

impl Encodings {
    /// Umbral de la máscara de arrecifes.
    pub fn min_reef(&self) -> i32 {
        self.reef_top.min(self.not_reef_top)
    }

    pub fn max_other(&self) -> i32 {
        self.land.max(self.water)
    }
}

/// Modelo y reducción MLE: herramientas externas configurables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCommands {
    pub inference: CommandSpec,
    pub classify: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdalTools {
    #[serde(default = "default_gdal_calc")]
    pub gdal_calc: String,
    #[serde(default = "default_gdal_polygonize")]
    pub gdal_polygonize: String,
}

impl Default for GdalTools {
    fn default() -> Self {
        Self {
            gdal_calc: default_gdal_calc(),
            gdal_polygonize: default_gdal_polygonize(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    pub config_name: String,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    pub output_root: PathBuf,
    pub source: SourceConfig,
    #[serde(default)]
    pub auxiliary: Option<AuxiliaryConfig>,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    pub encodings: Encodings,
    pub commands: StageCommands,
    #[serde(default)]
    pub tools: GdalTools,
    /// Edad a partir de la cual un reclamo se considera abandonado.
    /// Sin valor, los reclamos nunca se recuperan automáticamente.
    #[serde(default)]
    pub max_claim_age_secs: Option<u64>,
    /// Prefijo del object store donde publicar probabilidades y MLE.
    #[serde(default)]
    pub upload_prefix: Option<String>,
    #[serde(default)]
    pub log_to_file: bool,
}

fn check_name(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} no puede estar vacío")));
    }
    if value.contains(&['/', '\\'][..]) || value == "." || value == ".." {
        return Err(ConfigError::Invalid(format!(
            "{field}={value:?} no puede contener separadores de ruta"
        )));
    }
    Ok(())
}

impl ApplyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ApplyConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("configuración {} cargada desde {}", config.config_name, path.display());
        Ok(config)
    }

    /// Aplica las variables de entorno `REEF_OUTPUT_ROOT` y `REEF_MAX_CLAIM_AGE_SECS`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(root) = env::var(ENV_OUTPUT_ROOT).ok().filter(|s| !s.trim().is_empty()) {
            self.output_root = PathBuf::from(root);
        }
        if let Some(secs) = env::var(ENV_MAX_CLAIM_AGE)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            self.max_claim_age_secs = Some(secs);
        }
        self
    }

    pub fn max_claim_age(&self) -> Option<Duration> {
        self.max_claim_age_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_name("config_name", &self.config_name)?;
        check_name("run_name", &self.run_name)?;

        for (name, spec) in [
            ("commands.inference", &self.commands.inference),
            ("commands.classify", &self.commands.classify),
        ] {
            if spec.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name}.program está vacío")));
            }
        }
        if self.tools.gdal_calc.trim().is_empty() || self.tools.gdal_polygonize.trim().is_empty() {
            return Err(ConfigError::Invalid("tools: programa GDAL vacío".into()));
        }

        match &self.source {
            SourceConfig::Tiles {
                directory, prefix, ..
            } => match (directory, prefix) {
                (Some(_), None) => {}
                (None, Some(_)) if self.object_store.is_some() => {}
                (None, Some(_)) => {
                    return Err(ConfigError::Invalid(
                        "source.prefix requiere una sección object_store".into(),
                    ))
                }
                _ => {
                    return Err(ConfigError::Invalid(
                        "source de tiles necesita exactamente uno de directory o prefix".into(),
                    ))
                }
            },
            SourceConfig::Directories { primary_file, .. } => {
                if primary_file.trim().is_empty() {
                    return Err(ConfigError::Invalid("source.primary_file está vacío".into()));
                }
            }
        }

        if self.upload_prefix.is_some() && self.object_store.is_none() {
            return Err(ConfigError::Invalid(
                "upload_prefix requiere una sección object_store".into(),
            ));
        }
        if let Some(aux) = &self.auxiliary {
            if aux.suffix.is_empty() {
                return Err(ConfigError::Invalid("auxiliary.suffix está vacío".into()));
            }
        }
        Ok(())
    }

    /// Archivo de credenciales del object store, con precedencia:
    /// flag de CLI, luego `REEF_CREDENTIALS`, luego `credential_paths` en orden.
    pub fn resolve_credentials(&self, cli: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
        let Some(store) = &self.object_store else {
            return Ok(None);
        };
        let from_env = env::var(ENV_CREDENTIALS).ok().filter(|s| !s.trim().is_empty());
        resolve_credentials_from(cli, from_env.as_deref().map(Path::new), store)
    }
}

fn resolve_credentials_from(
    cli: Option<&Path>,
    from_env: Option<&Path>,
    store: &ObjectStoreConfig,
) -> Result<Option<PathBuf>, ConfigError> {
    // 1) Explícitas: si se indicaron, tienen que existir
    for (origin, path) in [("--credentials", cli), (ENV_CREDENTIALS, from_env)] {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "{origin}: no existe el archivo de credenciales {}",
                    path.display()
                )));
            }
            return Ok(Some(path.to_path_buf()));
        }
    }

    // 2) Candidatas de la configuración: la primera que exista
    if let Some(found) = store.credential_paths.iter().find(|p| p.is_file()) {
        return Ok(Some(found.clone()));
    }

    if store.anonymous || store.base_url.starts_with("file://") {
        return Ok(None);
    }
    Err(ConfigError::Invalid(format!(
        "no se encontraron credenciales en {:?} y el object store no es anónimo",
        store.credential_paths
    )))
}
