//! Operaciones tipadas que forman el cuerpo de las etapas.
//!
//! Ninguna pasa por un shell: cada comando es un programa más un vector de
//! argumentos, con placeholders que se sustituyen por rutas concretas.

use serde::{Deserialize, Serialize};
use std::{path::Path, process::Command, sync::Arc};
use tracing::{debug, error};

use crate::{
    error::OperationError,
    object_store::ObjectStore,
    stage::{StageIo, StageOperation},
    unit::Artifact,
};

/// Tamaño máximo del diagnóstico guardado de stdout/stderr.
const MAX_DIAGNOSTIC: usize = 4000;

/// Comando externo: programa + plantilla de argumentos.
///
/// Placeholders reconocidos:
/// - `{input}`, `{output}`, `{unit}`, `{version}`, `{auxiliary}`: pueden ir
///   dentro de un argumento (`--outfile={output}`).
/// - `{inputs}`, `{outputs}`: sólo como argumento completo; se expanden a
///   tantos argumentos como rutas haya.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Tratar stderr no vacío como falla aunque el estado de salida sea 0.
    #[serde(default)]
    pub fail_on_stderr: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            fail_on_stderr: false,
        }
    }

    pub fn fail_on_stderr(mut self, value: bool) -> Self {
        self.fail_on_stderr = value;
        self
    }
}

fn local_paths<'a>(artifacts: &'a [Artifact], what: &str) -> Result<Vec<&'a Path>, OperationError> {
    artifacts
        .iter()
        .map(|a| {
            a.as_path().ok_or_else(|| {
                OperationError::InvalidArguments(format!(
                    "{what} {a} no es un archivo local; agregar una etapa de descarga"
                ))
            })
        })
        .collect()
}

fn truncate_tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= MAX_DIAGNOSTIC {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DIAGNOSTIC;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[derive(Debug, Clone)]
pub struct CommandOperation {
    spec: CommandSpec,
}

impl CommandOperation {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Vector de argumentos final para esta invocación.
    pub fn render_args(&self, io: &StageIo<'_>) -> Result<Vec<String>, OperationError> {
        let inputs = local_paths(io.inputs, "la entrada")?;
        let outputs = local_paths(io.outputs, "la salida")?;
        let auxiliary = io.unit.auxiliary.as_ref().and_then(|a| a.as_path());

        let single = |placeholder: &str, value: Option<&Path>| -> Result<String, OperationError> {
            value.map(|p| p.to_string_lossy().to_string()).ok_or_else(|| {
                OperationError::InvalidArguments(format!(
                    "{} usa {} pero la etapa no tiene ese recurso",
                    self.spec.program, placeholder
                ))
            })
        };

        let mut args = Vec::with_capacity(self.spec.args.len());
        for template in &self.spec.args {
            match template.as_str() {
                "{inputs}" => args.extend(inputs.iter().map(|p| p.to_string_lossy().to_string())),
                "{outputs}" => args.extend(outputs.iter().map(|p| p.to_string_lossy().to_string())),
                _ => {
                    let mut arg = template.replace("{unit}", &io.unit.key);
                    arg = arg.replace("{version}", io.version.as_str());
                    if arg.contains("{input}") {
                        arg = arg.replace("{input}", &single("{input}", inputs.first().copied())?);
                    }
                    if arg.contains("{output}") {
                        arg = arg.replace("{output}", &single("{output}", outputs.first().copied())?);
                    }
                    if arg.contains("{auxiliary}") {
                        arg = arg.replace("{auxiliary}", &single("{auxiliary}", auxiliary)?);
                    }
                    args.push(arg);
                }
            }
        }
        Ok(args)
    }
}

impl StageOperation for CommandOperation {
    fn run(&self, io: &StageIo<'_>) -> Result<(), OperationError> {
        let args = self.render_args(io)?;
        debug!(unit = %io.unit.key, "ejecutando {} {:?}", self.spec.program, args);

        let output = Command::new(&self.spec.program)
            .args(&args)
            .output()
            .map_err(|source| OperationError::Spawn {
                program: self.spec.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_failure = self.spec.fail_on_stderr && !stderr.trim().is_empty();

        if output.status.success() && !stderr_failure {
            return Ok(());
        }

        error!(unit = %io.unit.key, "{} stdout: {}", self.spec.program, stdout.trim());
        error!(unit = %io.unit.key, "{} stderr: {}", self.spec.program, stderr.trim());
        let diagnostic = if stderr.trim().is_empty() {
            truncate_tail(&stdout)
        } else {
            truncate_tail(&stderr)
        };
        Err(OperationError::Failed {
            program: self.spec.program.clone(),
            status: output.status.code(),
            diagnostic,
        })
    }
}

/* =========================
   Herramientas GDAL
   ========================= */

/// `gdal_calc.py`: raster Byte con 1 donde la clase es arrecife (código >= `min_reef`).
///
/// Depende de que las clases de arrecife tengan los códigos más altos; se
/// verifica en el pre-flight.
pub fn threshold_mask(program: &str, min_reef: i32) -> CommandOperation {
    CommandOperation::new(
        CommandSpec::new(
            program,
            [
                "-A".to_string(),
                "{input}".to_string(),
                "--outfile={output}".to_string(),
                "--type=Byte".to_string(),
                "--NoDataValue=0".to_string(),
                format!("--calc=1*(A>={min_reef}) + 0*(A<{min_reef})"),
            ],
        )
        // gdal_calc.py a veces termina con 0 aunque falle
        .fail_on_stderr(true),
    )
}

/// `gdal_polygonize.py {raster} {shapefile}`.
pub fn polygonize(program: &str) -> CommandOperation {
    CommandOperation::new(CommandSpec::new(program, ["{input}", "{output}"]).fail_on_stderr(true))
}

/* =========================
   Object store
   ========================= */

/// Descarga `inputs[i]` (objetos) en `outputs[i]` (archivos locales).
#[derive(Clone)]
pub struct DownloadInputs {
    store: Arc<dyn ObjectStore>,
}

impl DownloadInputs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl StageOperation for DownloadInputs {
    fn run(&self, io: &StageIo<'_>) -> Result<(), OperationError> {
        if io.inputs.len() != io.outputs.len() {
            return Err(OperationError::InvalidArguments(format!(
                "descarga con {} objetos y {} destinos",
                io.inputs.len(),
                io.outputs.len()
            )));
        }
        for (src, dest) in io.inputs.iter().zip(io.outputs) {
            let (Artifact::Object(key), Artifact::File(path)) = (src, dest) else {
                return Err(OperationError::InvalidArguments(format!(
                    "descarga de {src} a {dest}: se espera objeto -> archivo"
                )));
            };
            debug!(unit = %io.unit.key, "descargando {} a {}", key, path.display());
            self.store.download(key, path)?;
        }
        Ok(())
    }
}

/// Sube `inputs[i]` (archivos locales) a `outputs[i]` (claves del object store).
#[derive(Clone)]
pub struct UploadOutputs {
    store: Arc<dyn ObjectStore>,
}

impl UploadOutputs {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl StageOperation for UploadOutputs {
    fn run(&self, io: &StageIo<'_>) -> Result<(), OperationError> {
        if io.inputs.len() != io.outputs.len() {
            return Err(OperationError::InvalidArguments(format!(
                "subida con {} archivos y {} claves",
                io.inputs.len(),
                io.outputs.len()
            )));
        }
        for (src, dest) in io.inputs.iter().zip(io.outputs) {
            let (Artifact::File(path), Artifact::Object(key)) = (src, dest) else {
                return Err(OperationError::InvalidArguments(format!(
                    "subida de {src} a {dest}: se espera archivo -> objeto"
                )));
            };
            debug!(unit = %io.unit.key, "subiendo {} a {}", path.display(), key);
            self.store.upload(path, key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DownloadInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DownloadInputs")
    }
}

impl std::fmt::Debug for UploadOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UploadOutputs")
    }
}
