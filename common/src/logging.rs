//! Inicialización de `tracing` para los binarios.
//!
//! Siempre se loguea a stdout; opcionalmente también a un archivo por corrida
//! (`{run_dir}/{run_name}.log`), compartido en modo append por todos los
//! workers de la corrida.

use std::{fs, io, path::Path};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Mantener vivo mientras dure el proceso: al soltarlo se vacía el buffer del archivo.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// `default_directives` se usa cuando `RUST_LOG` no está definida
/// (ej: `"worker=debug,common=debug"`).
pub fn init_logging(default_directives: &str, log_file: Option<&Path>) -> io::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(io::stdout).boxed();

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "ruta de log sin nombre de archivo"))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // si ya había un subscriber global (tests), se deja el existente
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
