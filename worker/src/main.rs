mod worker;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

use crate::worker::WorkerArgs;

/// Un proceso por tarea del job array; todos corren el mismo comando y se
/// reparten las unidades a través de los marcadores en disco.
#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Aplica el modelo a todas las unidades pendientes del catálogo")]
struct Args {
    /// Archivo de configuración JSON de la corrida
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Versión / mapeo de respuestas de las salidas
    #[arg(long, value_name = "TAG")]
    version: String,

    /// Rehacer todas las unidades aunque estén completas
    #[arg(long)]
    recalculate: bool,

    /// Rehacer las unidades completadas antes de este instante (RFC 3339).
    /// Todas las tareas de un mismo envío reciben el mismo valor.
    #[arg(long, value_name = "FECHA", conflicts_with = "recalculate")]
    recalculate_since: Option<DateTime<Utc>>,

    /// Terminar con error si hay unidades sin recurso auxiliar
    #[arg(long)]
    strict_missing: bool,

    /// Archivo de credenciales del object store (pisa REEF_CREDENTIALS)
    #[arg(long, value_name = "PATH")]
    credentials: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    worker::run(WorkerArgs {
        config: args.config,
        version: args.version,
        // sin época explícita, la del arranque de este proceso
        recalculate_since: args
            .recalculate_since
            .or_else(|| args.recalculate.then(Utc::now)),
        strict_missing: args.strict_missing,
        credentials: args.credentials,
    })
}
