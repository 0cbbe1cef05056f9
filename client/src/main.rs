mod cli;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use common::logging::init_logging;
use std::path::PathBuf;

use crate::cli::{RunArgs, SubmitArgs};

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI de operador para inspeccionar y administrar una corrida de aplicación")]
struct Cli {
    #[command(flatten)]
    run: RunOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunOpts {
    /// Archivo de configuración JSON de la corrida
    #[arg(long, global = true, value_name = "PATH", default_value = "apply.json")]
    config: PathBuf,

    /// Versión / mapeo de respuestas
    #[arg(long, global = true, value_name = "TAG", default_value = "lwr")]
    version: String,

    /// Archivo de credenciales del object store
    #[arg(long, global = true, value_name = "PATH")]
    credentials: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resumen del estado de las unidades
    Status {
        /// Exportar un reporte CSV por unidad
        #[arg(long, value_name = "PATH")]
        csv: Option<PathBuf>,

        /// Listar también las unidades completas
        #[arg(long)]
        all: bool,
    },
    /// Lista los archivos de salida de una unidad
    Results {
        #[arg(long, value_name = "UNIDAD")]
        unit: String,
    },
    /// Libera reclamos (locks) que dejó un worker muerto
    Unlock {
        /// Unidades puntuales (repetible); sin ninguna, todas
        #[arg(long = "unit", value_name = "UNIDAD")]
        units: Vec<String>,

        /// Sólo reclamos más viejos que esta cantidad de segundos
        #[arg(long, value_name = "SEGUNDOS")]
        older_than: Option<u64>,
    },
    /// Re-evalúa el marcador de completitud agregado
    Aggregate,
    /// Envía un job array de workers a SLURM
    Submit {
        /// Cantidad de tareas del array
        #[arg(long, default_value_t = 1)]
        tasks: u32,

        /// Binario del worker a ejecutar en cada tarea
        #[arg(long, default_value = "worker")]
        worker_bin: String,

        /// Argumento extra para sbatch (repetible), ej: --sbatch-arg=--gres=gpu:1
        #[arg(long = "sbatch-arg", value_name = "ARG", allow_hyphen_values = true)]
        sbatch_args: Vec<String>,

        /// Los workers rehacen unidades completas
        #[arg(long)]
        recalculate: bool,

        /// Mostrar el comando sin enviarlo
        #[arg(long)]
        dry_run: bool,

        /// Reenviar aunque la corrida ya exista
        #[arg(short = 'f')]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging("client=info,common=info", None)?;

    let run = RunArgs {
        config: cli.run.config,
        version: cli.run.version,
        credentials: cli.run.credentials,
    };

    match cli.command {
        Commands::Status { csv, all } => cli::status(&run, csv.as_deref(), all),
        Commands::Results { unit } => cli::results(&run, &unit),
        Commands::Unlock { units, older_than } => cli::unlock(&run, units, older_than),
        Commands::Aggregate => cli::aggregate(&run),
        Commands::Submit {
            tasks,
            worker_bin,
            sbatch_args,
            recalculate,
            dry_run,
            force,
        } => cli::submit(
            &run,
            &SubmitArgs {
                tasks,
                worker_bin,
                sbatch_args,
                recalculate,
                dry_run,
                force,
            },
        ),
    }
}
