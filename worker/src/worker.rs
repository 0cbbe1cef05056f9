use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use common::{
    config::ApplyConfig,
    enumerate::rotate_for_slot,
    logging::{init_logging, LogGuard},
    preflight::preflight,
    ArraySlot, RunLayout, RunSession, Runner, VersionTag, WorkerIdentity,
};
use std::path::PathBuf;
use tracing::{error, info, warn};

const DEFAULT_LOG_DIRECTIVES: &str = "worker=debug,common=debug";

/// Parámetros de una invocación del worker (ver `main.rs`).
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub config: PathBuf,
    pub version: String,
    pub recalculate_since: Option<DateTime<Utc>>,
    pub strict_missing: bool,
    pub credentials: Option<PathBuf>,
}

fn start_logging(config: &ApplyConfig, version: &VersionTag) -> Result<LogGuard> {
    let log_file = config.log_to_file.then(|| {
        RunLayout::new(
            &config.output_root,
            &config.config_name,
            &config.run_name,
            version.clone(),
        )
        .log_file()
    });
    init_logging(DEFAULT_LOG_DIRECTIVES, log_file.as_deref()).context("no se pudo inicializar el log")
}

/// Una pasada completa sobre el catálogo.
///
/// - Falla (exit != 0) sólo por configuración, pre-flight o enumeración, o por
///   unidades sin recurso auxiliar con `--strict-missing`.
/// - Las fallas por unidad se loguean y quedan para la próxima corrida.
pub fn run(args: WorkerArgs) -> Result<()> {
    // 1) Configuración
    let config = ApplyConfig::load(&args.config)
        .with_context(|| format!("cargando {}", args.config.display()))?
        .apply_env_overrides();
    let version = VersionTag::new(&args.version).context("--version inválida")?;
    let _log_guard = start_logging(&config, &version)?;

    // 2) Pre-flight: invariantes que invalidan toda la corrida
    preflight(&config).context("pre-flight")?;

    // 3) Sesión: object store, layout y catálogo
    let identity = WorkerIdentity::detect();
    info!(
        "worker {} en {} (pid {}, tarea de array {:?})",
        identity.worker_id, identity.hostname, identity.pid, identity.array_task
    );
    let session = RunSession::open(config, version, identity, args.credentials.as_deref())
        .context("preparando la corrida")?;
    let mut enumeration = session.enumerate().context("enumerando unidades")?;

    info!(
        "configuración {} versión {}: {} unidades en {}",
        session.config.config_name,
        session.layout().version(),
        enumeration.units.len(),
        session.layout().run_dir().display()
    );
    for missing in &enumeration.missing {
        warn!(unit = %missing.unit, "falta el recurso {}", missing.expected);
    }
    if !enumeration.duplicates.is_empty() {
        warn!("{} tiles descartados por coordenada repetida", enumeration.duplicates.len());
    }

    rotate_for_slot(&mut enumeration.units, ArraySlot::from_env());
    if let Some(since) = args.recalculate_since {
        info!("recalcular: se rehacen las unidades completadas antes de {}", since.to_rfc3339());
    }

    // 4) Loop de unidades + chequeo de agregado
    let planner = session.planner().context("armando el pipeline")?;
    let runner = Runner::new(
        session.ctx.clone(),
        planner,
        session.claim_policy(args.recalculate_since),
    );
    let summary = runner.run(&enumeration.units).context("marcadores de la corrida")?;

    for (unit, diagnostic) in &summary.failed {
        error!(unit = %unit, "{}", diagnostic);
    }
    if summary.aggregate.all_complete() {
        info!("corrida completa: {}", session.layout().aggregate_marker().display());
    }

    // 5) Faltantes: la corrida terminó, pero el catálogo estaba incompleto
    if args.strict_missing && !enumeration.missing.is_empty() {
        bail!(
            "{} unidades sin recurso requerido (--strict-missing)",
            enumeration.missing.len()
        );
    }
    Ok(())
}
