use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::{
    config::ApplyConfig,
    status::{count_states, inspect_all, release_claims, unit_files, write_csv_report, ReleaseFilter},
    RunSession, VersionTag, WorkerIdentity,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use tracing::{info, warn};

/// Lo que todos los subcomandos necesitan para abrir la corrida.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub config: PathBuf,
    pub version: String,
    pub credentials: Option<PathBuf>,
}

fn open_session(args: &RunArgs) -> Result<RunSession> {
    let config = ApplyConfig::load(&args.config)
        .with_context(|| format!("cargando {}", args.config.display()))?
        .apply_env_overrides();
    config.validate()?;
    let version = VersionTag::new(&args.version).context("--version inválida")?;
    let session = RunSession::open(
        config,
        version,
        WorkerIdentity::named("client"),
        args.credentials.as_deref(),
    )?;
    Ok(session)
}

pub fn status(args: &RunArgs, csv: Option<&Path>, all: bool) -> Result<()> {
    let session = open_session(args)?;
    let enumeration = session.enumerate()?;
    let planner = session.planner()?;
    let statuses = inspect_all(&session.ctx, planner.as_ref(), &enumeration.units)?;
    let counts = count_states(&statuses);

    println!(
        "Corrida {} / {}",
        session.config.config_name,
        session.layout().version()
    );
    println!("  directorio  : {}", session.layout().run_dir().display());
    println!("  unidades    : {}", counts.total());
    println!("  completas   : {}", counts.complete);
    println!("  reclamadas  : {}", counts.claimed);
    println!("  parciales   : {}", counts.partial);
    println!("  pendientes  : {}", counts.pending);
    if !enumeration.missing.is_empty() {
        println!("  sin recurso : {}", enumeration.missing.len());
    }
    if counts.total() > 0 {
        let pct = (counts.complete as f64 / counts.total() as f64) * 100.0;
        println!("  progreso    : {:.1}%", pct);
    }
    println!(
        "  agregado    : {}",
        if session.layout().aggregate_marker().exists() {
            "presente"
        } else {
            "ausente"
        }
    );

    // sin --all sólo se listan las unidades que no están completas
    let listed: Vec<_> = statuses
        .iter()
        .filter(|s| all || s.state != common::status::UnitState::Complete)
        .collect();
    if !listed.is_empty() {
        println!();
        for status in listed {
            println!("  {}", status);
        }
    }
    for missing in &enumeration.missing {
        println!("  {:<24} sin {}", missing.unit, missing.expected);
    }

    if let Some(path) = csv {
        let file = fs::File::create(path).with_context(|| format!("creando {}", path.display()))?;
        write_csv_report(file, &statuses)?;
        println!();
        println!("Reporte CSV escrito en {}", path.display());
    }
    Ok(())
}

pub fn results(args: &RunArgs, unit_key: &str) -> Result<()> {
    let session = open_session(args)?;
    let enumeration = session.enumerate()?;
    let Some(unit) = enumeration.units.iter().find(|u| u.key == unit_key) else {
        println!("La unidad {unit_key} no está en el catálogo");
        return Ok(());
    };

    let dir = session.layout().unit_dir(unit);
    let files = unit_files(&dir)?;
    println!("Resultados para {}:", unit.key);
    println!("  directorio de salida: {}", dir.display());
    if files.is_empty() {
        println!("  (sin archivos de salida)");
    } else {
        println!("  archivos:");
        for f in files {
            println!("    - {}", f.display());
        }
    }
    Ok(())
}

pub fn unlock(args: &RunArgs, units: Vec<String>, older_than: Option<u64>) -> Result<()> {
    let session = open_session(args)?;
    let enumeration = session.enumerate()?;
    let filter = ReleaseFilter {
        units,
        older_than: older_than.map(Duration::from_secs),
    };
    let released = release_claims(&session.ctx, &enumeration.units, &filter)?;
    if released.is_empty() {
        println!("No se liberó ningún reclamo.");
    } else {
        println!("Reclamos liberados:");
        for marker in released {
            println!("  - {}", marker.display());
        }
    }
    Ok(())
}

pub fn aggregate(args: &RunArgs) -> Result<()> {
    let session = open_session(args)?;
    let enumeration = session.enumerate()?;
    let tracker = common::CompletionTracker::new(session.ctx.clone());
    let report = tracker.check_all_complete(&enumeration.units)?;

    println!("Unidades completas: {}/{}", report.complete, report.total);
    if report.all_complete() {
        println!(
            "Corrida completa: {}",
            session.layout().aggregate_marker().display()
        );
    } else {
        println!("Faltan {} unidades", report.pending());
    }
    Ok(())
}

/* =========================
   Envío al scheduler
   ========================= */

#[derive(Debug, Clone)]
pub struct SubmitArgs {
    pub tasks: u32,
    pub worker_bin: String,
    pub sbatch_args: Vec<String>,
    pub recalculate: bool,
    pub dry_run: bool,
    pub force: bool,
}

/// Registro del último envío, junto a los marcadores de la corrida.
#[derive(Debug, Serialize, Deserialize)]
struct SubmissionRecord {
    submitted_at: DateTime<Utc>,
    tasks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recalculate_since: Option<DateTime<Utc>>,
    command: Vec<String>,
}

/// Comilla simple POSIX: `a'b` -> `'a'\''b'`.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Comando de cada tarea del array.
///
/// Con `recalculate_since` todas las tareas comparten la misma época: una
/// unidad que ya rehizo otra tarea de este envío no se vuelve a rehacer.
fn worker_command(
    args: &RunArgs,
    submit: &SubmitArgs,
    recalculate_since: Option<DateTime<Utc>>,
) -> Result<Vec<String>> {
    let config = fs::canonicalize(&args.config)
        .with_context(|| format!("resolviendo {}", args.config.display()))?;
    Ok(worker_argv(submit, &config, &args.version, args.credentials.as_deref(), recalculate_since))
}

fn worker_argv(
    submit: &SubmitArgs,
    config: &Path,
    version: &str,
    credentials: Option<&Path>,
    recalculate_since: Option<DateTime<Utc>>,
) -> Vec<String> {
    let mut cmd = vec![
        submit.worker_bin.clone(),
        "--config".to_string(),
        config.to_string_lossy().to_string(),
        "--version".to_string(),
        version.to_string(),
    ];
    if let Some(since) = recalculate_since {
        cmd.push(format!("--recalculate-since={}", since.to_rfc3339()));
    }
    if let Some(creds) = credentials {
        cmd.push("--credentials".to_string());
        cmd.push(creds.to_string_lossy().to_string());
    }
    cmd
}

/// Vector de argumentos de `sbatch` para un job array de `tasks` workers.
fn sbatch_command(job_name: &str, run_dir: &Path, script: &Path, submit: &SubmitArgs) -> Vec<String> {
    let mut cmd = vec![
        "sbatch".to_string(),
        format!("--array=0-{}", submit.tasks.saturating_sub(1)),
        format!("--job-name={job_name}"),
        format!("--output={}/slurm.apply.%A.%a.OUT", run_dir.display()),
        format!("--error={}/slurm.apply.%A.%a.ERROR", run_dir.display()),
    ];
    cmd.extend(submit.sbatch_args.iter().cloned());
    cmd.push(script.to_string_lossy().to_string());
    cmd
}

pub fn submit(args: &RunArgs, submit: &SubmitArgs) -> Result<()> {
    anyhow::ensure!(submit.tasks > 0, "--tasks tiene que ser mayor que 0");
    let session = open_session(args)?;
    let run_dir = session.layout().run_dir().to_path_buf();
    let job_name = format!(
        "{}_{}",
        session.config.config_name,
        session.layout().version()
    );

    // mismo criterio que antes: si la corrida ya existe no se reenvía sin -f
    if run_dir.exists() && !submit.force {
        println!("El job {job_name} ya fue enviado ({}), no se reenvía (usar -f)", run_dir.display());
        return Ok(());
    }

    let submitted_at = Utc::now();
    let recalculate_since = submit.recalculate.then_some(submitted_at);
    let worker = worker_command(args, submit, recalculate_since)?;
    let script_path = run_dir.join("submit_apply.sh");
    let script = format!(
        "#!/bin/sh\nexec {}\n",
        worker.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
    );
    let cmd = sbatch_command(&job_name, &run_dir, &script_path, submit);

    if submit.dry_run {
        println!("# {}", script_path.display());
        print!("{script}");
        println!("{}", cmd.join(" "));
        return Ok(());
    }

    fs::create_dir_all(&run_dir).with_context(|| format!("creando {}", run_dir.display()))?;
    fs::write(&script_path, &script).with_context(|| format!("escribiendo {}", script_path.display()))?;

    info!("enviando job {}", job_name);
    let output = Command::new(&cmd[0])
        .args(&cmd[1..])
        .output()
        .with_context(|| format!("ejecutando {}", cmd[0]))?;
    if !output.status.success() {
        warn!("sbatch stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
        anyhow::bail!("sbatch terminó con estado {:?}", output.status.code());
    }
    println!("{}", String::from_utf8_lossy(&output.stdout).trim());

    let record = SubmissionRecord {
        submitted_at,
        tasks: submit.tasks,
        recalculate_since,
        command: cmd,
    };
    let record_path = run_dir.join("submission.json");
    fs::write(&record_path, serde_json::to_vec_pretty(&record)?)
        .with_context(|| format!("escribiendo {}", record_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_args(tasks: u32) -> SubmitArgs {
        SubmitArgs {
            tasks,
            worker_bin: "worker".into(),
            sbatch_args: vec!["--gres=gpu:1".into()],
            recalculate: false,
            dry_run: true,
            force: false,
        }
    }

    #[test]
    fn shell_quote_escapa_comillas_simples() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn recalcular_pasa_la_misma_epoca_a_todas_las_tareas() {
        let mut submit = submit_args(4);
        submit.recalculate = true;
        let epoch: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();

        let cmd = worker_argv(&submit, Path::new("/cfg/apply.json"), "lwr", None, Some(epoch));
        assert_eq!(
            cmd,
            vec![
                "worker",
                "--config",
                "/cfg/apply.json",
                "--version",
                "lwr",
                "--recalculate-since=2026-03-01T12:00:00+00:00",
            ]
        );

        let normal = worker_argv(&submit_args(4), Path::new("/cfg/apply.json"), "lwr", None, None);
        assert!(!normal.iter().any(|a| a.starts_with("--recalculate")));
    }

    #[test]
    fn sbatch_usa_un_array_de_n_tareas() {
        let cmd = sbatch_command(
            "dense_unet_lwr",
            Path::new("/out/dense_unet/lwr"),
            Path::new("/out/dense_unet/lwr/submit_apply.sh"),
            &submit_args(16),
        );
        assert_eq!(cmd[0], "sbatch");
        assert_eq!(cmd[1], "--array=0-15");
        assert_eq!(cmd[2], "--job-name=dense_unet_lwr");
        assert!(cmd.contains(&"--gres=gpu:1".to_string()));
        assert_eq!(cmd.last().unwrap(), "/out/dense_unet/lwr/submit_apply.sh");
    }
}
