//! The `backy` CLI: ad-hoc job inspection and one-shot operations against
//! a configured base directory, plus the `daemon` subcommand that drives
//! every configured job's `Job::run_forever` scheduler loop on a
//! multi-thread `tokio` runtime until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use backy::config::DaemonConfig;
use backy::job::Job;
use backy_api_types::{check_exit_code, BackyError};
use backy_peer::{Peer, ReqwestPeerClient, WorkerPools};
use backy_revision::{Repository, Schedule, TagAction};

#[derive(Parser)]
#[command(name = "backy", about = "Deduplicating block-device backup engine")]
struct Cli {
    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr.
    #[arg(short = 'l', long, global = true)]
    logfile: Option<PathBuf>,

    /// Base directory holding `backy.conf` and every job's repository.
    #[arg(short = 'b', long, default_value = backy_buildcfg::DEFAULT_BASE_DIR, global = true)]
    backupdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured jobs.
    Jobs,
    /// Print every configured job's scheduling status.
    Status,
    /// Run one backup cycle for a job, independent of its schedule.
    Backup { job: String },
    /// Restore a revision's full content to `target`.
    Restore {
        job: String,
        spec: String,
        target: PathBuf,
    },
    /// Resolve a selection expression and print the matching revisions.
    Find { job: String, spec: String },
    /// Set a revision's tags (comma-separated).
    Tags { job: String, spec: String, tags: String },
    /// Mark a revision distrusted.
    Distrust { job: String, spec: String },
    /// Verify a revision against its source and update its trust.
    Verify { job: String, spec: String },
    /// Purge chunks no local revision references any more.
    Gc { job: String },
    /// Exit non-zero if any job is SLA-overdue or has quarantine reports.
    Check,
    /// Run every configured job's scheduler loop until interrupted.
    Daemon {
        /// Path to invoke after each successful backup, if configured.
        #[arg(long)]
        callback: Option<PathBuf>,
    },
    /// Talk to a configured peer's admin API directly.
    Client {
        peer: String,
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Fetch a peer's status for jobs matching `filter` (a regex).
    Status { filter: String },
}

fn init_logging(verbosity: u8, logfile: Option<&PathBuf>) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = logfile {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }
    builder.init();
}

fn load_config(backupdir: &PathBuf) -> Result<DaemonConfig, BackyError> {
    let (config, errors) = DaemonConfig::load(&backupdir.join("backy.conf"))?;
    for (job, err) in &errors {
        log::warn!("config: job {job:?} is misconfigured and will be skipped: {err}");
    }
    Ok(config)
}

fn peers_for(config: &DaemonConfig) -> Arc<Vec<Peer>> {
    Arc::new(
        config
            .peers
            .iter()
            .map(|(name, peer)| Peer {
                name: name.clone(),
                client: Box::new(ReqwestPeerClient::new(peer.url.clone(), peer.token.clone())),
            })
            .collect(),
    )
}

fn schedule_for(config: &DaemonConfig, job_config: &backy::JobConfig) -> Result<Schedule, BackyError> {
    let entries = config
        .schedules
        .get(&job_config.schedule)
        .ok_or_else(|| BackyError::Other(anyhow::anyhow!("unknown schedule {:?}", job_config.schedule)))?;
    let mut schedule = Schedule::new();
    schedule.configure(entries.clone())?;
    Ok(schedule)
}

fn open_job(config: &DaemonConfig, name: &str) -> Result<Job, BackyError> {
    let job_config = config
        .jobs
        .get(name)
        .ok_or_else(|| BackyError::Other(anyhow::anyhow!("no such job: {name}")))?;
    let schedule = schedule_for(config, job_config)?;
    Job::open(name, config.job_path(name), schedule, &job_config.source, peers_for(config))
}

fn run() -> Result<(), BackyError> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.logfile.as_ref());
    let config = load_config(&cli.backupdir)?;

    match cli.command {
        Command::Jobs => {
            for (name, job_config) in &config.jobs {
                println!("{name}\t{}\t{}", job_config.source.type_, job_config.schedule);
            }
        }
        Command::Status => {
            for name in config.jobs.keys() {
                let job = open_job(&config, name)?;
                let status = job.status();
                println!(
                    "{}\tsla={}\tnext={:?}\tlocal_revs={}\tunsynced={}",
                    status.job, status.sla, status.next_time, status.local_revs, status.unsynced_revs
                );
            }
        }
        Command::Backup { job } => {
            let mut job = open_job(&config, &job)?;
            let spread = backy_peer::job_spread(&job.name, 24 * 3600);
            let (_, tags) = job.schedule.next(chrono::Utc::now(), spread, &job.repo);
            job.run_backup_cycle(tags)?;
        }
        Command::Restore { job, spec, target } => {
            let job = open_job(&config, &job)?;
            let revision = job
                .repo
                .select(&spec)?
                .into_iter()
                .next()
                .ok_or_else(|| BackyError::RevisionNotFound(spec))?;
            job.source.restore(job.store.clone(), revision, &target)?;
        }
        Command::Find { job, spec } => {
            let job = open_job(&config, &job)?;
            for revision in job.repo.select(&spec)? {
                println!("{}\t{}\t{:?}", revision.uuid(), revision.info.timestamp, revision.info.tags);
            }
        }
        Command::Tags { job, spec, tags } => {
            let job_config = config
                .jobs
                .get(&job)
                .ok_or_else(|| BackyError::Other(anyhow::anyhow!("no such job: {job}")))?;
            let schedule_tags: std::collections::BTreeSet<String> =
                config.schedules[&job_config.schedule].keys().cloned().collect();
            let mut repo = Repository::open(config.job_path(&job))?;
            let new_tags: std::collections::BTreeSet<String> =
                tags.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect();
            repo.tags(TagAction::Set, &spec, new_tags, None, true, Some(&schedule_tags), false)?;
        }
        Command::Distrust { job, spec } => {
            let mut repo = Repository::open(config.job_path(&job))?;
            repo.distrust(&spec)?;
        }
        Command::Verify { job, spec } => {
            let mut job = open_job(&config, &job)?;
            let revision = job
                .repo
                .select(&spec)?
                .into_iter()
                .next()
                .ok_or_else(|| BackyError::RevisionNotFound(spec.clone()))?
                .clone();
            let ok = job.source.verify(job.store.clone(), &revision, &mut job.quarantine)?;
            if ok {
                job.repo.verify(&spec)?;
                println!("verify-ok {spec}");
            } else {
                job.repo.distrust(&spec)?;
                println!("verify-failed {spec}");
            }
        }
        Command::Gc { job } => {
            let mut job = open_job(&config, &job)?;
            let status = job.run_gc()?;
            println!(
                "kept {} chunks ({} bytes), removed {} chunks ({} bytes)",
                status.disk_chunks, status.disk_bytes, status.removed_chunks, status.removed_bytes
            );
        }
        Command::Check => {
            let mut code = check_exit_code::OK;
            for name in config.jobs.keys() {
                let job = open_job(&config, name)?;
                let status = job.status();
                if !status.sla {
                    code = code.max(check_exit_code::SLA_VIOLATED);
                }
                if !status.problem_reports.is_empty() {
                    code = code.max(check_exit_code::QUARANTINE_REPORTS);
                }
                println!("{}\tsla={}\tproblem_reports={}", status.job, status.sla, status.problem_reports.len());
            }
            std::process::exit(code);
        }
        Command::Daemon { callback } => {
            run_daemon(&config, callback.as_deref())?;
        }
        Command::Client { peer, action } => {
            let peer_config = config
                .peers
                .get(&peer)
                .ok_or_else(|| BackyError::Other(anyhow::anyhow!("no such peer: {peer}")))?;
            let client = ReqwestPeerClient::new(peer_config.url.clone(), peer_config.token.clone());
            match action {
                ClientAction::Status { filter } => {
                    use backy_peer::PeerClient;
                    for status in client.fetch_status(&filter)? {
                        println!("{}\tsla={}\tstatus={}", status.job, status.sla, status.status);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Build a multi-thread `tokio` runtime and run every configured job's
/// `run_forever` loop on it concurrently, `block_in_place`-ing each job's
/// actual backup/gc work off the async tasks sharing its worker threads.
/// Returns once every job task has exited (only happens on panic, since
/// `run_forever` itself never returns) or `SIGINT`/`SIGTERM` arrives.
fn run_daemon(config: &DaemonConfig, callback: Option<&std::path::Path>) -> Result<(), BackyError> {
    let _base_lock = backy_tools::lock::try_exclusive_lock(
        &config.global.base_dir.join(backy_buildcfg::BASE_DIR_LOCK_FILE),
    )
    .map_err(|_| {
        log::error!("another backy daemon already holds {:?}", config.global.base_dir);
        std::process::exit(backy_buildcfg::EXIT_CODE_DAEMON_ALREADY_RUNNING);
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| BackyError::Other(anyhow::anyhow!("building tokio runtime: {err}")))?;

    let worker_pools = Arc::new(WorkerPools::new(config.global.worker_limit, config.global.worker_limit));
    let callback = callback.map(|p| p.to_path_buf());

    runtime.block_on(async move {
        let mut handles = Vec::new();
        for name in config.jobs.keys() {
            let job = match open_job(config, name) {
                Ok(job) => job,
                Err(err) => {
                    log::error!("daemon: skipping job {name:?}: {err}");
                    continue;
                }
            };
            let job_filter = format!("^{name}$");
            let worker_pools = worker_pools.clone();
            let callback = callback.clone();
            handles.push(tokio::spawn(async move {
                let mut job = job;
                job.run_forever(&worker_pools, &job_filter, callback.as_deref()).await;
            }));
        }

        tokio::select! {
            _ = futures_all(handles) => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("daemon: received interrupt, shutting down");
            }
        }
    });
    Ok(())
}

async fn futures_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("backy: {err}");
            ExitCode::FAILURE
        }
    }
}
