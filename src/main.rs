use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use at_mirror::{
    backfill::{list_hosts, Backfill, DescribeJob, Job, RepoSyncJob},
    config::Config,
    logging::{init_run_logging, init_terminal_logging},
    metrics::init_metrics,
    plc::{annotate_log, Validator},
    repo::{project_records, Phases},
    session::Session,
};
use clap::{Parser, Subcommand};
use iroh_metrics::metrics::start_metrics_server;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the PLC mirror and, if enabled, periodic repository mirroring until Ctrl-C.
    Run,
    /// PLC operation log commands.
    #[clap(subcommand)]
    Plc(PlcCommand),
    /// Batch jobs over the host repository listings.
    #[clap(subcommand)]
    Backfill(BackfillCommand),
    /// Single account repository commands.
    #[clap(subcommand)]
    Repo(RepoCommand),
}

#[derive(Subcommand, Debug)]
enum PlcCommand {
    /// Mirror the log until caught up, once.
    Backfill,
    /// Re-validate stored entries and record the violations found.
    Annotate {
        /// First entry id to look at.
        #[clap(long, default_value_t = 0)]
        start: u64,
        #[clap(long, default_value_t = 1000)]
        batch_size: usize,
    },
}

#[derive(clap::Args, Debug)]
struct PassArgs {
    /// Units processed concurrently. Defaults to the configured value.
    #[clap(long)]
    parallelism: Option<usize>,
    /// Rows selected per batch. Defaults to the configured value.
    #[clap(long)]
    batch_size: Option<usize>,
    /// Also process rows last attempted before this RFC 3339 timestamp.
    #[clap(long, value_parser = parse_timestamp)]
    resume: Option<OffsetDateTime>,
}

#[derive(Subcommand, Debug)]
enum BackfillCommand {
    /// List the repositories of hosting servers.
    Hosts {
        /// Hosts to list. Defaults to every host known from the PLC log.
        hosts: Vec<String>,
        /// Skip hosts sorting before this one.
        #[clap(long)]
        start: Option<String>,
    },
    /// Fetch `describeRepo` for every listed repository.
    Describe {
        #[clap(flatten)]
        pass: PassArgs,
    },
    /// Sync every listed repository.
    RepoSync {
        #[clap(flatten)]
        pass: PassArgs,
        /// Comma separated phases: car, index, blobs. Defaults to the configured ones.
        #[clap(long)]
        phases: Option<Phases>,
    },
}

#[derive(Subcommand, Debug)]
enum RepoCommand {
    /// Sync one account.
    Sync {
        /// Handle or DID.
        account: String,
        #[clap(long, default_value = "car,index")]
        phases: Phases,
    },
    /// Print the records of a synced account as JSON lines.
    Ls {
        /// Handle or DID.
        account: String,
    },
}

/// Pause between repository mirror passes.
const REPO_MIRROR_POLL: Duration = Duration::from_secs(60);

fn parse_timestamp(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).with_context(|| format!("invalid timestamp {s:?}"))
}

/// Phases of the batch repo sync as configured.
fn configured_phases(config: &Config) -> Phases {
    Phases {
        car: true,
        index: config.backfill.index_records,
        blobs: config.backfill.sync_blobs,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).await?;
    init_metrics();

    if let Command::Run = cli.command {
        let _guard = init_run_logging(&config.file_logs, &config.data_dir()?)?;
        return run_until_ctrl_c(Session::new(config)?).await;
    }

    init_terminal_logging()?;
    let session = Session::new(config)?;
    let work = async {
        match cli.command {
            Command::Run => Ok(()),
            Command::Plc(command) => plc(&session, command).await,
            Command::Backfill(command) => backfill(&session, command).await,
            Command::Repo(command) => repo(&session, command).await,
        }
    };
    tokio::select! {
        res = work => res,
        _ = tokio::signal::ctrl_c() => {
            session.shutdown();
            Err(anyhow!("interrupted"))
        }
    }
}

async fn plc(session: &Session, command: PlcCommand) -> Result<()> {
    match command {
        PlcCommand::Backfill => {
            let report = session.plc_mirror()?.run_pass().await?;
            println!(
                "pages: {} inserted: {} duplicates: {} rejected: {} invalid: {} cursor: {}",
                report.pages,
                report.inserted,
                report.duplicates,
                report.rejected,
                report.invalid,
                report.cursor
            );
        }
        PlcCommand::Annotate { start, batch_size } => {
            let store = session.store().clone();
            let validator = Validator::new(session.config().plc.denylist.iter().cloned());
            let report = tokio::task::spawn_blocking(move || {
                annotate_log(&store, &validator, start, batch_size)
            })
            .await??;
            println!(
                "scanned: {} flagged: {} changed: {} last id: {}",
                report.scanned, report.flagged, report.changed, report.last_id
            );
        }
    }
    Ok(())
}

async fn backfill(session: &Session, command: BackfillCommand) -> Result<()> {
    match command {
        BackfillCommand::Hosts { hosts, start } => {
            let report = list_hosts(
                session.store(),
                session.xrpc(),
                hosts,
                start.as_deref(),
                session.cancel_token(),
            )
            .await?;
            println!("{report:?}");
        }
        BackfillCommand::Describe { pass } => {
            let job = DescribeJob::new(session.xrpc().clone(), session.store().clone());
            let report = orchestrator(session, job, &pass)
                .run_pass(pass.resume)
                .await?;
            println!("{report:?}");
        }
        BackfillCommand::RepoSync { pass, phases } => {
            let phases = phases.unwrap_or_else(|| configured_phases(session.config()));
            let job = RepoSyncJob::new(session.syncer(), session.store().clone(), phases);
            let report = orchestrator(session, job, &pass)
                .run_pass(pass.resume)
                .await?;
            println!("{report:?}");
        }
    }
    Ok(())
}

async fn repo(session: &Session, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Sync { account, phases } => {
            let account = session.resolver().resolve(&account).await?;
            let report = session
                .syncer()
                .sync(&account.did, &account.pds, phases)
                .await?;
            session
                .store()
                .record_repo_sync(&account.did, report.rev.as_deref(), report.changed)?;
            println!("{report:?}");
        }
        RepoCommand::Ls { account } => {
            let did = if account.starts_with("did:") {
                account
            } else {
                session.resolver().resolve_handle(&account).await?
            };
            let local = session.syncer().load(&did).await?;
            let Some(commit) = local.commit()? else {
                bail!("no local repository for {did}");
            };
            for record in project_records(&commit, &local.blocks, None) {
                let record = record?;
                let line = serde_json::json!({
                    "collection": record.collection,
                    "rkey": record.rkey,
                    "cid": record.cid.to_string(),
                    "value": record.value,
                });
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn orchestrator<J: Job>(session: &Session, job: J, pass: &PassArgs) -> Backfill<J> {
    let config = &session.config().backfill;
    Backfill::new(session.store().clone(), job, session.cancel_token().clone())
        .parallelism(pass.parallelism.unwrap_or(config.parallelism))
        .batch_size(pass.batch_size.unwrap_or(config.batch_size))
}

/// Runs the configured loops until Ctrl-C, then cancels them and waits.
async fn run_until_ctrl_c(session: Session) -> Result<()> {
    let metrics_task = session.config().metrics_addr.map(|addr| {
        tokio::task::spawn(async move {
            if let Err(err) = start_metrics_server(addr).await {
                warn!("metrics server failed: {err:#}");
            }
        })
    });

    let mut tasks = tokio::task::JoinSet::new();
    if session.config().run.plc_mirror {
        let mirror = session.plc_mirror()?;
        tasks.spawn(async move { mirror.run().await });
    }
    if session.config().run.repo_mirror {
        let session = session.clone();
        tasks.spawn(async move { repo_mirror(session).await });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    session.shutdown();
    while let Some(res) = tasks.join_next().await {
        res?;
    }
    if let Some(task) = metrics_task {
        task.abort();
    }
    Ok(())
}

/// Keeps syncing every repository not attempted within the mirror interval.
async fn repo_mirror(session: Session) {
    let interval = session.config().run.repo_mirror_interval;
    let job = RepoSyncJob::new(
        session.syncer(),
        session.store().clone(),
        configured_phases(session.config()),
    );
    let config = &session.config().backfill;
    let backfill = Backfill::new(session.store().clone(), job, session.cancel_token().clone())
        .parallelism(config.parallelism)
        .batch_size(config.batch_size);
    let cancel = session.cancel_token();
    loop {
        let resume = OffsetDateTime::now_utc() - interval;
        match backfill.run_pass(Some(resume)).await {
            Ok(report) => info!(?report, "repository mirror pass complete"),
            Err(err) => warn!("repository mirror pass failed: {err:#}"),
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(REPO_MIRROR_POLL.min(interval)) => {}
        }
    }
    info!("repository mirror stopped");
}
