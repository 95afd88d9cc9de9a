use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use stackcd_core::types::{Config, RepoName, StackName};
use stackcd_sync::{Decryptor, ResolvedStack, Revision, SopsDecryptor, Stack, StackRepo};

use crate::deploy::{Deployer, DockerStackDeployer, LogDeployer};
use crate::error::{io_err, DaemonError};

/// What was last deployed for a stack: enough to tell whether a cycle changed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRecord {
    pub revision: Revision,
    /// Versioned secret/config names, in rotation order.
    pub objects: Vec<String>,
}

impl DeployRecord {
    pub fn of(stack: &ResolvedStack) -> Self {
        Self {
            revision: stack.revision.clone(),
            objects: stack.object_names(),
        }
    }
}

/// Last successful deploy per stack. In memory only; a restart redeploys once.
#[derive(Debug, Default)]
pub struct LastDeployed {
    records: RwLock<HashMap<StackName, DeployRecord>>,
}

impl LastDeployed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `record` matches the last successful deploy of `stack`.
    pub async fn is_current(&self, stack: &StackName, record: &DeployRecord) -> bool {
        self.records.read().await.get(stack) == Some(record)
    }

    pub async fn record(&self, stack: StackName, record: DeployRecord) {
        self.records.write().await.insert(stack, record);
    }

    pub async fn get(&self, stack: &StackName) -> Option<DeployRecord> {
        self.records.read().await.get(stack).cloned()
    }
}

/// Marks a stack whose reconcile is still running, even past its timeout.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `None` while an earlier claim is alive.
    fn claim(&self) -> Option<InFlightClaim> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightClaim(self.0.clone()))
    }
}

/// Released when the reconcile it travels with returns.
struct InFlightClaim(Arc<AtomicBool>);

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of one scheduled cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Deployed(DeployRecord),
    Unchanged(DeployRecord),
}

/// Options for [`start_blocking`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Log instead of deploying.
    pub dry_run: bool,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

/// Start the scheduler and block the current thread until it exits.
///
/// `config_path` anchors the relative `repos_path`.
pub fn start_blocking(
    config: Config,
    config_path: &Path,
    options: RunOptions,
) -> Result<(), DaemonError> {
    init_tracing(options.json_logs);
    let deployer: Arc<dyn Deployer> = if options.dry_run {
        Arc::new(LogDeployer)
    } else {
        Arc::new(DockerStackDeployer::default())
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, config_path.to_path_buf(), deployer))
}

/// Run the scheduler until ctrl-c.
pub async fn run(
    config: Config,
    config_path: PathBuf,
    deployer: Arc<dyn Deployer>,
) -> Result<(), DaemonError> {
    for unknown in config.unknown_keys() {
        tracing::warn!(stack = %unknown.stack, key = %unknown.key, "unknown stack key ignored");
    }
    let (repos, failed) = open_repos(&config, &config_path).await;
    let decryptor: Arc<dyn Decryptor> = Arc::new(SopsDecryptor::new(&config.sops_binary));
    let stacks = build_stacks(&config, &repos, decryptor);
    if stacks.is_empty() {
        return Err(DaemonError::NoStacks { failed });
    }

    let last_deployed = Arc::new(LastDeployed::new());
    let period = Duration::from_secs(config.update_interval);
    let timeout = Duration::from_secs(config.cycle_timeout);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    tracing::info!(
        stacks = stacks.len(),
        repos = repos.len(),
        update_interval = config.update_interval,
        "scheduler started"
    );

    let mut handles: Vec<(String, JoinHandle<Result<(), DaemonError>>)> = stacks
        .into_iter()
        .map(|stack| {
            let name = format!("stack {}", stack.name());
            let deployer = deployer.clone();
            let last_deployed = last_deployed.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let handle = tokio::spawn(async move {
                stack_task(stack, deployer, last_deployed, period, timeout, shutdown_rx).await
            });
            (name, handle)
        })
        .collect();

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down scheduler");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Signal(err.to_string())),
                    }
                }
            }
        })
    };
    handles.push(("signal_handler".to_string(), signal_handle));

    for (task, handle) in handles {
        handle_join(&task, handle.await)?;
    }
    Ok(())
}

/// Clone or open every configured repository on blocking threads.
///
/// A repository that fails is logged and left out, together with its stacks.
async fn open_repos(
    config: &Config,
    config_path: &Path,
) -> (HashMap<RepoName, Arc<StackRepo>>, usize) {
    let mut pending = Vec::new();
    for (name, repo) in &config.repos {
        let credential = match repo.credential() {
            Ok(credential) => credential,
            Err(err) => {
                tracing::error!(repo = %name, error = %err, "could not load repo credential");
                pending.push((name.clone(), None));
                continue;
            }
        };
        let path = config.repo_path(config_path, name);
        let (name_for_task, url) = (name.clone(), repo.url.clone());
        let handle = tokio::task::spawn_blocking(move || {
            StackRepo::clone_or_open(name_for_task, path, url, credential)
        });
        pending.push((name.clone(), Some(handle)));
    }

    let mut repos = HashMap::new();
    let mut failed = 0;
    for (name, handle) in pending {
        let Some(handle) = handle else {
            failed += 1;
            continue;
        };
        match handle.await {
            Ok(Ok(repo)) => {
                tracing::info!(repo = %name, path = %repo.path().display(), "repo ready");
                repos.insert(name, Arc::new(repo));
            }
            Ok(Err(err)) => {
                tracing::error!(repo = %name, error = %err, "could not open repo, skipping its stacks");
                failed += 1;
            }
            Err(err) => {
                tracing::error!(repo = %name, error = %err, "repo open task failed");
                failed += 1;
            }
        }
    }
    (repos, failed)
}

fn build_stacks(
    config: &Config,
    repos: &HashMap<RepoName, Arc<StackRepo>>,
    decryptor: Arc<dyn Decryptor>,
) -> Vec<Arc<Stack>> {
    config
        .stacks
        .iter()
        .filter_map(|(name, stack)| {
            let Some(repo) = repos.get(&stack.repo) else {
                let err = DaemonError::RepoUnavailable {
                    repo: stack.repo.clone(),
                };
                tracing::warn!(stack = %name, error = %err, "stack not scheduled");
                return None;
            };
            let stack = Stack::from_config(name.clone(), stack, repo.clone())
                .with_decryptor(decryptor.clone())
                .with_rotation(config.auto_rotate);
            Some(Arc::new(stack))
        })
        .collect()
}

async fn stack_task(
    stack: Arc<Stack>,
    deployer: Arc<dyn Deployer>,
    last_deployed: Arc<LastDeployed>,
    period: Duration,
    timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let in_flight = InFlight::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match run_cycle(stack.clone(), deployer.clone(), &last_deployed, &in_flight, timeout).await {
                    Ok(CycleOutcome::Deployed(record)) => {
                        tracing::info!(
                            stack = %stack.name(),
                            revision = %record.revision,
                            objects = record.objects.len(),
                            "cycle deployed"
                        );
                    }
                    Ok(CycleOutcome::Unchanged(record)) => {
                        tracing::debug!(stack = %stack.name(), revision = %record.revision, "no changes");
                    }
                    Err(err @ DaemonError::Busy { .. }) => {
                        tracing::warn!(stack = %stack.name(), error = %err, "tick skipped");
                    }
                    Err(err) => {
                        tracing::error!(stack = %stack.name(), error = %err, "cycle failed");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reconcile one stack and deploy it when it differs from the last successful deploy.
///
/// A cycle that exceeds `timeout` is reported; its blocking work still runs to
/// completion in the background and keeps `in_flight` claimed, so later calls
/// return [`DaemonError::Busy`] instead of queueing behind it. Failures leave
/// `last_deployed` untouched, so the next cycle retries.
pub async fn run_cycle(
    stack: Arc<Stack>,
    deployer: Arc<dyn Deployer>,
    last_deployed: &LastDeployed,
    in_flight: &InFlight,
    timeout: Duration,
) -> Result<CycleOutcome, DaemonError> {
    let name = stack.name().clone();
    let Some(claim) = in_flight.claim() else {
        return Err(DaemonError::Busy { stack: name });
    };
    let reconcile = tokio::task::spawn_blocking(move || {
        let _claim = claim;
        stack.reconcile()
    });
    let resolved = match tokio::time::timeout(timeout, reconcile).await {
        Ok(joined) => joined.map_err(|err| DaemonError::Join {
            task: format!("reconcile {name}"),
            message: err.to_string(),
        })??,
        Err(_) => {
            return Err(DaemonError::Timeout {
                stack: name,
                seconds: timeout.as_secs(),
            })
        }
    };

    let record = DeployRecord::of(&resolved);
    if last_deployed.is_current(&name, &record).await {
        return Ok(CycleOutcome::Unchanged(record));
    }

    tokio::task::spawn_blocking(move || deployer.deploy(&resolved))
        .await
        .map_err(|err| DaemonError::Join {
            task: format!("deploy {name}"),
            message: err.to_string(),
        })??;
    last_deployed.record(name, record.clone()).await;
    Ok(CycleOutcome::Deployed(record))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Join {
            task: task.to_string(),
            message: err.to_string(),
        }),
    }
}

/// Install the global tracing subscriber, writing to stderr. Later calls are no-ops.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
