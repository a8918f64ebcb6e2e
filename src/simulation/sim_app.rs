use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use clap::error::ErrorKind;
use clap::CommandFactory;
use clap::Parser;
use fieldx::fxstruct;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::client::Client;
use super::client::ClientStats;
use super::Result;
use super::SimError;
use crate::backend::memory::MemoryDatabase;
use crate::cache::IdentityCache;
use crate::config::Config;
use crate::record::Record;
use crate::storage::Storage;

#[derive(Debug, Clone, clap::Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "idcache-sim")]
pub struct Cli {
    /// Configuration file to start from. Command line options override its pool and replicator settings.
    #[clap(long, short, env = "IDCACHE_CONFIG")]
    #[fieldx(get(clone))]
    config: Option<PathBuf>,

    /// Number of nodes sharing the database.
    #[clap(long, env = "IDCACHE_NODES", default_value_t = 3)]
    nodes: usize,

    /// Client threads per node.
    #[clap(long, env = "IDCACHE_CLIENTS", default_value_t = 2)]
    clients: usize,

    /// Operations each client performs.
    #[clap(long, env = "IDCACHE_OPERATIONS", default_value_t = 500)]
    operations: usize,

    /// Size of the user and of the group name space. Small values make clients collide more often.
    #[clap(long, env = "IDCACHE_NAMES", default_value_t = 50)]
    names: usize,

    /// Upper bound of database workers per node.
    #[clap(long, env = "IDCACHE_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Queue length above which a node's pool adds a worker.
    #[clap(long, env = "IDCACHE_CONTENTION_THRESHOLD")]
    contention_threshold: Option<usize>,

    /// Entries kept in the capped change log. Nodes falling further behind repopulate.
    #[clap(long, env = "IDCACHE_LOG_CAPACITY")]
    log_capacity: Option<u64>,

    /// Artificial latency of every database operation, in microseconds.
    #[clap(long, env = "IDCACHE_LATENCY_US", default_value_t = 200)]
    latency_us: u64,

    /// Take the database offline for this many milliseconds while the clients run.
    #[clap(long, env = "IDCACHE_OUTAGE_MS", default_value_t = 0)]
    outage_ms: u64,

    /// How long to wait for the nodes to converge once the clients are done, in seconds.
    #[clap(long, env = "IDCACHE_CONVERGE_TIMEOUT", default_value_t = 30)]
    converge_timeout: u64,

    /// Seed of the clients' random generators. Random if omitted.
    #[clap(long, env = "IDCACHE_SEED")]
    seed: Option<u64>,

    /// Don't print the summary.
    #[clap(long, short, env = "IDCACHE_QUIET", default_value_t = false)]
    quiet: bool,
}

/// What a finished simulation did.
#[derive(Debug, Clone)]
pub struct SimReport {
    pub nodes:        usize,
    pub stats:        ClientStats,
    pub users:        usize,
    pub groups:       usize,
    pub peak_workers: usize,
    pub elapsed:      Duration,
    pub converged_in: Duration,
}

#[derive(Default)]
pub struct SimApp {
    cli_args: Option<Vec<String>>,
}

impl SimApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse these arguments instead of the process command line. The first one is the program name.
    pub fn cli_args<S: ToString>(mut self, args: Vec<S>) -> Self {
        self.cli_args = Some(args.into_iter().map(|s| s.to_string()).collect());
        self
    }

    fn cli(&self) -> Result<Cli, clap::Error> {
        Ok(if let Some(custom_args) = &self.cli_args {
            Cli::try_parse_from(custom_args.iter())?
        }
        else {
            Cli::try_parse()?
        })
    }

    fn config(cli: &Cli) -> Result<Config> {
        let mut config = match cli.config() {
            Some(path) => Config::from_file(path)?,
            None => Config::new(),
        };

        let pool = config.pool_mut();
        if let Some(max_workers) = cli.max_workers() {
            pool.set_max_workers(max_workers);
        }
        if let Some(threshold) = cli.contention_threshold() {
            pool.set_contention_threshold(threshold);
        }
        pool.set_monitor_interval_ms(20);

        let replicator = config.replicator_mut();
        replicator.set_poll_interval_ms(2);
        replicator.set_retry_interval_ms(50);
        if let Some(capacity) = cli.log_capacity() {
            replicator.set_log_capacity(capacity);
        }

        config.validate()?;
        Ok(config)
    }

    fn setup_tracing(&self) {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::from_default_env();

        let tracing_registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        // Another subscriber may already be in place when running inside a test harness.
        if tracing_registry.try_init().is_ok() {
            info!("Tracing initialized");
        }
    }

    pub fn execute(&self) -> anyhow::Result<Option<SimReport>> {
        let cli = match self.cli() {
            Ok(cli) => cli,
            Err(err) => match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                    Cli::command().print_help()?;
                    return Ok(None);
                }
                _ => return Err(err.into()),
            },
        };

        self.setup_tracing();

        let report = self.simulate(&cli)?;
        if !cli.quiet() {
            Self::print_report(&report);
        }
        Ok(Some(report))
    }

    #[instrument(level = "info", skip_all, fields(nodes = cli.nodes(), clients = cli.clients()))]
    fn simulate(&self, cli: &Cli) -> Result<SimReport> {
        let config = Self::config(cli)?;
        let db = MemoryDatabase::new("memory://simulation");
        db.set_latency(Duration::from_micros(cli.latency_us()));

        let mut nodes = Vec::with_capacity(cli.nodes());
        for _ in 0..cli.nodes().max(1) {
            let node = match Storage::start(config.clone(), Arc::new(db.clone())) {
                Ok(node) => node,
                Err(err) => {
                    Self::shutdown(nodes);
                    return Err(err.into());
                }
            };
            nodes.push(Arc::new(node));
        }

        let started = Instant::now();
        let seed = cli.seed().unwrap_or_else(rand::random);
        info!("running {} clients per node, seed {seed}", cli.clients());

        let outage = (cli.outage_ms() > 0).then(|| {
            let db = db.clone();
            let duration = Duration::from_millis(cli.outage_ms());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                warn!("database going offline for {duration:?}");
                db.set_online(false);
                thread::sleep(duration);
                db.set_online(true);
                warn!("database back online");
            })
        });

        let peak_workers = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for (n, node) in nodes.iter().enumerate() {
            for c in 0..cli.clients() {
                let id = n * cli.clients() + c;
                let client = Client::new(
                    id,
                    node.clone(),
                    seed.wrapping_add(id as u64),
                    cli.names(),
                    peak_workers.clone(),
                );
                let operations = cli.operations();
                handles.push((id, thread::spawn(move || client.run(operations))));
            }
        }

        let mut stats = ClientStats::default();
        let mut panicked = None;
        for (id, handle) in handles {
            match handle.join() {
                Ok(client_stats) => stats.merge(&client_stats),
                Err(_) => panicked = panicked.or(Some(id)),
            }
        }
        if let Some(handle) = outage {
            let _ = handle.join();
        }
        let elapsed = started.elapsed();

        let outcome = match panicked {
            Some(id) => Err(SimError::ClientPanicked(id)),
            None => Self::wait_converged(&db, &nodes, Duration::from_secs(cli.converge_timeout())),
        };

        let report = outcome.map(|converged_in| SimReport {
            nodes: nodes.len(),
            stats,
            users: db.documents(crate::record::User::COLLECTION).len(),
            groups: db.documents(crate::record::Group::COLLECTION).len(),
            peak_workers: peak_workers.load(Ordering::Relaxed),
            elapsed,
            converged_in,
        });
        Self::shutdown(nodes);
        report
    }

    fn shutdown(nodes: Vec<Arc<Storage>>) {
        for node in nodes {
            match Arc::into_inner(node) {
                Some(storage) => storage.shutdown(),
                None => warn!("node still referenced, left running"),
            }
        }
    }

    // Poll until every node's caches equal the database content.
    fn wait_converged(db: &MemoryDatabase, nodes: &[Arc<Storage>], timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        loop {
            let divergence = nodes.iter().enumerate().find_map(|(n, node)| {
                Self::diff(db, n, node.users()).or_else(|| Self::diff(db, n, node.groups()))
            });

            match divergence {
                None => {
                    info!("all {} nodes converged after {:?}", nodes.len(), started.elapsed());
                    return Ok(started.elapsed());
                }
                Some(mut err) if started.elapsed() >= timeout => {
                    if let SimError::Diverged { waited, .. } = &mut err {
                        *waited = started.elapsed();
                    }
                    return Err(err);
                }
                Some(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    fn diff<R: Record>(db: &MemoryDatabase, node: usize, cache: &IdentityCache<R>) -> Option<SimError> {
        let mut stored: Vec<R> = db
            .documents(R::COLLECTION)
            .iter()
            .filter_map(R::from_document)
            .collect();
        stored.sort_by_key(|r| r.id());

        let cached = cache.snapshot();
        let mut names: Vec<String> = stored.iter().map(|r| r.name().to_string()).collect();
        names.sort();
        // A record can match while the name index still points elsewhere.
        let unindexed: Vec<_> = stored
            .iter()
            .filter(|r| cache.name_to_id(r.name()) != Some(r.id()))
            .map(|r| r.id())
            .collect();

        if cached == stored && cache.names() == names && unindexed.is_empty() {
            return None;
        }
        if cached == stored {
            return Some(SimError::Diverged {
                node,
                kind: R::KIND,
                waited: Duration::ZERO,
                detail: format!("name index out of step for ids {unindexed:?}"),
            });
        }

        let missing: Vec<_> = stored.iter().filter(|r| !cached.contains(r)).map(|r| r.id()).collect();
        let extra: Vec<_> = cached.iter().filter(|r| !stored.contains(r)).map(|r| r.id()).collect();
        Some(SimError::Diverged {
            node,
            kind: R::KIND,
            waited: Duration::ZERO,
            detail: format!("ids missing or stale {missing:?}, ids extra or stale {extra:?}"),
        })
    }

    fn print_report(report: &SimReport) {
        println!("nodes:           {}", report.nodes);
        println!(
            "operations:      {} ({} applied, {} refused, {} unavailable)",
            report.stats.total(),
            report.stats.applied,
            report.stats.refused,
            report.stats.unavailable
        );
        println!("users / groups:  {} / {}", report.users, report.groups);
        println!("peak workers:    {}", report.peak_workers);
        println!("clients ran for: {:?}", report.elapsed);
        println!("converged after: {:?}", report.converged_in);
    }

    pub fn run() -> anyhow::Result<()> {
        SimApp::new().execute().map(|_| ())
    }
}

impl Debug for SimApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimApp {{ ... }}")
    }
}
