//! Deterministic workload for the distributor bucket database updater.
//!
//! The binary runs a `BucketDbUpdater` inside its service task, plays a set of
//! in-memory storage nodes against it and drives a randomized sequence of
//! cluster state transitions. Bucket info requests can fail or be lost. After
//! the last transition every node is brought back up, and the database is
//! checked against the replicas the storage nodes actually hold.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bucketdb::updater::{
    ActivateClusterStateVersionCommand, Bucket, BucketDatabase, BucketDbUpdater, BucketId,
    BucketInfo, BucketSpace, BucketSpaceRepo, Clock, ClusterState, ClusterStateBundle,
    Distribution, ManualClock, MessageId, NodeIndex, NodeType, NotifyBucketChangeCommand, Outbound,
    RendezvousDistribution, RequestBucketInfoCommand, RequestBucketInfoReply, ResultCode,
    SetSystemStateCommand, State, UpdaterConfig, UpdaterHandle, UpdaterService, UpdaterStats,
};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time;

/// Bits used by every generated bucket id.
const BUCKET_USED_BITS: u8 = 32;
const START_MS: u64 = 1_000_000;
/// Upper bound on pump rounds for one transition before giving up.
const MAX_PUMP_ROUNDS: usize = 100_000;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "bucketdb-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of storage nodes in the cluster.
    #[arg(long, env = "BUCKETDB_STORAGE_NODES", default_value_t = 6)]
    storage_nodes: u16,

    /// Number of distributors in the cluster.
    #[arg(long, env = "BUCKETDB_DISTRIBUTORS", default_value_t = 3)]
    distributors: u16,

    /// Index of the simulated distributor.
    #[arg(long, env = "BUCKETDB_DISTRIBUTOR_INDEX", default_value_t = 0)]
    distributor_index: u16,

    /// Number of buckets placed on the storage nodes.
    #[arg(long, default_value_t = 2_000)]
    buckets: usize,

    /// Distribution bits of every generated cluster state.
    #[arg(long, default_value_t = 8)]
    distribution_bits: u16,

    /// Replicas per bucket.
    #[arg(long, default_value_t = 2)]
    redundancy: usize,

    /// Number of random cluster state transitions.
    #[arg(long, default_value_t = 50)]
    transitions: usize,

    /// Percent of bucket info requests answered with a transient failure.
    #[arg(long, default_value_t = 5)]
    fail_pct: u8,

    /// Percent of bucket info requests that are never answered.
    #[arg(long, default_value_t = 2)]
    drop_pct: u8,

    /// Percent of transitions followed by a bucket change notification.
    #[arg(long, default_value_t = 20)]
    notify_pct: u8,

    /// Publish every state with deferred activation.
    #[arg(long, env = "BUCKETDB_DEFER_ACTIVATION", default_value_t = false)]
    defer_activation: bool,

    /// Backoff before a failed request is resent.
    #[arg(long, default_value = "100ms")]
    retry_delay: humantime::Duration,

    /// Interval of the updater's resend ticker.
    #[arg(long, default_value = "2ms")]
    tick_interval: humantime::Duration,

    /// RNG seed (0 = random).
    #[arg(long, env = "BUCKETDB_SEED", default_value_t = 0)]
    seed: u64,

    /// Output JSON summary path.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Print the updater's XML status page at the end of the run.
    #[arg(long, default_value_t = false)]
    print_status: bool,
}

/// Message counters accumulated over a run.
#[derive(serde::Serialize, Debug, Default, Clone)]
struct Counters {
    transitions: usize,
    requests_answered: usize,
    requests_failed: usize,
    requests_dropped: usize,
    notifications: usize,
    activations: usize,
    state_replies: usize,
}

/// JSON summary written at the end of a run.
#[derive(serde::Serialize, Debug)]
struct RunSummary {
    seed: u64,
    storage_nodes: u16,
    distributors: u16,
    distributor_index: u16,
    buckets: usize,
    defer_activation: bool,
    counters: Counters,
    stats: UpdaterStats,
    db_entries: usize,
    expected_entries: usize,
    mismatches: usize,
    ok: bool,
}

/// Program entry point.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,bucketdb_workload=info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(run_args) => run(run_args).await,
    }
}

/// Run one simulation and report whether the database converged.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.storage_nodes > 0, "--storage-nodes must be > 0");
    anyhow::ensure!(args.distributors > 0, "--distributors must be > 0");
    anyhow::ensure!(
        args.distributor_index < args.distributors,
        "--distributor-index must be < --distributors"
    );
    anyhow::ensure!(args.redundancy > 0, "--redundancy must be > 0");
    anyhow::ensure!(
        args.distribution_bits <= u16::from(BUCKET_USED_BITS),
        "--distribution-bits must be <= {BUCKET_USED_BITS}"
    );
    anyhow::ensure!(
        args.fail_pct <= 100 && args.drop_pct <= 100 && args.notify_pct <= 100,
        "percentages must be <= 100"
    );
    anyhow::ensure!(
        u16::from(args.fail_pct) + u16::from(args.drop_pct) < 100,
        "--fail-pct + --drop-pct must leave room for answered requests"
    );

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    tracing::info!(seed, "starting bucket db workload");

    let mut sim = Simulator::new(&args, seed)?;
    sim.run_transitions(args.transitions).await?;
    sim.converge().await?;

    let report = sim.verify();
    let stats = sim.handle.stats().await?;
    let summary = RunSummary {
        seed,
        storage_nodes: args.storage_nodes,
        distributors: args.distributors,
        distributor_index: args.distributor_index,
        buckets: args.buckets,
        defer_activation: args.defer_activation,
        counters: sim.counters.clone(),
        stats,
        db_entries: report.db_entries,
        expected_entries: report.expected_entries,
        mismatches: report.mismatches,
        ok: report.mismatches == 0,
    };

    if args.print_status {
        println!("{}", sim.handle.status().await?);
    }
    sim.handle.shutdown().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize summary")?
    );
    if let Some(path) = &args.out {
        write_summary(path, &summary)?;
    }
    anyhow::ensure!(
        summary.ok,
        "bucket database diverged from storage: {} mismatching buckets (seed {seed})",
        summary.mismatches
    );
    Ok(())
}

struct VerifyReport {
    db_entries: usize,
    expected_entries: usize,
    mismatches: usize,
}

/// In-memory cluster wrapped around one updater service.
struct Simulator {
    rng: SmallRng,
    clock: ManualClock,
    handle: UpdaterHandle,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    db: Arc<BucketDatabase>,
    distribution: Arc<RendezvousDistribution>,
    config: UpdaterConfig,
    /// Replicas held by each storage node in the default space.
    storage: BTreeMap<NodeIndex, BTreeMap<BucketId, BucketInfo>>,
    state: ClusterState,
    defer_activation: bool,
    fail_pct: u8,
    drop_pct: u8,
    notify_pct: u8,
    tick_interval: std::time::Duration,
    next_msg_id: MessageId,
    counters: Counters,
}

impl Simulator {
    fn new(args: &RunArgs, seed: u64) -> anyhow::Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let config = UpdaterConfig {
            distributor_index: args.distributor_index,
            defer_state_activation: args.defer_activation,
            retry_delay_ms: args.retry_delay.as_millis() as u64,
            tick_interval_ms: (args.tick_interval.as_millis() as u64).max(1),
            ..UpdaterConfig::default()
        };

        let distribution = Arc::new(RendezvousDistribution::new(args.redundancy).with_seed(seed));
        let state = ClusterState::new(0, args.distributors, args.storage_nodes)
            .with_distribution_bits(args.distribution_bits);

        let mut storage: BTreeMap<NodeIndex, BTreeMap<BucketId, BucketInfo>> = BTreeMap::new();
        let mut placed = BTreeSet::new();
        while placed.len() < args.buckets {
            let bucket = BucketId::new(BUCKET_USED_BITS, u64::from(rng.gen::<u32>()));
            if !placed.insert(bucket) {
                continue;
            }
            let info = BucketInfo::new(
                rng.gen(),
                rng.gen_range(1..1_000),
                rng.gen_range(1..1 << 20),
                START_MS,
            );
            for node in
                distribution.ideal_storage_nodes(&state, bucket, config.storage_up_states)
            {
                storage.entry(node).or_default().insert(bucket, info);
            }
        }

        let (tx, outbound) = mpsc::unbounded_channel();
        let clock = ManualClock::new(START_MS);
        let repo = BucketSpaceRepo::with_default_spaces(distribution.clone());
        let db = repo
            .get(BucketSpace::DEFAULT)
            .context("default bucket space missing")?
            .bucket_database()
            .clone();
        let updater = BucketDbUpdater::new(
            config.clone(),
            repo,
            Box::new(tx),
            Arc::new(clock.clone()),
        )?;

        Ok(Self {
            rng,
            clock,
            handle: UpdaterService::spawn(updater),
            outbound,
            db,
            distribution,
            config,
            storage,
            state,
            defer_activation: args.defer_activation,
            fail_pct: args.fail_pct,
            drop_pct: args.drop_pct,
            notify_pct: args.notify_pct,
            tick_interval: args.tick_interval.into(),
            next_msg_id: 1,
            counters: Counters::default(),
        })
    }

    async fn run_transitions(&mut self, transitions: usize) -> anyhow::Result<()> {
        self.publish_state().await?;
        self.pump().await?;
        for _ in 0..transitions {
            self.mutate_state();
            self.publish_state().await?;
            if self.should_roll(self.notify_pct) {
                self.notify_random_bucket().await?;
            }
            self.pump().await?;
            self.clock.advance_ms(self.rng.gen_range(1..50));
        }
        Ok(())
    }

    /// Bring every node up with faults disabled and wait until no transition
    /// is pending.
    async fn converge(&mut self) -> anyhow::Result<()> {
        self.fail_pct = 0;
        self.drop_pct = 0;
        self.state.distributor_states.clear();
        self.state.storage_states.clear();
        self.publish_state().await?;
        loop {
            self.pump().await?;
            let stats = self.handle.stats().await?;
            if !stats.pending_transition && stats.outstanding_requests == 0 {
                return Ok(());
            }
            time::sleep(self.tick_interval).await;
        }
    }

    /// Toggle one storage node, and now and then a peer distributor.
    fn mutate_state(&mut self) {
        let node = self.rng.gen_range(0..self.state.storage_count);
        let current = self.state.node_state(NodeType::Storage, node);
        let next = if current == State::Up {
            if self.rng.gen_bool(0.2) {
                State::Maintenance
            } else {
                State::Down
            }
        } else {
            State::Up
        };
        self.state.set_node_state(NodeType::Storage, node, next);
        if self
            .state
            .up_storage_nodes(self.config.storage_up_states)
            .is_empty()
        {
            self.state.set_node_state(NodeType::Storage, node, State::Up);
        }

        if self.state.distributor_count > 1 && self.rng.gen_bool(0.1) {
            let peer = self.rng.gen_range(0..self.state.distributor_count);
            if peer != self.config.distributor_index {
                let next = match self.state.node_state(NodeType::Distributor, peer) {
                    State::Up => State::Down,
                    _ => State::Up,
                };
                self.state.set_node_state(NodeType::Distributor, peer, next);
            }
        }
    }

    async fn publish_state(&mut self) -> anyhow::Result<()> {
        self.state.version += 1;
        let bundle = ClusterStateBundle::new(self.state.clone()).deferred(self.defer_activation);
        let cmd = SetSystemStateCommand::new(self.next_id(), bundle);
        tracing::info!(state = %self.state, "publishing cluster state");
        self.counters.transitions += 1;
        self.handle.set_system_state(cmd).await?;
        Ok(())
    }

    /// A storage node rewrites one of its replicas and tells the distributor.
    async fn notify_random_bucket(&mut self) -> anyhow::Result<()> {
        let up = self.state.up_storage_nodes(self.config.storage_up_states);
        let candidates: Vec<NodeIndex> = up
            .into_iter()
            .filter(|node| self.storage.get(node).is_some_and(|r| !r.is_empty()))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let node = candidates[self.rng.gen_range(0..candidates.len())];
        let now = self.clock.now_ms();
        let Some(replicas) = self.storage.get_mut(&node) else {
            return Ok(());
        };
        let pick = self.rng.gen_range(0..replicas.len());
        let Some((bucket, info)) = replicas.iter_mut().nth(pick) else {
            return Ok(());
        };
        info.checksum = info.checksum.wrapping_add(1);
        info.doc_count += 1;
        info.last_modified = now;
        let (bucket, info) = (*bucket, *info);

        let cmd = NotifyBucketChangeCommand {
            msg_id: self.next_id(),
            source_node: node,
            bucket: Bucket::new(BucketSpace::DEFAULT, bucket),
            info,
        };
        tracing::debug!(node, bucket = %cmd.bucket, "notifying bucket change");
        self.counters.notifications += 1;
        self.handle.notify_bucket_change(cmd).await?;
        Ok(())
    }

    /// Deliver outbound messages until the updater goes quiet. Failed
    /// requests are resent by the service ticker once the clock has moved
    /// past their backoff.
    async fn pump(&mut self) -> anyhow::Result<()> {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut delivered = false;
            while let Ok(msg) = self.outbound.try_recv() {
                delivered = true;
                self.deliver(msg).await?;
            }
            if delivered {
                continue;
            }
            let stats = self.handle.stats().await?;
            if stats.delayed_requests == 0 {
                return Ok(());
            }
            self.clock.advance_ms(self.config.retry_delay_ms);
            time::sleep(self.tick_interval).await;
        }
        anyhow::bail!("updater did not settle after {MAX_PUMP_ROUNDS} rounds")
    }

    async fn deliver(&mut self, msg: Outbound) -> anyhow::Result<()> {
        match msg {
            Outbound::RequestBucketInfo(cmd) => {
                // Only full listings get lost; a later transition re-requests them.
                if cmd.is_full_listing() && self.should_roll(self.drop_pct) {
                    tracing::debug!(
                        node = cmd.target_node,
                        msg_id = cmd.msg_id,
                        "dropping request"
                    );
                    self.counters.requests_dropped += 1;
                    return Ok(());
                }
                let reply = if self.should_roll(self.fail_pct) {
                    self.counters.requests_failed += 1;
                    RequestBucketInfoReply::failed(&cmd, ResultCode::Busy)
                } else {
                    self.counters.requests_answered += 1;
                    self.answer(&cmd)
                };
                self.handle.request_bucket_info_reply(reply).await?;
            }
            Outbound::SetSystemStateForwarded(cmd) if cmd.bundle.deferred_activation => {
                let activate = ActivateClusterStateVersionCommand {
                    msg_id: self.next_id(),
                    version: cmd.bundle.version(),
                };
                self.counters.activations += 1;
                self.handle.activate_cluster_state_version(activate).await?;
            }
            Outbound::SetSystemStateReply(_) => self.counters.state_replies += 1,
            _ => {}
        }
        Ok(())
    }

    /// What a storage node reports. Only the default space holds data.
    fn answer(&self, cmd: &RequestBucketInfoCommand) -> RequestBucketInfoReply {
        if cmd.space != BucketSpace::DEFAULT {
            return RequestBucketInfoReply::ok(cmd, Vec::new());
        }
        let buckets = self
            .storage
            .get(&cmd.target_node)
            .map(|replicas| {
                replicas
                    .iter()
                    .filter(|(bucket, _)| cmd.is_full_listing() || cmd.buckets.contains(bucket))
                    .map(|(bucket, info)| (*bucket, *info))
                    .collect()
            })
            .unwrap_or_default();
        RequestBucketInfoReply::ok(cmd, buckets)
    }

    /// Compare the database with the replicas held by up storage nodes for
    /// buckets this distributor owns.
    fn verify(&self) -> VerifyReport {
        let up_states = self.config.storage_up_states;
        let mut expected: BTreeMap<BucketId, BTreeMap<NodeIndex, BucketInfo>> = BTreeMap::new();
        for (node, replicas) in &self.storage {
            if !self.state.node_is_up(NodeType::Storage, *node, up_states) {
                continue;
            }
            for (bucket, info) in replicas {
                let owned = self
                    .distribution
                    .ideal_distributor(&self.state, *bucket)
                    .is_ok_and(|owner| owner == self.config.distributor_index);
                if owned {
                    expected.entry(*bucket).or_default().insert(*node, *info);
                }
            }
        }

        let actual: BTreeMap<BucketId, BTreeMap<NodeIndex, BucketInfo>> = self
            .db
            .snapshot()
            .into_iter()
            .map(|entry| {
                let copies = entry.copies().iter().map(|c| (c.node, c.info)).collect();
                (entry.bucket(), copies)
            })
            .collect();

        let keys: BTreeSet<&BucketId> = expected.keys().chain(actual.keys()).collect();
        let mut mismatches = 0;
        for bucket in keys {
            let want = expected.get(bucket);
            let got = actual.get(bucket);
            if want != got {
                if mismatches < 10 {
                    tracing::warn!(%bucket, ?want, ?got, "bucket database mismatch");
                }
                mismatches += 1;
            }
        }
        VerifyReport {
            db_entries: actual.len(),
            expected_entries: expected.len(),
            mismatches,
        }
    }

    fn should_roll(&mut self, pct: u8) -> bool {
        pct > 0 && self.rng.gen_range(0..100) < pct
    }

    fn next_id(&mut self) -> MessageId {
        self.next_msg_id += 1;
        self.next_msg_id
    }
}

/// Write the run summary as pretty JSON, creating parent directories.
fn write_summary(path: &PathBuf, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
    }
    let data = serde_json::to_vec_pretty(summary).context("serialize summary")?;
    std::fs::write(path, data).with_context(|| format!("write summary {}", path.display()))?;
    Ok(())
}
