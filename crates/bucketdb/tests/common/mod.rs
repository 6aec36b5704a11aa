//! Shared helpers for integration tests.
//!
//! `Harness` wires a `BucketDbUpdater` to in-memory storage nodes and a
//! manual clock. Requests the updater sends are answered from the nodes'
//! replica maps by `answer_all`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use bucketdb::updater::{
    BucketDatabase, BucketDbUpdater, BucketId, BucketInfo, BucketSpace, BucketSpaceRepo,
    ClusterState, ClusterStateBundle, Distribution, ManualClock, MessageId, NodeIndex, Outbound,
    RendezvousDistribution, RequestBucketInfoCommand, RequestBucketInfoReply,
    SetSystemStateCommand, UpdaterConfig,
};
use tokio::sync::mpsc;

pub const START_MS: u64 = 50_000;

pub struct Harness {
    pub updater: BucketDbUpdater,
    pub clock: ManualClock,
    pub distribution: Arc<RendezvousDistribution>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Replicas held by each storage node in the default space.
    pub storage: BTreeMap<NodeIndex, BTreeMap<BucketId, BucketInfo>>,
    next_msg_id: MessageId,
}

impl Harness {
    pub fn new(config: UpdaterConfig, redundancy: usize) -> Self {
        let (tx, outbound) = mpsc::unbounded_channel();
        let clock = ManualClock::new(START_MS);
        let distribution = Arc::new(RendezvousDistribution::new(redundancy).with_seed(7));
        let repo = BucketSpaceRepo::with_default_spaces(distribution.clone());
        let updater = BucketDbUpdater::new(config, repo, Box::new(tx), Arc::new(clock.clone()))
            .expect("valid updater config");
        Self {
            updater,
            clock,
            distribution,
            outbound,
            storage: BTreeMap::new(),
            next_msg_id: 10_000,
        }
    }

    pub fn db(&self) -> Arc<BucketDatabase> {
        self.updater
            .bucket_space_repo()
            .get(BucketSpace::DEFAULT)
            .expect("default bucket space")
            .bucket_database()
            .clone()
    }

    /// Place `buckets` on their ideal nodes under `state`.
    pub fn populate(&mut self, state: &str, buckets: impl IntoIterator<Item = BucketId>) {
        let state: ClusterState = state.parse().expect("cluster state");
        let up_states = self.updater.config().storage_up_states;
        for (i, bucket) in buckets.into_iter().enumerate() {
            let info = BucketInfo::new(i as u32 + 1, 10, 1_000, START_MS);
            for node in self.distribution.ideal_storage_nodes(&state, bucket, up_states) {
                self.storage.entry(node).or_default().insert(bucket, info);
            }
        }
    }

    pub fn set_state(&mut self, state: &str) -> SetSystemStateCommand {
        self.set_bundle(ClusterStateBundle::new(state.parse().expect("cluster state")))
    }

    pub fn set_bundle(&mut self, bundle: ClusterStateBundle) -> SetSystemStateCommand {
        self.next_msg_id += 1;
        let cmd = SetSystemStateCommand::new(self.next_msg_id, bundle);
        self.updater.on_set_system_state(cmd.clone());
        cmd
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn take_requests(&mut self) -> Vec<RequestBucketInfoCommand> {
        self.drain()
            .into_iter()
            .filter_map(|msg| match msg {
                Outbound::RequestBucketInfo(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// What a storage node would answer. Only the default space holds data.
    pub fn answer(&self, cmd: &RequestBucketInfoCommand) -> RequestBucketInfoReply {
        if cmd.space != BucketSpace::DEFAULT {
            return RequestBucketInfoReply::ok(cmd, Vec::new());
        }
        let held = self.storage.get(&cmd.target_node);
        let buckets = held
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

    /// Answer requests until none are outstanding; returns everything else
    /// the updater emitted meanwhile.
    pub fn answer_all(&mut self) -> Vec<Outbound> {
        let mut other = Vec::new();
        loop {
            let mut answered = false;
            for msg in self.drain() {
                match msg {
                    Outbound::RequestBucketInfo(cmd) => {
                        let reply = self.answer(&cmd);
                        self.updater.on_request_bucket_info_reply(&reply);
                        answered = true;
                    }
                    msg => other.push(msg),
                }
            }
            if !answered {
                return other;
            }
        }
    }

    /// Database contents of the default space as bucket -> nodes.
    pub fn db_layout(&self) -> BTreeMap<BucketId, Vec<NodeIndex>> {
        self.db()
            .snapshot()
            .into_iter()
            .map(|entry| (entry.bucket(), entry.nodes()))
            .collect()
    }

    /// Expected layout under the active state: every owned bucket with the
    /// up nodes holding it, in ideal order.
    pub fn expected_layout(&self) -> BTreeMap<BucketId, Vec<NodeIndex>> {
        let state = self.updater.active_bundle().derived_state(BucketSpace::DEFAULT);
        let config = self.updater.config();
        let mut holders: BTreeMap<BucketId, Vec<NodeIndex>> = BTreeMap::new();
        for (node, replicas) in &self.storage {
            if !state.node_is_up(
                bucketdb::updater::NodeType::Storage,
                *node,
                config.storage_up_states,
            ) {
                continue;
            }
            for bucket in replicas.keys() {
                let owned = self
                    .distribution
                    .ideal_distributor(&state, *bucket)
                    .is_ok_and(|d| d == config.distributor_index);
                if owned {
                    holders.entry(*bucket).or_default().push(*node);
                }
            }
        }
        for (bucket, nodes) in holders.iter_mut() {
            let ideal = self
                .distribution
                .ideal_storage_nodes(&state, *bucket, config.storage_up_states);
            nodes.sort_by_key(|n| (ideal.iter().position(|i| i == n).unwrap_or(ideal.len()), *n));
        }
        holders
    }
}

pub fn buckets(count: u64) -> Vec<BucketId> {
    (0..count).map(|i| BucketId::new(16, i * 7 + 1)).collect()
}
