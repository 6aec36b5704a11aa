//! Cluster state snapshots and their compact textual form.
//!
//! A `ClusterState` lists, per node type, how many nodes exist and which ones
//! deviate from `Up`. The textual form mirrors what the cluster controller
//! distributes, e.g. `version:7 bits:16 distributor:2 storage:4 .2.s:d`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::types::{BucketSpace, NodeIndex};

/// Distribution-bit count used when a state does not carry `bits:`.
pub const DEFAULT_DISTRIBUTION_BITS: u16 = 16;

/// Node state as published by the cluster controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Up,
    Down,
    Retired,
    Maintenance,
    Initializing,
    Stopping,
}

impl State {
    pub fn code(&self) -> char {
        match self {
            State::Up => 'u',
            State::Down => 'd',
            State::Retired => 'r',
            State::Maintenance => 'm',
            State::Initializing => 'i',
            State::Stopping => 's',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'u' => Some(State::Up),
            'd' => Some(State::Down),
            'r' => Some(State::Retired),
            'm' => Some(State::Maintenance),
            'i' => Some(State::Initializing),
            's' => Some(State::Stopping),
            _ => None,
        }
    }

    fn bit(&self) -> u8 {
        match self {
            State::Up => 1,
            State::Down => 1 << 1,
            State::Retired => 1 << 2,
            State::Maintenance => 1 << 3,
            State::Initializing => 1 << 4,
            State::Stopping => 1 << 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Distributor,
    Storage,
}

impl NodeType {
    fn token(&self) -> &'static str {
        match self {
            NodeType::Distributor => "distributor",
            NodeType::Storage => "storage",
        }
    }
}

/// Set of node states considered "available", written as state codes
/// (`"uri"` = up, retired or initializing).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UpStates(u8);

impl UpStates {
    pub fn parse(codes: &str) -> anyhow::Result<Self> {
        let mut bits = 0u8;
        for code in codes.chars() {
            let state = State::from_code(code)
                .with_context(|| format!("unknown node state code '{code}' in \"{codes}\""))?;
            bits |= state.bit();
        }
        Ok(Self(bits))
    }

    pub const fn storage_default() -> Self {
        // u, r, i
        Self(1 | (1 << 2) | (1 << 4))
    }

    pub const fn distributor_default() -> Self {
        // u, i, m
        Self(1 | (1 << 3) | (1 << 4))
    }

    pub fn contains(&self, state: State) -> bool {
        self.0 & state.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for UpStates {
    fn default() -> Self {
        Self::storage_default()
    }
}

impl fmt::Display for UpStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for state in [
            State::Up,
            State::Down,
            State::Retired,
            State::Maintenance,
            State::Initializing,
            State::Stopping,
        ] {
            if self.contains(state) {
                write!(f, "{}", state.code())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for UpStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpStates(\"{self}\")")
    }
}

impl TryFrom<String> for UpStates {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UpStates> for String {
    fn from(value: UpStates) -> Self {
        value.to_string()
    }
}

/// Immutable snapshot of cluster topology for one bucket space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u32,
    pub distribution_bits: u16,
    pub distributor_count: u16,
    pub storage_count: u16,
    /// Distributors whose state is not `Up`.
    #[serde(default)]
    pub distributor_states: BTreeMap<NodeIndex, State>,
    /// Storage nodes whose state is not `Up`.
    #[serde(default)]
    pub storage_states: BTreeMap<NodeIndex, State>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            version: 0,
            distribution_bits: DEFAULT_DISTRIBUTION_BITS,
            distributor_count: 0,
            storage_count: 0,
            distributor_states: BTreeMap::new(),
            storage_states: BTreeMap::new(),
        }
    }
}

impl ClusterState {
    pub fn new(version: u32, distributor_count: u16, storage_count: u16) -> Self {
        Self {
            version,
            distributor_count,
            storage_count,
            ..Self::default()
        }
    }

    pub fn with_distribution_bits(mut self, bits: u16) -> Self {
        self.distribution_bits = bits;
        self
    }

    /// Builder-style override of a single node's state.
    pub fn with_node_state(mut self, node_type: NodeType, index: NodeIndex, state: State) -> Self {
        self.set_node_state(node_type, index, state);
        self
    }

    pub fn set_node_state(&mut self, node_type: NodeType, index: NodeIndex, state: State) {
        let states = match node_type {
            NodeType::Distributor => &mut self.distributor_states,
            NodeType::Storage => &mut self.storage_states,
        };
        if state == State::Up {
            states.remove(&index);
        } else {
            states.insert(index, state);
        }
    }

    pub fn node_count(&self, node_type: NodeType) -> u16 {
        match node_type {
            NodeType::Distributor => self.distributor_count,
            NodeType::Storage => self.storage_count,
        }
    }

    /// Nodes beyond the node count are implicitly down.
    pub fn node_state(&self, node_type: NodeType, index: NodeIndex) -> State {
        if index >= self.node_count(node_type) {
            return State::Down;
        }
        let states = match node_type {
            NodeType::Distributor => &self.distributor_states,
            NodeType::Storage => &self.storage_states,
        };
        states.get(&index).copied().unwrap_or(State::Up)
    }

    pub fn node_is_up(&self, node_type: NodeType, index: NodeIndex, up_states: UpStates) -> bool {
        up_states.contains(self.node_state(node_type, index))
    }

    /// Storage nodes whose state is in `up_states`.
    pub fn up_storage_nodes(&self, up_states: UpStates) -> BTreeSet<NodeIndex> {
        (0..self.storage_count)
            .filter(|idx| self.node_is_up(NodeType::Storage, *idx, up_states))
            .collect()
    }

    /// Human-readable list of changes from `self` to `other`, for log lines.
    pub fn textual_difference(&self, other: &ClusterState) -> String {
        let mut parts = Vec::new();
        if self.version != other.version {
            parts.push(format!("version: {} => {}", self.version, other.version));
        }
        if self.distribution_bits != other.distribution_bits {
            parts.push(format!(
                "bits: {} => {}",
                self.distribution_bits, other.distribution_bits
            ));
        }
        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let count = self.node_count(node_type).max(other.node_count(node_type));
            let changes: Vec<String> = (0..count)
                .filter_map(|idx| {
                    let before = self.node_state(node_type, idx);
                    let after = other.node_state(node_type, idx);
                    (before != after).then(|| format!("{idx}: {before:?} => {after:?}"))
                })
                .collect();
            if !changes.is_empty() {
                parts.push(format!("{}: [{}]", node_type.token(), changes.join(", ")));
            }
        }
        if parts.is_empty() {
            "no change".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        if self.version != 0 {
            tokens.push(format!("version:{}", self.version));
        }
        if self.distribution_bits != DEFAULT_DISTRIBUTION_BITS {
            tokens.push(format!("bits:{}", self.distribution_bits));
        }
        for (node_type, states) in [
            (NodeType::Distributor, &self.distributor_states),
            (NodeType::Storage, &self.storage_states),
        ] {
            let count = self.node_count(node_type);
            if count == 0 {
                continue;
            }
            tokens.push(format!("{}:{count}", node_type.token()));
            for (idx, state) in states.iter().filter(|(idx, _)| **idx < count) {
                tokens.push(format!(".{idx}.s:{}", state.code()));
            }
        }
        f.write_str(&tokens.join(" "))
    }
}

impl FromStr for ClusterState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = ClusterState::default();
        let mut current: Option<NodeType> = None;
        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .with_context(|| format!("malformed cluster state token \"{token}\""))?;
            if let Some(rest) = key.strip_prefix('.') {
                let node_type = current.with_context(|| {
                    format!("node state \"{token}\" appears before any node type")
                })?;
                let (idx, attr) = rest
                    .split_once('.')
                    .with_context(|| format!("malformed node state token \"{token}\""))?;
                anyhow::ensure!(attr == "s", "unsupported node attribute in \"{token}\"");
                let idx: NodeIndex = idx
                    .parse()
                    .with_context(|| format!("bad node index in \"{token}\""))?;
                let code = value.chars().next().unwrap_or(' ');
                let node_state = State::from_code(code)
                    .with_context(|| format!("unknown node state in \"{token}\""))?;
                state.set_node_state(node_type, idx, node_state);
                continue;
            }
            match key {
                "version" => state.version = value.parse().context("bad version")?,
                "bits" => state.distribution_bits = value.parse().context("bad bits")?,
                "distributor" => {
                    state.distributor_count = value.parse().context("bad distributor count")?;
                    current = Some(NodeType::Distributor);
                }
                "storage" => {
                    state.storage_count = value.parse().context("bad storage count")?;
                    current = Some(NodeType::Storage);
                }
                // Cluster-level up/down is not modelled; the controller expresses
                // it through node states.
                "cluster" => {}
                other => anyhow::bail!("unknown cluster state key \"{other}\""),
            }
        }
        Ok(state)
    }
}

/// Baseline cluster state plus optional per-bucket-space derived states.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateBundle {
    pub baseline: Arc<ClusterState>,
    #[serde(default)]
    pub derived: BTreeMap<BucketSpace, Arc<ClusterState>>,
    /// Set by the controller when activation must wait for an explicit command.
    #[serde(default)]
    pub deferred_activation: bool,
}

impl ClusterStateBundle {
    pub fn new(baseline: ClusterState) -> Self {
        Self {
            baseline: Arc::new(baseline),
            derived: BTreeMap::new(),
            deferred_activation: false,
        }
    }

    pub fn deferred(mut self, deferred: bool) -> Self {
        self.deferred_activation = deferred;
        self
    }

    pub fn with_derived(mut self, space: BucketSpace, state: ClusterState) -> Self {
        self.derived.insert(space, Arc::new(state));
        self
    }

    pub fn version(&self) -> u32 {
        self.baseline.version
    }

    /// State for `space`, falling back to the baseline.
    pub fn derived_state(&self, space: BucketSpace) -> Arc<ClusterState> {
        self.derived
            .get(&space)
            .cloned()
            .unwrap_or_else(|| self.baseline.clone())
    }
}

impl fmt::Display for ClusterStateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.baseline)?;
        for (space, state) in &self.derived {
            write!(f, " [{space}: {state}]")?;
        }
        if self.deferred_activation {
            f.write_str(" (deferred)")?;
        }
        Ok(())
    }
}
