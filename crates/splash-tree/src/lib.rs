//! Replicated hierarchical key/value store.
//!
//! Every process owns one [`Tree`]. Local mutations are applied in place and
//! appended, as [`Command`]s, to one outgoing queue per registered peer;
//! draining a queue and replaying it on the peer reproduces the mutations
//! there. Replay is loop-free by construction: every command carries the
//! seed of its originating tree, and a tree skips commands bearing its own
//! seed. Leaf writes resolve conflicts last-writer-wins on the timestamp,
//! ties broken by the higher seed.

// crate-specific lint exceptions:
//#![allow()]

mod command;
mod node;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use splash_core::{clock, Value};
use thiserror::Error;
use tracing::{error, warn};

pub use command::{Command, CommandOp};
use node::{Branch, Leaf, LeafCallback};

/// Identifies the tree a command originated from.
pub type Seed = u64;

/// Identifies a leaf subscription, for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("no node at {0}")]
    NotFound(String),
    #[error("a node already exists at {0}")]
    AlreadyExists(String),
    #[error("invalid path {0}")]
    InvalidPath(String),
    #[error("unknown peer seed {0}")]
    UnknownPeer(Seed),
}

pub type Result<T, E = TreeError> = std::result::Result<T, E>;

/// Commands kept per peer before the oldest are dropped.
const MAX_QUEUE_DEPTH: usize = 4096;

struct Inner {
    root: Branch,
    peers: IndexMap<Seed, VecDeque<Command>>,
    next_callback_id: u64,
}

/// A process-local replica of the shared attribute tree.
pub struct Tree {
    seed: Seed,
    inner: Mutex<Inner>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let (hi, lo) = uuid.as_u64_pair();
        Self::with_seed(hi ^ lo)
    }

    /// Build a tree with a fixed seed. Mostly useful for tests, where seed
    /// ordering decides conflict ties.
    pub fn with_seed(seed: Seed) -> Self {
        Self {
            seed,
            inner: Mutex::new(Inner {
                root: Branch::default(),
                peers: IndexMap::new(),
                next_callback_id: 0,
            }),
        }
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    /// Register a peer; every subsequent local mutation is queued for it.
    pub fn add_seed(&self, peer: Seed) {
        let mut inner = self.lock();
        inner.peers.entry(peer).or_insert_with(VecDeque::new);
    }

    pub fn remove_seed(&self, peer: Seed) {
        let mut inner = self.lock();
        inner.peers.shift_remove(&peer);
    }

    pub fn peer_seeds(&self) -> Vec<Seed> {
        self.lock().peers.keys().copied().collect()
    }

    pub fn has_branch_at(&self, path: &str) -> bool {
        let Ok(parts) = split_path(path) else {
            return false;
        };
        self.lock().root.walk(&parts).is_some()
    }

    pub fn has_leaf_at(&self, path: &str) -> bool {
        let Ok((parts, name)) = split_leaf_path(path) else {
            return false;
        };
        self.lock().root.leaf(&parts, name).is_some()
    }

    /// Create a branch, along with any missing intermediate branch.
    pub fn create_branch_at(&self, path: &str) -> Result<()> {
        let parts = split_path(path)?;
        if parts.is_empty() {
            return Err(TreeError::InvalidPath(path.into()));
        }
        let timestamp = clock::now_us();
        let mut inner = self.lock();
        if inner.root.walk(&parts).is_some() {
            return Err(TreeError::AlreadyExists(path.into()));
        }
        inner.root.walk_or_create(&parts);
        self.record(&mut inner, CommandOp::AddBranch, path, None, timestamp);
        Ok(())
    }

    /// Remove a branch and everything below it.
    pub fn remove_branch_at(&self, path: &str) -> Result<()> {
        let parts = split_path(path)?;
        let (parents, name) = parts
            .split_last()
            .map(|(name, parents)| (parents, *name))
            .ok_or_else(|| TreeError::InvalidPath(path.into()))?;
        let timestamp = clock::now_us();
        let mut inner = self.lock();
        let parent = inner
            .root
            .walk_mut(parents)
            .ok_or_else(|| TreeError::NotFound(path.into()))?;
        if parent.branches.shift_remove(name).is_none() {
            return Err(TreeError::NotFound(path.into()));
        }
        self.record(&mut inner, CommandOp::RemoveBranch, path, None, timestamp);
        Ok(())
    }

    /// Create a leaf, along with any missing parent branch.
    pub fn create_leaf_at(&self, path: &str, initial: Option<Value>) -> Result<()> {
        let (parts, name) = split_leaf_path(path)?;
        let timestamp = clock::now_us();
        let value = initial.unwrap_or_else(|| Value::new_values(vec![]));
        let seed = self.seed;
        let mut inner = self.lock();
        let branch = inner.root.walk_or_create(&parts);
        if branch.leaves.contains_key(name) {
            return Err(TreeError::AlreadyExists(path.into()));
        }
        // A fresh leaf stamps at zero so the first real write always lands.
        branch
            .leaves
            .insert(name.to_string(), Leaf::new(value.clone(), 0, seed));
        self.record(&mut inner, CommandOp::AddLeaf, path, Some(value), timestamp);
        Ok(())
    }

    pub fn remove_leaf_at(&self, path: &str) -> Result<()> {
        let (parts, name) = split_leaf_path(path)?;
        let timestamp = clock::now_us();
        let mut inner = self.lock();
        let branch = inner
            .root
            .walk_mut(&parts)
            .ok_or_else(|| TreeError::NotFound(path.into()))?;
        if branch.leaves.shift_remove(name).is_none() {
            return Err(TreeError::NotFound(path.into()));
        }
        self.record(&mut inner, CommandOp::RemoveLeaf, path, None, timestamp);
        Ok(())
    }

    /// Write a leaf. `timestamp` defaults to now; a write older than the
    /// leaf's current stamp is dropped.
    pub fn set_value_at(&self, path: &str, value: Value, timestamp: Option<i64>) -> Result<()> {
        let (parts, name) = split_leaf_path(path)?;
        let timestamp = timestamp.unwrap_or_else(clock::now_us);
        let seed = self.seed;

        let callbacks: Vec<LeafCallback>;
        {
            let mut inner = self.lock();
            let leaf = inner
                .root
                .leaf_mut(&parts, name)
                .ok_or_else(|| TreeError::NotFound(path.into()))?;
            if !leaf.accepts(timestamp, seed) {
                return Ok(());
            }
            leaf.value = value.clone();
            leaf.timestamp = timestamp;
            leaf.last_writer = seed;
            callbacks = leaf.callbacks.iter().map(|(_, cb)| cb.clone()).collect();
            self.record(
                &mut inner,
                CommandOp::SetLeaf,
                path,
                Some(value.clone()),
                timestamp,
            );
        }

        invoke_callbacks(path, &callbacks, &value);
        Ok(())
    }

    pub fn get_value_at(&self, path: &str) -> Option<Value> {
        let (parts, name) = split_leaf_path(path).ok()?;
        self.lock()
            .root
            .leaf(&parts, name)
            .map(|leaf| leaf.value.clone())
    }

    /// Child branch names, in insertion order.
    pub fn get_branch_list_at(&self, path: &str) -> Result<Vec<String>> {
        let parts = split_path(path)?;
        let inner = self.lock();
        let branch = inner
            .root
            .walk(&parts)
            .ok_or_else(|| TreeError::NotFound(path.into()))?;
        Ok(branch.branches.keys().cloned().collect())
    }

    /// Leaf names, in insertion order.
    pub fn get_leaf_list_at(&self, path: &str) -> Result<Vec<String>> {
        let parts = split_path(path)?;
        let inner = self.lock();
        let branch = inner
            .root
            .walk(&parts)
            .ok_or_else(|| TreeError::NotFound(path.into()))?;
        Ok(branch.leaves.keys().cloned().collect())
    }

    /// Register a callback run after every accepted write to the leaf.
    pub fn subscribe_leaf_at(
        &self,
        path: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<CallbackId> {
        let (parts, name) = split_leaf_path(path)?;
        let mut inner = self.lock();
        inner.next_callback_id += 1;
        let id = inner.next_callback_id;
        let leaf = inner
            .root
            .leaf_mut(&parts, name)
            .ok_or_else(|| TreeError::NotFound(path.into()))?;
        leaf.callbacks.push((id, Arc::new(callback)));
        Ok(CallbackId(id))
    }

    pub fn unsubscribe_leaf_at(&self, path: &str, id: CallbackId) -> bool {
        let Ok((parts, name)) = split_leaf_path(path) else {
            return false;
        };
        let mut inner = self.lock();
        let Some(leaf) = inner.root.leaf_mut(&parts, name) else {
            return false;
        };
        let before = leaf.callbacks.len();
        leaf.callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        leaf.callbacks.len() != before
    }

    /// Take the pending commands queued for `peer`.
    pub fn drain_commands_for(&self, peer: Seed) -> Result<Vec<Command>> {
        let mut inner = self.lock();
        let queue = inner
            .peers
            .get_mut(&peer)
            .ok_or(TreeError::UnknownPeer(peer))?;
        Ok(queue.drain(..).collect())
    }

    pub fn has_pending_commands(&self) -> bool {
        self.lock().peers.values().any(|queue| !queue.is_empty())
    }

    /// Replay commands received from a peer. Commands bearing this tree's
    /// own seed are skipped; stale leaf writes are dropped.
    pub fn apply_commands(&self, commands: impl IntoIterator<Item = Command>) {
        for command in commands {
            if command.seed == self.seed {
                continue;
            }
            self.apply(command);
        }
    }

    fn apply(&self, command: Command) {
        let Command {
            seed,
            timestamp,
            op,
            path,
            value,
        } = command;

        match op {
            CommandOp::AddBranch => {
                if let Ok(parts) = split_path(&path) {
                    self.lock().root.walk_or_create(&parts);
                }
            }
            CommandOp::RemoveBranch => {
                if let Ok(parts) = split_path(&path) {
                    if let Some((name, parents)) = parts.split_last() {
                        let mut inner = self.lock();
                        if let Some(parent) = inner.root.walk_mut(parents) {
                            parent.branches.shift_remove(*name);
                        }
                    }
                }
            }
            CommandOp::AddLeaf => {
                if let Ok((parts, name)) = split_leaf_path(&path) {
                    let value = value.unwrap_or_else(|| Value::new_values(vec![]));
                    let mut inner = self.lock();
                    let branch = inner.root.walk_or_create(&parts);
                    branch
                        .leaves
                        .entry(name.to_string())
                        .or_insert_with(|| Leaf::new(value, 0, seed));
                }
            }
            CommandOp::RemoveLeaf => {
                if let Ok((parts, name)) = split_leaf_path(&path) {
                    let mut inner = self.lock();
                    if let Some(branch) = inner.root.walk_mut(&parts) {
                        branch.leaves.shift_remove(name);
                    }
                }
            }
            CommandOp::SetLeaf => {
                let Some(value) = value else { return };
                let Ok((parts, name)) = split_leaf_path(&path) else {
                    return;
                };
                let callbacks: Vec<LeafCallback>;
                {
                    let mut inner = self.lock();
                    let Some(leaf) = inner.root.leaf_mut(&parts, name) else {
                        return;
                    };
                    if !leaf.accepts(timestamp, seed) {
                        return;
                    }
                    leaf.value = value.clone();
                    leaf.timestamp = timestamp;
                    leaf.last_writer = seed;
                    callbacks = leaf.callbacks.iter().map(|(_, cb)| cb.clone()).collect();
                }
                invoke_callbacks(&path, &callbacks, &value);
            }
        }
    }

    /// Every leaf path with its value and timestamp, depth first.
    pub fn flatten(&self) -> Vec<(String, Value, i64)> {
        let mut out = Vec::new();
        self.lock().root.collect_leaves("", &mut out);
        out
    }

    fn record(
        &self,
        inner: &mut Inner,
        op: CommandOp,
        path: &str,
        value: Option<Value>,
        timestamp: i64,
    ) {
        let seed = self.seed;
        for (peer, queue) in &mut inner.peers {
            if queue.len() >= MAX_QUEUE_DEPTH {
                warn!(peer, path, "tree command queue full, dropping oldest");
                queue.pop_front();
            }
            queue.push_back(Command {
                seed,
                timestamp,
                op,
                path: path.to_string(),
                value: value.clone(),
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn invoke_callbacks(path: &str, callbacks: &[LeafCallback], value: &Value) {
    for callback in callbacks {
        if panic::catch_unwind(AssertUnwindSafe(|| callback.as_ref()(value))).is_err() {
            error!(path, "leaf callback panicked");
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(TreeError::InvalidPath(path.into()));
    }
    Ok(path.split('/').filter(|part| !part.is_empty()).collect())
}

fn split_leaf_path(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = split_path(path)?;
    let name = parts.pop().ok_or_else(|| TreeError::InvalidPath(path.into()))?;
    Ok((parts, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_set_is_last_writer_wins() {
        let tree = Tree::with_seed(1);
        tree.create_leaf_at("/a/b", None).unwrap();

        tree.set_value_at("/a/b", Value::from(7), Some(100)).unwrap();
        tree.set_value_at("/a/b", Value::from(3), Some(50)).unwrap();
        assert_eq!(tree.get_value_at("/a/b").unwrap().as_int(), 7);

        tree.set_value_at("/a/b", Value::from(9), Some(200)).unwrap();
        assert_eq!(tree.get_value_at("/a/b").unwrap().as_int(), 9);
    }

    #[test]
    fn replay_reproduces_leaf_contents() {
        let source = Tree::with_seed(1);
        let replica = Tree::with_seed(2);
        source.add_seed(replica.seed());

        source.create_branch_at("/world").unwrap();
        source
            .create_leaf_at("/world/objects/img/attributes/alias", None)
            .unwrap();
        source
            .set_value_at(
                "/world/objects/img/attributes/alias",
                Value::from("newAlias"),
                None,
            )
            .unwrap();
        source.create_leaf_at("/world/fps", Some(Value::from(60))).unwrap();
        source.remove_leaf_at("/world/fps").unwrap();

        let commands = source.drain_commands_for(replica.seed()).unwrap();
        replica.apply_commands(commands);

        let source_leaves: Vec<_> = source
            .flatten()
            .into_iter()
            .map(|(path, value, _)| (path, value))
            .collect();
        let replica_leaves: Vec<_> = replica
            .flatten()
            .into_iter()
            .map(|(path, value, _)| (path, value))
            .collect();
        assert_eq!(source_leaves, replica_leaves);
    }

    #[test]
    fn own_commands_are_skipped_on_replay() {
        let tree = Tree::with_seed(1);
        tree.create_leaf_at("/a/b", Some(Value::from(1))).unwrap();

        // A command that claims to come from this very tree must be ignored.
        tree.apply_commands([Command {
            seed: 1,
            timestamp: i64::MAX,
            op: CommandOp::SetLeaf,
            path: "/a/b".into(),
            value: Some(Value::from(99)),
        }]);
        assert_eq!(tree.get_value_at("/a/b").unwrap().as_int(), 1);
    }

    #[test]
    fn equal_timestamps_break_ties_by_seed() {
        let tree = Tree::with_seed(1);
        tree.create_leaf_at("/a/b", None).unwrap();
        tree.set_value_at("/a/b", Value::from(1), Some(100)).unwrap();

        tree.apply_commands([Command {
            seed: 5,
            timestamp: 100,
            op: CommandOp::SetLeaf,
            path: "/a/b".into(),
            value: Some(Value::from(2)),
        }]);
        assert_eq!(tree.get_value_at("/a/b").unwrap().as_int(), 2);

        tree.apply_commands([Command {
            seed: 3,
            timestamp: 100,
            op: CommandOp::SetLeaf,
            path: "/a/b".into(),
            value: Some(Value::from(4)),
        }]);
        assert_eq!(tree.get_value_at("/a/b").unwrap().as_int(), 2);
    }

    #[test]
    fn listings_preserve_insertion_order() {
        let tree = Tree::new();
        tree.create_branch_at("/zebra").unwrap();
        tree.create_branch_at("/alpha").unwrap();
        tree.create_leaf_at("/zebra/last", None).unwrap();
        tree.create_leaf_at("/zebra/first", None).unwrap();

        assert_eq!(tree.get_branch_list_at("/").unwrap(), vec!["zebra", "alpha"]);
        assert_eq!(
            tree.get_leaf_list_at("/zebra").unwrap(),
            vec!["last", "first"]
        );
    }

    #[test]
    fn subscriptions_fire_on_accepted_writes_only() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let tree = Tree::with_seed(1);
        tree.create_leaf_at("/a/b", None).unwrap();

        let seen = Arc::new(AtomicI64::new(0));
        let seen_cb = seen.clone();
        tree.subscribe_leaf_at("/a/b", move |value| {
            seen_cb.store(value.as_int(), Ordering::SeqCst);
        })
        .unwrap();

        tree.set_value_at("/a/b", Value::from(11), Some(100)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 11);

        // Stale write: callback must not fire.
        tree.set_value_at("/a/b", Value::from(5), Some(50)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn command_queues_are_bounded() {
        let tree = Tree::with_seed(1);
        tree.add_seed(2);
        tree.create_leaf_at("/a/b", None).unwrap();
        for i in 0..(MAX_QUEUE_DEPTH as i64 + 10) {
            tree.set_value_at("/a/b", Value::from(i), Some(i + 1)).unwrap();
        }
        let commands = tree.drain_commands_for(2).unwrap();
        assert_eq!(commands.len(), MAX_QUEUE_DEPTH);
    }
}
