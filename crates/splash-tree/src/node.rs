//! Branch and leaf storage.

use std::sync::Arc;

use indexmap::IndexMap;
use splash_core::Value;

use crate::Seed;

pub(crate) type LeafCallback = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) struct Leaf {
    pub value: Value,
    /// Microseconds since epoch of the last accepted write.
    pub timestamp: i64,
    /// Seed of the last accepted writer, tie-breaker for equal timestamps.
    pub last_writer: Seed,
    pub callbacks: Vec<(u64, LeafCallback)>,
}

impl Leaf {
    pub fn new(value: Value, timestamp: i64, writer: Seed) -> Self {
        Self {
            value,
            timestamp,
            last_writer: writer,
            callbacks: Vec::new(),
        }
    }

    /// Last-writer-wins: an older stamp loses, a timestamp tie is won by an
    /// equal or higher seed. Accepting the equal seed keeps per-producer
    /// order for writes landing within the same microsecond.
    pub fn accepts(&self, timestamp: i64, writer: Seed) -> bool {
        timestamp > self.timestamp || (timestamp == self.timestamp && writer >= self.last_writer)
    }
}

#[derive(Default)]
pub(crate) struct Branch {
    pub branches: IndexMap<String, Branch>,
    pub leaves: IndexMap<String, Leaf>,
}

impl Branch {
    pub fn walk(&self, parts: &[&str]) -> Option<&Branch> {
        let mut current = self;
        for part in parts {
            current = current.branches.get(*part)?;
        }
        Some(current)
    }

    pub fn walk_mut(&mut self, parts: &[&str]) -> Option<&mut Branch> {
        let mut current = self;
        for part in parts {
            current = current.branches.get_mut(*part)?;
        }
        Some(current)
    }

    /// Walk to `parts`, creating missing branches along the way.
    pub fn walk_or_create(&mut self, parts: &[&str]) -> &mut Branch {
        let mut current = self;
        for part in parts {
            current = current
                .branches
                .entry((*part).to_string())
                .or_insert_with(Branch::default);
        }
        current
    }

    pub fn leaf(&self, parts: &[&str], name: &str) -> Option<&Leaf> {
        self.walk(parts)?.leaves.get(name)
    }

    pub fn leaf_mut(&mut self, parts: &[&str], name: &str) -> Option<&mut Leaf> {
        self.walk_mut(parts)?.leaves.get_mut(name)
    }

    pub fn collect_leaves(&self, prefix: &str, out: &mut Vec<(String, Value, i64)>) {
        for (name, leaf) in &self.leaves {
            out.push((format!("{prefix}/{name}"), leaf.value.clone(), leaf.timestamp));
        }
        for (name, branch) in &self.branches {
            branch.collect_leaves(&format!("{prefix}/{name}"), out);
        }
    }
}
