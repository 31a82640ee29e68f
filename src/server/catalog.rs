//! Replicated catalog of lendable items and its reserve/return transitions.

use std::fmt;
use std::str::FromStr;

use crate::utils::LendsetError;

/// Catalog mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Reserve,
    Return,
}

impl FromStr for Op {
    type Err = LendsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("reserve") {
            Ok(Op::Reserve)
        } else if s.eq_ignore_ascii_case("return") {
            Ok(Op::Return)
        } else {
            Err(LendsetError::msg(format!("unknown op '{}'", s)))
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Reserve => write!(f, "reserve"),
            Op::Return => write!(f, "return"),
        }
    }
}

/// Status of a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemStatus {
    Free,
    Reserved(String),
}

/// Result of applying a mutation. A rejection is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Committed,
    Rejected,
}

/// Full catalog snapshot: holder (if any) of each item in id order.
pub(crate) type Snapshot = Vec<(String, Option<String>)>;

/// In-memory catalog. Items are `b0 .. b<n-1>`, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Catalog {
    items: Vec<ItemStatus>,

    /// Number of committed mutations applied so far.
    version: u64,
}

impl Catalog {
    /// Creates a catalog of `num_items` free items.
    pub(crate) fn new(num_items: usize) -> Self {
        Catalog {
            items: vec![ItemStatus::Free; num_items],
            version: 0,
        }
    }

    /// Maps an item id to its index. Only the canonical `b<idx>` spelling
    /// is accepted.
    fn index_of(&self, item: &str) -> Option<usize> {
        let idx: usize = item.strip_prefix('b')?.parse().ok()?;
        if idx < self.items.len() && format!("b{}", idx) == item {
            Some(idx)
        } else {
            None
        }
    }

    /// Applies a reserve or return on behalf of `client`.
    pub(crate) fn apply(&mut self, client: &str, item: &str, op: Op) -> Outcome {
        let Some(idx) = self.index_of(item) else {
            return Outcome::Rejected;
        };
        let slot = &mut self.items[idx];

        let next = match (op, &*slot) {
            (Op::Reserve, ItemStatus::Free) => {
                ItemStatus::Reserved(client.to_string())
            }
            (Op::Return, ItemStatus::Reserved(holder)) if holder == client => {
                ItemStatus::Free
            }
            _ => return Outcome::Rejected,
        };

        *slot = next;
        self.version += 1;
        Outcome::Committed
    }

    /// Status of an item, or `None` if it does not exist.
    pub(crate) fn status(&self, item: &str) -> Option<&ItemStatus> {
        self.index_of(item).map(|idx| &self.items[idx])
    }

    /// Number of items.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Number of committed mutations applied so far.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Takes a full snapshot of the catalog.
    pub(crate) fn snapshot(&self) -> Snapshot {
        self.items
            .iter()
            .enumerate()
            .map(|(idx, status)| {
                let holder = match status {
                    ItemStatus::Free => None,
                    ItemStatus::Reserved(c) => Some(c.clone()),
                };
                (format!("b{}", idx), holder)
            })
            .collect()
    }

    /// Replaces the whole catalog content with a snapshot taken elsewhere.
    /// The snapshot must cover exactly the same items.
    pub(crate) fn restore(
        &mut self,
        version: u64,
        snapshot: Snapshot,
    ) -> Result<(), LendsetError> {
        if snapshot.len() != self.items.len() {
            return Err(LendsetError::msg(format!(
                "snapshot has {} items, expected {}",
                snapshot.len(),
                self.items.len()
            )));
        }

        let mut items = vec![ItemStatus::Free; self.items.len()];
        for (item, holder) in snapshot {
            let idx = self.index_of(&item).ok_or_else(|| {
                LendsetError::msg(format!("unknown item '{}' in snapshot", item))
            })?;
            if let Some(holder) = holder {
                items[idx] = ItemStatus::Reserved(holder);
            }
        }

        self.items = items;
        self.version = version;
        Ok(())
    }
}
