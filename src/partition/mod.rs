//! Partition functions: which destination(s) a row is sent to.
//!
//! A [`PartitionFunction`] is plain configuration. It is built once
//! with the plan fragment, may have its destination count bound once
//! afterwards, and is then only read. The JSON form is tagged by
//! `"type"` and decoding runs the same validation as the
//! constructors.

use serde::{Deserialize, Serialize};

use crate::batch::TupleBatch;
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};

mod hash;
mod hypercube;
mod simple;

pub use hash::HashPartition;
pub use hypercube::HypercubePartition;
pub use simple::{BroadcastPartition, RoundRobinPartition, SinglePartition, WorkerIdPartition};

/// The destinations of one row, borrowed from the partition function
/// where possible.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Destinations<'a> {
    One(usize),
    /// Every destination in `0..n`.
    All(usize),
    /// A hypercube cell's owners.
    Cell(&'a [usize]),
}

impl<'a> Destinations<'a> {
    pub fn iter(self) -> impl Iterator<Item = usize> + 'a {
        let (one, all, cell): (Option<usize>, std::ops::Range<usize>, &'a [usize]) = match self {
            Self::One(dest) => (Some(dest), 0..0, &[]),
            Self::All(n) => (None, 0..n, &[]),
            Self::Cell(dests) => (None, 0..0, dests),
        };
        one.into_iter().chain(all).chain(cell.iter().copied())
    }

    pub fn len(self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::All(n) => n,
            Self::Cell(dests) => dests.len(),
        }
    }

    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(self) -> Vec<usize> {
        self.iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PartitionFunction {
    /// Everything to destination 0.
    #[serde(rename = "SinglePartition")]
    Single(SinglePartition),
    Broadcast(BroadcastPartition),
    RoundRobin(RoundRobinPartition),
    /// The row names its 1-based destination worker in a column.
    WorkerId(WorkerIdPartition),
    Hash(HashPartition),
    /// Multi-dimensional hypercube join partitioning.
    #[serde(rename = "MFMD")]
    Hypercube(HypercubePartition),
}

impl PartitionFunction {
    pub fn single() -> Self {
        Self::Single(SinglePartition::default())
    }

    pub fn broadcast(num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self::Broadcast(BroadcastPartition::new(num_destinations)?))
    }

    pub fn round_robin(num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self::RoundRobin(RoundRobinPartition::new(num_destinations)?))
    }

    pub fn worker_id(index: usize, num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self::WorkerId(WorkerIdPartition::new(index, num_destinations)?))
    }

    pub fn hash(num_destinations: Option<usize>, indexes: Vec<usize>) -> ExchangeResult<Self> {
        Ok(Self::Hash(HashPartition::new(num_destinations, indexes)?))
    }

    pub fn hypercube(
        cell_partition: Vec<Vec<usize>>,
        hypercube_dimensions: Vec<usize>,
        hashed_columns: Vec<usize>,
        mapped_hc_dimensions: Vec<usize>,
    ) -> ExchangeResult<Self> {
        Ok(Self::Hypercube(HypercubePartition::new(
            cell_partition,
            hypercube_dimensions,
            hashed_columns,
            mapped_hc_dimensions,
        )?))
    }

    pub fn from_json(json: &str) -> ExchangeResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| tracked_bad_request(&format!("invalid partition function: {err}")))
    }

    pub fn to_json(&self) -> ExchangeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Broadcast(_) => "broadcast",
            Self::RoundRobin(_) => "round_robin",
            Self::WorkerId(_) => "worker_id",
            Self::Hash(_) => "hash",
            Self::Hypercube(_) => "hypercube",
        }
    }

    /// The bound destination count, if any.
    pub fn destinations_bound(&self) -> Option<usize> {
        match self {
            Self::Single(_) => Some(1),
            Self::Broadcast(pf) => pf.num_destinations,
            Self::RoundRobin(pf) => pf.num_destinations,
            Self::WorkerId(pf) => pf.num_destinations,
            Self::Hash(pf) => pf.num_destinations,
            Self::Hypercube(pf) => Some(pf.num_destinations()),
        }
    }

    /// Number of destinations. Fails if it was never bound.
    pub fn num_destinations(&self) -> ExchangeResult<usize> {
        self.destinations_bound().ok_or_else(|| {
            ExchangeError::Internal(format!(
                "{} partition function used before its destinations were set",
                self.kind()
            ))
        })
    }

    /// Bind the destination count. Must be at least 1.
    ///
    /// A single partition only ever has one destination and a
    /// hypercube's count comes from its cell table, so those accept
    /// only the count they already have.
    pub fn set_num_destinations(&mut self, num_destinations: usize) -> ExchangeResult<()> {
        let num_destinations = check_num_destinations(num_destinations)?;
        match self {
            Self::Broadcast(pf) => pf.num_destinations = Some(num_destinations),
            Self::RoundRobin(pf) => pf.num_destinations = Some(num_destinations),
            Self::WorkerId(pf) => pf.num_destinations = Some(num_destinations),
            Self::Hash(pf) => pf.num_destinations = Some(num_destinations),
            Self::Single(_) | Self::Hypercube(_) => {
                let fixed = self.num_destinations()?;
                if fixed != num_destinations {
                    return Err(tracked_bad_request(&format!(
                        "{} partition function has exactly {fixed} destinations, not {num_destinations}",
                        self.kind()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Destinations of `row` in `batch`. Every index returned is in
    /// `0..num_destinations()` and there is at least one.
    pub fn distribute<'a>(&'a self, batch: &TupleBatch, row: usize) -> ExchangeResult<Destinations<'a>> {
        let dests = match self {
            Self::Single(_) => Destinations::One(0),
            Self::Broadcast(_) => Destinations::All(self.num_destinations()?),
            Self::RoundRobin(pf) => Destinations::One(pf.partition(row)?),
            Self::WorkerId(pf) => Destinations::One(pf.partition(batch, row)?),
            Self::Hash(pf) => Destinations::One(pf.partition(batch, row)?),
            Self::Hypercube(pf) => Destinations::Cell(pf.partition(batch, row)?),
        };
        Ok(dests)
    }
}

#[track_caller]
pub(crate) fn check_num_destinations(num_destinations: usize) -> ExchangeResult<usize> {
    if num_destinations == 0 {
        return Err(tracked_bad_request("numDestinations must be > 0"));
    }
    Ok(num_destinations)
}

/// Validate an optional destination count coming from JSON.
#[track_caller]
pub(crate) fn check_raw_num_destinations(raw: Option<i64>) -> ExchangeResult<Option<usize>> {
    raw.map(|n| {
        let n = usize::try_from(n)
            .map_err(|_| tracked_bad_request(&format!("numDestinations must be > 0, got {n}")))?;
        check_num_destinations(n)
    })
    .transpose()
}

/// Validate a column index coming from JSON.
#[track_caller]
pub(crate) fn check_raw_index(what: &str, raw: i64) -> ExchangeResult<usize> {
    usize::try_from(raw)
        .map_err(|_| tracked_bad_request(&format!("{what} cannot take negative value {raw}")))
}

pub(crate) fn bound(num_destinations: Option<usize>, kind: &str) -> ExchangeResult<usize> {
    num_destinations.ok_or_else(|| {
        ExchangeError::Internal(format!(
            "{kind} partition function used before its destinations were set"
        ))
    })
}
