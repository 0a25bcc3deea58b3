use serde::{Deserialize, Serialize};

use super::{bound, check_num_destinations, check_raw_index, check_raw_num_destinations};
use crate::batch::TupleBatch;
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};

/// Destination count as it appears in JSON.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDestinations {
    #[serde(default)]
    num_destinations: Option<i64>,
}

fn check_optional(num_destinations: Option<usize>) -> ExchangeResult<Option<usize>> {
    num_destinations.map(check_num_destinations).transpose()
}

/// Routes every row to destination 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawDestinations")]
pub struct SinglePartition {
    num_destinations: usize,
}

impl Default for SinglePartition {
    fn default() -> Self {
        Self {
            num_destinations: 1,
        }
    }
}

impl TryFrom<RawDestinations> for SinglePartition {
    type Error = ExchangeError;

    fn try_from(raw: RawDestinations) -> ExchangeResult<Self> {
        match check_raw_num_destinations(raw.num_destinations)? {
            None | Some(1) => Ok(Self::default()),
            Some(n) => Err(tracked_bad_request(&format!(
                "single partition requires exactly 1 destination, got {n}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawDestinations")]
pub struct BroadcastPartition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) num_destinations: Option<usize>,
}

impl BroadcastPartition {
    pub fn new(num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self {
            num_destinations: check_optional(num_destinations)?,
        })
    }
}

impl TryFrom<RawDestinations> for BroadcastPartition {
    type Error = ExchangeError;

    fn try_from(raw: RawDestinations) -> ExchangeResult<Self> {
        Ok(Self {
            num_destinations: check_raw_num_destinations(raw.num_destinations)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawDestinations")]
pub struct RoundRobinPartition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) num_destinations: Option<usize>,
}

impl RoundRobinPartition {
    pub fn new(num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self {
            num_destinations: check_optional(num_destinations)?,
        })
    }

    /// Depends only on where the row sits in its batch.
    pub(super) fn partition(&self, row: usize) -> ExchangeResult<usize> {
        Ok(row % bound(self.num_destinations, "round robin")?)
    }
}

impl TryFrom<RawDestinations> for RoundRobinPartition {
    type Error = ExchangeError;

    fn try_from(raw: RawDestinations) -> ExchangeResult<Self> {
        Ok(Self {
            num_destinations: check_raw_num_destinations(raw.num_destinations)?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWorkerId {
    index: i64,
    #[serde(default)]
    num_destinations: Option<i64>,
}

/// Routes each row to the worker named in column `index`.
///
/// Worker ids in that column are 1-based, so worker `w` is
/// destination `w - 1`. A value of 0, a negative value, or one past
/// the last destination is rejected rather than clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawWorkerId")]
pub struct WorkerIdPartition {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) num_destinations: Option<usize>,
}

impl WorkerIdPartition {
    pub fn new(index: usize, num_destinations: Option<usize>) -> ExchangeResult<Self> {
        Ok(Self {
            index,
            num_destinations: check_optional(num_destinations)?,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(super) fn partition(&self, batch: &TupleBatch, row: usize) -> ExchangeResult<usize> {
        let num_destinations = bound(self.num_destinations, "worker id")?;
        let destination = batch.get_int(self.index, row)? - 1;
        usize::try_from(destination)
            .ok()
            .filter(|dest| *dest < num_destinations)
            .ok_or(ExchangeError::InvalidDestination {
                row,
                destination,
                num_destinations,
            })
    }
}

impl TryFrom<RawWorkerId> for WorkerIdPartition {
    type Error = ExchangeError;

    fn try_from(raw: RawWorkerId) -> ExchangeResult<Self> {
        Ok(Self {
            index: check_raw_index("worker id partition field index", raw.index)?,
            num_destinations: check_raw_num_destinations(raw.num_destinations)?,
        })
    }
}
