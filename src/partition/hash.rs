use serde::{Deserialize, Serialize};

use super::{bound, check_num_destinations, check_raw_index, check_raw_num_destinations};
use crate::batch::TupleBatch;
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};
use crate::hashing::{hash_sub_row, NUM_HASH_FUNCTIONS};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHash {
    #[serde(default)]
    num_destinations: Option<i64>,
    indexes: Vec<i64>,
    #[serde(default)]
    seed_index: usize,
}

/// Hashes the columns `indexes` of a row, in that order, with pool
/// member `seed_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawHash")]
pub struct HashPartition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) num_destinations: Option<usize>,
    indexes: Vec<usize>,
    seed_index: usize,
}

impl HashPartition {
    pub fn new(num_destinations: Option<usize>, indexes: Vec<usize>) -> ExchangeResult<Self> {
        if indexes.is_empty() {
            return Err(tracked_bad_request(
                "hash function requires at least 1 field to hash",
            ));
        }
        Ok(Self {
            num_destinations: num_destinations.map(check_num_destinations).transpose()?,
            indexes,
            seed_index: 0,
        })
    }

    /// Pick a different member of the hash pool. Wraps around the
    /// pool size.
    pub fn with_seed_index(mut self, seed_index: usize) -> Self {
        self.seed_index = seed_index % NUM_HASH_FUNCTIONS;
        self
    }

    pub fn indexes(&self) -> &[usize] {
        &self.indexes
    }

    pub fn seed_index(&self) -> usize {
        self.seed_index
    }

    pub(super) fn partition(&self, batch: &TupleBatch, row: usize) -> ExchangeResult<usize> {
        let num_destinations = bound(self.num_destinations, "hash")?;
        let n = num_destinations as i64;
        let mut p = i64::from(hash_sub_row(batch, &self.indexes, row, self.seed_index)?) % n;
        if p < 0 {
            p += n;
        }
        // In range after normalization.
        Ok(p as usize)
    }
}

impl TryFrom<RawHash> for HashPartition {
    type Error = ExchangeError;

    fn try_from(raw: RawHash) -> ExchangeResult<Self> {
        let indexes = raw
            .indexes
            .iter()
            .enumerate()
            .map(|(i, index)| check_raw_index(&format!("hash function field index {i}"), *index))
            .collect::<ExchangeResult<Vec<_>>>()?;
        let pf = Self::new(None, indexes)?.with_seed_index(raw.seed_index);
        Ok(Self {
            num_destinations: check_raw_num_destinations(raw.num_destinations)?,
            ..pf
        })
    }
}
