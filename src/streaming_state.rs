//! Per-channel backup buffers.
//!
//! Under REJOIN every batch sent to a channel is first recorded in
//! that channel's backup buffer so it can be replayed if the
//! destination worker comes back.

use std::collections::HashSet;
use std::fmt;
use std::hash::BuildHasherDefault;

use arrow::row::{OwnedRow, RowConverter, Rows, SortField};
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};

use crate::batch::TupleBatch;
use crate::errors::ExchangeResult;

/// Record of what has been sent on one channel.
pub trait StreamingState: Send + fmt::Debug {
    /// Record a batch about to be sent. Returns what should actually
    /// be sent, or `None` to withhold the batch entirely.
    fn update(&mut self, batch: TupleBatch) -> ExchangeResult<Option<TupleBatch>>;

    /// Tuples held for replay.
    fn num_tuples(&self) -> usize;

    /// Everything held for replay, oldest first.
    fn export(&self) -> Vec<TupleBatch>;

    fn clear(&mut self);
}

/// Which backup buffer a producer gives each of its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackupBufferConfig {
    /// Keep every batch.
    #[default]
    SimpleAppender,
    /// Keep and forward only rows never sent before on the channel.
    DupElim,
}

impl BackupBufferConfig {
    /// A fresh, empty buffer. Call once per channel.
    pub fn build(&self) -> Box<dyn StreamingState> {
        match self {
            Self::SimpleAppender => Box::<SimpleAppender>::default(),
            Self::DupElim => Box::<DupElim>::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimpleAppender {
    batches: Vec<TupleBatch>,
    num_tuples: usize,
}

impl StreamingState for SimpleAppender {
    fn update(&mut self, batch: TupleBatch) -> ExchangeResult<Option<TupleBatch>> {
        self.num_tuples += batch.num_tuples();
        self.batches.push(batch.clone());
        Ok(Some(batch))
    }

    fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    fn export(&self) -> Vec<TupleBatch> {
        self.batches.clone()
    }

    fn clear(&mut self) {
        self.batches.clear();
        self.num_tuples = 0;
    }
}

type RowSet = HashSet<OwnedRow, BuildHasherDefault<SeaHasher>>;

/// Remembers every distinct row sent on a channel.
#[derive(Default)]
pub struct DupElim {
    converter: Option<RowConverter>,
    seen: RowSet,
    batches: Vec<TupleBatch>,
    num_tuples: usize,
}

impl fmt::Debug for DupElim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DupElim")
            .field("distinct_rows", &self.seen.len())
            .field("num_batches", &self.batches.len())
            .field("num_tuples", &self.num_tuples)
            .finish()
    }
}

impl DupElim {
    /// Row-encode a batch. The encoding is fixed by the first batch
    /// seen, as the schema never changes on a channel.
    fn rows(&mut self, batch: &TupleBatch) -> ExchangeResult<Rows> {
        let converter = match &mut self.converter {
            Some(converter) => converter,
            None => {
                let fields = batch
                    .schema()
                    .fields()
                    .iter()
                    .map(|field| SortField::new(field.data_type().clone()))
                    .collect();
                self.converter.insert(RowConverter::new(fields)?)
            }
        };
        Ok(converter.convert_columns(batch.data().columns())?)
    }
}

impl StreamingState for DupElim {
    fn update(&mut self, batch: TupleBatch) -> ExchangeResult<Option<TupleBatch>> {
        if batch.is_eoi() || batch.is_empty() {
            return Ok(Some(batch));
        }
        let rows = self.rows(&batch)?;

        let mut fresh = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if self.seen.insert(row.owned()) {
                fresh.push(i as u32);
            }
        }
        if fresh.is_empty() {
            return Ok(None);
        }
        let kept = if fresh.len() == batch.num_tuples() {
            batch
        } else {
            batch.take(&fresh)?
        };
        self.num_tuples += kept.num_tuples();
        self.batches.push(kept.clone());
        Ok(Some(kept))
    }

    fn num_tuples(&self) -> usize {
        self.num_tuples
    }

    fn export(&self) -> Vec<TupleBatch> {
        self.batches.clone()
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.batches.clear();
        self.num_tuples = 0;
    }
}
