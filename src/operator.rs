//! The pull interface between operators.

use std::collections::VecDeque;

use arrow::datatypes::SchemaRef;

use crate::batch::TupleBatch;
use crate::errors::ExchangeResult;

/// An operator a producer pulls from.
///
/// `next_ready` returns `None` when nothing is available right now.
/// That happens at end of stream, at end of an iteration, or just
/// because the operator is waiting on its own inputs.
pub trait Operator: Send {
    fn schema(&self) -> SchemaRef;

    fn next_ready(&mut self) -> ExchangeResult<Option<TupleBatch>>;

    /// No more data will ever come.
    fn eos(&self) -> bool;

    /// The current iteration is complete.
    fn eoi(&self) -> bool;

    /// Acknowledge (`false`) or raise (`true`) end of iteration.
    fn set_eoi(&mut self, eoi: bool);
}

#[derive(Debug, Clone)]
enum SourceItem {
    Batch(TupleBatch),
    EndOfIteration,
}

/// Replays a fixed sequence of batches, optionally split into
/// iterations, then reaches end of stream.
#[derive(Debug)]
pub struct BatchSource {
    schema: SchemaRef,
    items: VecDeque<SourceItem>,
    eos: bool,
    eoi: bool,
}

impl BatchSource {
    pub fn new(schema: SchemaRef, batches: impl IntoIterator<Item = TupleBatch>) -> Self {
        Self {
            schema,
            items: batches.into_iter().map(SourceItem::Batch).collect(),
            eos: false,
            eoi: false,
        }
    }

    /// Append the batches of another iteration, preceded by an end of
    /// iteration.
    pub fn then_iteration(mut self, batches: impl IntoIterator<Item = TupleBatch>) -> Self {
        self.items.push_back(SourceItem::EndOfIteration);
        self.items.extend(batches.into_iter().map(SourceItem::Batch));
        self
    }

    /// Close the last iteration with an end of iteration before end of
    /// stream.
    pub fn with_final_eoi(mut self) -> Self {
        self.items.push_back(SourceItem::EndOfIteration);
        self
    }
}

impl Operator for BatchSource {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn next_ready(&mut self) -> ExchangeResult<Option<TupleBatch>> {
        // Nothing flows until the consumer acknowledges the iteration.
        if self.eos || self.eoi {
            return Ok(None);
        }
        match self.items.pop_front() {
            Some(SourceItem::Batch(batch)) => Ok(Some(batch)),
            Some(SourceItem::EndOfIteration) => {
                self.eoi = true;
                Ok(None)
            }
            None => {
                self.eos = true;
                Ok(None)
            }
        }
    }

    fn eos(&self) -> bool {
        self.eos
    }

    fn eoi(&self) -> bool {
        self.eoi
    }

    fn set_eoi(&mut self, eoi: bool) {
        self.eoi = eoi;
    }
}
