//! Columnar tuple batches flowing through producers.

use std::sync::Arc;

use arrow::array::{Array, Int32Array, Int64Array, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::errors::{ExchangeError, ExchangeResult};
use crate::partition::PartitionFunction;

/// An immutable, fixed-schema chunk of rows.
///
/// Either a normal data batch or an end-of-iteration marker. EOI
/// markers have zero rows and only carry the signal that one
/// iteration of an iterative query is complete.
///
/// Cloning is shallow: columns are shared.
#[derive(Debug, Clone)]
pub struct TupleBatch {
    data: RecordBatch,
    eoi: bool,
}

impl TupleBatch {
    pub fn new(data: RecordBatch) -> Self {
        Self { data, eoi: false }
    }

    /// The end-of-iteration marker for a schema.
    pub fn eoi(schema: SchemaRef) -> Self {
        Self {
            data: RecordBatch::new_empty(schema),
            eoi: true,
        }
    }

    pub fn is_eoi(&self) -> bool {
        self.eoi
    }

    pub fn num_tuples(&self) -> usize {
        self.data.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.data.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tuples() == 0
    }

    pub fn schema(&self) -> SchemaRef {
        self.data.schema()
    }

    pub fn data(&self) -> &RecordBatch {
        &self.data
    }

    pub fn into_data(self) -> RecordBatch {
        self.data
    }

    pub(crate) fn column(&self, column: usize) -> ExchangeResult<&Arc<dyn Array>> {
        if column >= self.num_columns() {
            return Err(ExchangeError::ColumnOutOfBounds {
                column,
                num_columns: self.num_columns(),
            });
        }
        Ok(self.data.column(column))
    }

    /// Read an integer cell. Works on INT and LONG columns.
    pub fn get_int(&self, column: usize, row: usize) -> ExchangeResult<i64> {
        let array = self.column(column)?;
        match array.data_type() {
            DataType::Int32 => array
                .as_any()
                .downcast_ref::<Int32Array>()
                .map(|arr| i64::from(arr.value(row))),
            DataType::Int64 => array
                .as_any()
                .downcast_ref::<Int64Array>()
                .map(|arr| arr.value(row)),
            _ => None,
        }
        .ok_or_else(|| {
            ExchangeError::Internal(format!(
                "column {column} of type {} is not an integer column",
                array.data_type()
            ))
        })
    }

    /// Copy the given rows, in order, into a new batch.
    pub fn take(&self, rows: &[u32]) -> ExchangeResult<Self> {
        let indices = UInt32Array::from(rows.to_vec());
        Ok(Self {
            data: take_record_batch(&self.data, &indices)?,
            eoi: self.eoi,
        })
    }

    /// Split this batch into one batch per destination of `pf`.
    ///
    /// A row is copied into every destination it is routed to, in
    /// row order. A destination that receives every row shares this
    /// batch's columns instead of copying them. An EOI marker is
    /// handed to every destination.
    pub fn partition(&self, pf: &PartitionFunction) -> ExchangeResult<Vec<TupleBatch>> {
        let num_destinations = pf.num_destinations()?;
        if self.eoi {
            return Ok(vec![self.clone(); num_destinations]);
        }

        let num_rows = self.num_tuples();
        let mut rows: Vec<Vec<u32>> = vec![Vec::new(); num_destinations];
        for row in 0..num_rows {
            let row_idx = u32::try_from(row)
                .map_err(|_| ExchangeError::Internal(format!("row {row} overflows u32")))?;
            for dest in pf.distribute(self, row)?.iter() {
                rows[dest].push(row_idx);
            }
        }

        rows.into_iter()
            .map(|dest_rows| {
                if dest_rows.len() == num_rows {
                    Ok(self.clone())
                } else {
                    self.take(&dest_rows)
                }
            })
            .collect()
    }
}

impl From<RecordBatch> for TupleBatch {
    fn from(data: RecordBatch) -> Self {
        Self::new(data)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::partition::PartitionFunction;

    #[test]
    fn eoi_marker_is_empty_and_flagged() {
        let tb = TupleBatch::eoi(int_schema(2));
        assert!(tb.is_eoi());
        assert_eq!(tb.num_tuples(), 0);
        assert_eq!(tb.num_columns(), 2);
    }

    #[test]
    fn round_robin_partition_keeps_row_order() {
        let tb = seq_batch(7);
        let pf = PartitionFunction::round_robin(Some(3)).unwrap();
        let parts = tb.partition(&pf).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(int_column(&parts[0], 0), vec![0, 3, 6]);
        assert_eq!(int_column(&parts[1], 0), vec![1, 4]);
        assert_eq!(int_column(&parts[2], 0), vec![2, 5]);
    }

    #[test]
    fn broadcast_partition_shares_columns() {
        let tb = seq_batch(4);
        let pf = PartitionFunction::broadcast(Some(3)).unwrap();
        let parts = tb.partition(&pf).unwrap();
        assert_eq!(parts.len(), 3);
        for part in &parts {
            assert!(Arc::ptr_eq(part.data().column(0), tb.data().column(0)));
        }
    }

    #[test]
    fn eoi_goes_to_every_destination() {
        let tb = TupleBatch::eoi(int_schema(1));
        let pf = PartitionFunction::hash(Some(4), vec![0]).unwrap();
        let parts = tb.partition(&pf).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(TupleBatch::is_eoi));
    }

    #[test]
    fn get_int_reads_int_and_long() {
        let tb = int_batch(vec![vec![5, 6]]);
        assert_eq!(tb.get_int(0, 1).unwrap(), 6);

        let tb = long_string_batch(&[(9, "a")]);
        assert_eq!(tb.get_int(0, 0).unwrap(), 9);
        assert!(tb.get_int(1, 0).is_err());
        assert!(matches!(
            tb.get_int(2, 0),
            Err(ExchangeError::ColumnOutOfBounds { column: 2, .. })
        ));
    }
}
