//! Hypercube join partitioning.
//!
//! The workers of a multi-way join form a grid with one axis per join
//! variable. Each hashed column of the input picks a coordinate along
//! its axis; the coordinates together name a cell, and a table maps
//! each cell to the workers that own it.

use serde::{Deserialize, Serialize};

use super::HashPartition;
use crate::batch::TupleBatch;
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHypercube {
    cell_partition: Vec<Vec<i64>>,
    hypercube_dimensions: Vec<i64>,
    hashed_columns: Vec<i64>,
    #[serde(rename = "mappedHCDimensions")]
    mapped_hc_dimensions: Vec<i64>,
    #[serde(default)]
    num_destinations: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawHypercube")]
pub struct HypercubePartition {
    num_destinations: usize,
    cell_partition: Vec<Vec<usize>>,
    hypercube_dimensions: Vec<usize>,
    hashed_columns: Vec<usize>,
    #[serde(rename = "mappedHCDimensions")]
    mapped_hc_dimensions: Vec<usize>,
    /// One per hashed column, in order.
    #[serde(skip)]
    dimension_functions: Vec<HashPartition>,
}

impl HypercubePartition {
    /// Build and validate.
    ///
    /// `cell_partition[c]` lists the destinations owning cell `c`,
    /// where cells are numbered row-major over the mapped dimensions
    /// in the order of `mapped_hc_dimensions`. Every destination must
    /// own exactly one cell and the destinations must be exactly
    /// `0..n`.
    pub fn new(
        cell_partition: Vec<Vec<usize>>,
        hypercube_dimensions: Vec<usize>,
        hashed_columns: Vec<usize>,
        mapped_hc_dimensions: Vec<usize>,
    ) -> ExchangeResult<Self> {
        if hashed_columns.is_empty() {
            return Err(tracked_bad_request(
                "hypercube partition requires at least 1 hashed column",
            ));
        }
        if hashed_columns.len() != mapped_hc_dimensions.len() {
            return Err(tracked_bad_request(&format!(
                "hashedColumns has {} entries but mappedHCDimensions has {}",
                hashed_columns.len(),
                mapped_hc_dimensions.len()
            )));
        }
        if let Some(dim) = hypercube_dimensions.iter().position(|size| *size == 0) {
            return Err(tracked_bad_request(&format!(
                "hypercube dimension {dim} has size 0"
            )));
        }

        let mut num_cells: usize = 1;
        let mut dimension_functions = Vec::with_capacity(hashed_columns.len());
        for (&column, &dim) in hashed_columns.iter().zip(&mapped_hc_dimensions) {
            let size = *hypercube_dimensions.get(dim).ok_or_else(|| {
                tracked_bad_request(&format!(
                    "mapped dimension {dim} out of range for {} hypercube dimensions",
                    hypercube_dimensions.len()
                ))
            })?;
            num_cells = num_cells
                .checked_mul(size)
                .ok_or_else(|| tracked_bad_request("hypercube has too many cells"))?;
            // Seeding by dimension keeps axes independent even when
            // two hash the same column.
            dimension_functions.push(HashPartition::new(Some(size), vec![column])?.with_seed_index(dim));
        }

        if cell_partition.len() != num_cells {
            return Err(tracked_bad_request(&format!(
                "invalid cell partition: {} cells given, hypercube has {num_cells}",
                cell_partition.len()
            )));
        }
        if let Some(cell) = cell_partition.iter().position(Vec::is_empty) {
            return Err(tracked_bad_request(&format!(
                "invalid cell partition: cell {cell} has no destination"
            )));
        }
        let mut flat: Vec<usize> = cell_partition.iter().flatten().copied().collect();
        flat.sort_unstable();
        if let Some((i, dest)) = flat.iter().enumerate().find(|(i, dest)| *i != **dest) {
            return Err(tracked_bad_request(&format!(
                "invalid cell partition: expected destination {i}, found {dest}"
            )));
        }

        Ok(Self {
            num_destinations: flat.len(),
            cell_partition,
            hypercube_dimensions,
            hashed_columns,
            mapped_hc_dimensions,
            dimension_functions,
        })
    }

    pub fn num_destinations(&self) -> usize {
        self.num_destinations
    }

    pub fn cell_partition(&self) -> &[Vec<usize>] {
        &self.cell_partition
    }

    /// Linear cell index of a row.
    fn cell(&self, batch: &TupleBatch, row: usize) -> ExchangeResult<usize> {
        let mut cell = 0;
        for (i, pf) in self.dimension_functions.iter().enumerate() {
            cell += pf.partition(batch, row)?;
            if let Some(next) = self.dimension_functions.get(i + 1) {
                cell *= next.num_destinations.unwrap_or(1);
            }
        }
        Ok(cell)
    }

    pub(super) fn partition(&self, batch: &TupleBatch, row: usize) -> ExchangeResult<&[usize]> {
        let cell = self.cell(batch, row)?;
        self.cell_partition
            .get(cell)
            .map(Vec::as_slice)
            .ok_or_else(|| ExchangeError::Internal(format!("row {row} hashed to missing cell {cell}")))
    }
}

fn to_usize(what: &str, raw: &[i64]) -> ExchangeResult<Vec<usize>> {
    raw.iter()
        .map(|v| {
            usize::try_from(*v)
                .map_err(|_| tracked_bad_request(&format!("{what} cannot hold negative value {v}")))
        })
        .collect()
}

impl TryFrom<RawHypercube> for HypercubePartition {
    type Error = ExchangeError;

    fn try_from(raw: RawHypercube) -> ExchangeResult<Self> {
        let cell_partition = raw
            .cell_partition
            .iter()
            .map(|cell| to_usize("cellPartition", cell))
            .collect::<ExchangeResult<Vec<_>>>()?;
        let pf = Self::new(
            cell_partition,
            to_usize("hypercubeDimensions", &raw.hypercube_dimensions)?,
            to_usize("hashedColumns", &raw.hashed_columns)?,
            to_usize("mappedHCDimensions", &raw.mapped_hc_dimensions)?,
        )?;
        if let Some(n) = raw.num_destinations {
            if n != pf.num_destinations as i64 {
                return Err(tracked_bad_request(&format!(
                    "numDestinations {n} does not match the {} destinations of the cell partition",
                    pf.num_destinations
                )));
            }
        }
        Ok(pf)
    }
}
