//! Seeded value hashing shared by the hash-based partition functions.
//!
//! There is one process-wide pool of independent hash functions. A
//! seed index picks a member of the pool, so callers that need several
//! unrelated hashes of the same key (a "hash family") just walk the
//! pool.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int32Type, Int64Type, TimeUnit, TimestampMicrosecondType,
    TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
};
use xxhash_rust::xxh3::Xxh3;

use crate::batch::TupleBatch;
use crate::errors::{tracked_bad_request, ExchangeError, ExchangeResult};

/// Fed in place of a null value.
const NULL_TAG: u8 = 0xff;

/// One member of the hash pool: a seeded 128-bit XXH3.
#[derive(Debug)]
pub struct HashFunction {
    seed: u64,
}

impl HashFunction {
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn hasher(&self) -> Xxh3 {
        Xxh3::with_seed(self.seed)
    }
}

pub const NUM_HASH_FUNCTIONS: usize = 27;

/// The pool. Seeds are distinct primes.
pub static HASH_FUNCTIONS: [HashFunction; NUM_HASH_FUNCTIONS] = [
    HashFunction::new(243),
    HashFunction::new(402653189),
    HashFunction::new(24593),
    HashFunction::new(786433),
    HashFunction::new(3145739),
    HashFunction::new(12289),
    HashFunction::new(49157),
    HashFunction::new(6151),
    HashFunction::new(98317),
    HashFunction::new(1572869),
    HashFunction::new(53),
    HashFunction::new(97),
    HashFunction::new(193),
    HashFunction::new(389),
    HashFunction::new(769),
    HashFunction::new(1543),
    HashFunction::new(3079),
    HashFunction::new(196613),
    HashFunction::new(393241),
    HashFunction::new(6291469),
    HashFunction::new(12582917),
    HashFunction::new(25165843),
    HashFunction::new(50331653),
    HashFunction::new(100663319),
    HashFunction::new(201326611),
    HashFunction::new(805306457),
    HashFunction::new(1610612741),
];

/// Pool member for a seed index. Indexes wrap around the pool.
pub fn hash_function(seed_index: usize) -> &'static HashFunction {
    &HASH_FUNCTIONS[seed_index % NUM_HASH_FUNCTIONS]
}

fn finish(hasher: &Xxh3) -> i32 {
    // Keep the low 32 bits of the digest.
    hasher.digest128() as u32 as i32
}

fn add_value(
    hasher: &mut Xxh3,
    batch: &TupleBatch,
    column: usize,
    row: usize,
) -> ExchangeResult<()> {
    let array = batch.column(column)?;
    if array.is_null(row) {
        hasher.update(&[NULL_TAG]);
        return Ok(());
    }
    match array.data_type() {
        DataType::Boolean => hasher.update(&[u8::from(array.as_boolean().value(row))]),
        DataType::Int32 => hasher.update(&array.as_primitive::<Int32Type>().value(row).to_le_bytes()),
        DataType::Int64 => hasher.update(&array.as_primitive::<Int64Type>().value(row).to_le_bytes()),
        DataType::Float32 => hasher.update(
            &array
                .as_primitive::<Float32Type>()
                .value(row)
                .to_bits()
                .to_le_bytes(),
        ),
        DataType::Float64 => hasher.update(
            &array
                .as_primitive::<Float64Type>()
                .value(row)
                .to_bits()
                .to_le_bytes(),
        ),
        DataType::Utf8 => hasher.update(array.as_string::<i32>().value(row).as_bytes()),
        DataType::LargeUtf8 => hasher.update(array.as_string::<i64>().value(row).as_bytes()),
        DataType::Timestamp(unit, _) => {
            let ts = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
                TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(row),
                TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(row),
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
            };
            hasher.update(&ts.to_le_bytes());
        }
        other => {
            return Err(ExchangeError::UnsupportedHashType {
                column,
                data_type: other.clone(),
            })
        }
    }
    Ok(())
}

/// Hash one cell with the pool member at `seed_index`.
pub fn hash_value(
    batch: &TupleBatch,
    column: usize,
    row: usize,
    seed_index: usize,
) -> ExchangeResult<i32> {
    let mut hasher = hash_function(seed_index).hasher();
    add_value(&mut hasher, batch, column, row)?;
    Ok(finish(&hasher))
}

/// Hash several cells of a row as one key.
///
/// Columns are folded in the order given, so `[0, 1]` and `[1, 0]`
/// are different keys.
pub fn hash_sub_row(
    batch: &TupleBatch,
    columns: &[usize],
    row: usize,
    seed_index: usize,
) -> ExchangeResult<i32> {
    let mut hasher = hash_function(seed_index).hasher();
    for &column in columns {
        add_value(&mut hasher, batch, column, row)?;
    }
    Ok(finish(&hasher))
}

/// Hash a whole row with the first pool member.
pub fn hash_row(batch: &TupleBatch, row: usize) -> ExchangeResult<i32> {
    let columns: Vec<usize> = (0..batch.num_columns()).collect();
    hash_sub_row(batch, &columns, row, 0)
}

fn check_family_size(count: usize) -> ExchangeResult<()> {
    if count > NUM_HASH_FUNCTIONS {
        return Err(tracked_bad_request(&format!(
            "requested {count} hashes but only {NUM_HASH_FUNCTIONS} hash functions exist"
        )));
    }
    Ok(())
}

/// `count` independent hashes of one cell. Member `i` is
/// `hash_value(.., i)`.
pub fn hash_value_family(
    batch: &TupleBatch,
    column: usize,
    row: usize,
    count: usize,
) -> ExchangeResult<Vec<i32>> {
    check_family_size(count)?;
    (0..count)
        .map(|seed_index| hash_value(batch, column, row, seed_index))
        .collect()
}

/// `count` independent hashes of a sub-row. Member `i` is
/// `hash_sub_row(.., i)`.
pub fn hash_sub_row_family(
    batch: &TupleBatch,
    columns: &[usize],
    row: usize,
    count: usize,
) -> ExchangeResult<Vec<i32>> {
    check_family_size(count)?;
    (0..count)
        .map(|seed_index| hash_sub_row(batch, columns, row, seed_index))
        .collect()
}
