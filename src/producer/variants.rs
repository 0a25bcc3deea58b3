//! The shapes a producer comes in. Each is the same machinery bound to
//! a different channel topology and partition function.

use super::{Producer, ProducerKind};
use crate::channel::{ExchangePairId, WorkerId};
use crate::errors::{tracked_bad_request, ExchangeResult};
use crate::operator::Operator;
use crate::partition::PartitionFunction;

impl Producer {
    /// Shuffle to every operator on every worker. Channel `i` is
    /// destination `i` of `pf`. An unbound `pf` is bound to the
    /// number of channels; a bound one must match it exactly.
    pub fn generic_shuffle(
        child: Box<dyn Operator>,
        operator_ids: Vec<ExchangePairId>,
        workers: Vec<WorkerId>,
        mut pf: PartitionFunction,
    ) -> ExchangeResult<Self> {
        if pf.destinations_bound().is_none() {
            pf.set_num_destinations(operator_ids.len() * workers.len())?;
        }
        Self::new(
            ProducerKind::GenericShuffle,
            child,
            operator_ids,
            workers,
            Some(pf),
        )
    }

    /// Send everything to one operator on one worker.
    pub fn collect(
        child: Box<dyn Operator>,
        operator_id: ExchangePairId,
        worker: WorkerId,
    ) -> ExchangeResult<Self> {
        Self::new(
            ProducerKind::Collect,
            child,
            vec![operator_id],
            vec![worker],
            Some(PartitionFunction::single()),
        )
    }

    /// Hand every batch to several operators on this worker. Never
    /// keeps a backup buffer.
    pub fn local_multiway(
        child: Box<dyn Operator>,
        operator_ids: Vec<ExchangePairId>,
    ) -> ExchangeResult<Self> {
        let pf = PartitionFunction::broadcast(Some(operator_ids.len().max(1)))?;
        Self::new(
            ProducerKind::LocalMultiway,
            child,
            operator_ids,
            vec![WorkerId::SELF],
            Some(pf),
        )
    }

    /// Send every row to the same operator on every worker.
    pub fn broadcast(
        child: Box<dyn Operator>,
        operator_id: ExchangePairId,
        workers: Vec<WorkerId>,
    ) -> ExchangeResult<Self> {
        let pf = PartitionFunction::broadcast(Some(workers.len().max(1)))?;
        Self::new(
            ProducerKind::Broadcast,
            child,
            vec![operator_id],
            workers,
            Some(pf),
        )
    }

    /// Carries no data, only the end of iteration and end of stream
    /// signals of its child.
    pub fn eos_controller(
        child: Box<dyn Operator>,
        operator_ids: Vec<ExchangePairId>,
        workers: Vec<WorkerId>,
    ) -> ExchangeResult<Self> {
        Self::new(
            ProducerKind::EosController,
            child,
            operator_ids,
            workers,
            None,
        )
    }

    /// Shuffle with `pf` to as many workers as it has destinations,
    /// drawn at random from `alive_workers`.
    pub fn hyper_shuffle(
        child: Box<dyn Operator>,
        operator_id: ExchangePairId,
        alive_workers: &[WorkerId],
        pf: PartitionFunction,
    ) -> ExchangeResult<Self> {
        Self::hyper_shuffle_with_rng(child, operator_id, alive_workers, pf, &mut fastrand::Rng::new())
    }

    pub fn hyper_shuffle_with_rng(
        child: Box<dyn Operator>,
        operator_id: ExchangePairId,
        alive_workers: &[WorkerId],
        pf: PartitionFunction,
        rng: &mut fastrand::Rng,
    ) -> ExchangeResult<Self> {
        let wanted = pf.num_destinations()?;
        let mut candidates = alive_workers.to_vec();
        candidates.sort_unstable();
        candidates.dedup();
        if candidates.len() < wanted {
            return Err(tracked_bad_request(&format!(
                "{} partition function needs {wanted} workers but only {} are alive",
                pf.kind(),
                candidates.len()
            )));
        }
        rng.shuffle(&mut candidates);
        candidates.truncate(wanted);
        tracing::debug!("hyper shuffle picked workers {candidates:?}");
        Self::new(
            ProducerKind::HyperShuffle,
            child,
            vec![operator_id],
            candidates,
            Some(pf),
        )
    }
}
