//! Worker pool: bounded queue, worker tasks and processing unit lifecycle.

mod queue;
mod unit;
mod worker;

pub use unit::{ExecutionMode, PooledUnit, ProcessingUnit, UnitFactory, UnitPool};
pub use worker::{PoolState, PoolStats, WorkerPool, WorkerPoolBuilder};
