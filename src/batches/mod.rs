//! Batch runs: staged uploads that become visible only on completion.
//!
//! A producer starts a run, uploads prices in chunks, and completes it; the
//! staged prices are then published like ordinary updates. Runs that stop
//! receiving chunks are swept as abandoned.

mod repository;
mod run;

pub use repository::BatchRunRepository;
pub use run::BatchRun;
