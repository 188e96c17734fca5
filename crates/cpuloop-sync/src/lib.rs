//! Synchronization primitives shared by the vCPU scheduler and the virtual clock.

mod bql;
mod seqcount;

pub use bql::{assert_bql_held, bql_locked, Bql, BqlGuard};
pub use parking_lot::Condvar;
pub use seqcount::{yield_point, SeqCount};
