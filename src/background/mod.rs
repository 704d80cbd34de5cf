//! Background services - periodic heartbeat staleness sweep
//!
//! Runs as a tokio task that marks silent services down on a fixed interval.

pub mod sweeper;

pub use sweeper::TimeoutSweeper;
