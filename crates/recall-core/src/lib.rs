pub mod clock;
pub mod config;
pub mod error;
pub mod next_run;
pub mod queue;
pub mod schedule;
pub mod store;
