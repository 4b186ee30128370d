/// Re-export `Config` from `recall-core` for use within this crate.
///
/// Environment parsing lives in `recall-core` so integration tests can build
/// a `Config` without pulling in the binary's wiring.
pub use recall_core::config::Config;
