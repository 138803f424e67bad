// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coalescing;
pub mod errors;
pub mod eviction;
pub mod monitor;
pub mod utils;

pub use utils::*;
