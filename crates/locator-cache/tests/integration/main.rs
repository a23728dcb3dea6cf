// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod persistence;
pub mod resolver;
pub mod utils;

pub use utils::*;
