// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod background;
pub mod loaders;
pub mod preload;
pub mod utils;

pub use utils::*;
