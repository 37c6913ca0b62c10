mod errors;
pub mod gc;
pub mod pathinfoservice;
pub mod pathlock;
pub mod profiles;
mod settings;
mod store;

pub use errors::Error;
pub use settings::{this_system, Settings, NIX_CONF, STATE_DIR};
pub use store::LocalStore;

#[cfg(test)]
mod tests;

// the rstest_reuse templates need it at the crate root.
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;
