mod errors;
pub mod hook;
pub mod machines;
pub mod remote_store;
pub mod scheduler;
pub mod slots;

pub use errors::Error;
