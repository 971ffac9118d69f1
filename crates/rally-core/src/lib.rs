pub mod controller;
mod convert;
pub mod error;

pub use controller::{Coordinator, CreatedRequest, Resolved};
pub use error::CoreError;
