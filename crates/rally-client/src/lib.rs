pub mod cache;

pub use cache::{ChatEntry, ClientStateCache, DeliveryState};
