//! Scrape event channel: tagged event union plus a broadcast bus.

pub mod bus;
pub mod types;

pub use bus::{EventBusError, ScrapeEventBus};
pub use types::ScrapeEvent;
