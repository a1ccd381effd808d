//! Configuration surfaces: the settings file, the portal list CSV, and
//! batch profiles.

pub mod batch;
pub mod portals;
pub mod settings;

pub use batch::{BatchConfig, BatchMode, BatchProfileStore, IpSafetyConfig};
pub use portals::{Portal, append_portal, load_portals, normalize_portal_name, portal_by_name};
pub use settings::{AppSettings, DeltaMode, ExportPolicy, TimeoutSettings, WatchRule};
