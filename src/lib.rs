//! Keeps per-item stock counts consistent across independently running
//! contexts that share one sled store, without a central coordinator.

pub mod bus;
pub mod config;
pub mod debug;
pub mod error;
pub mod logging;
pub mod signal;
pub mod store;
pub mod sync;
pub mod types;
pub mod utils;
pub mod view;

pub use bus::{EventBus, Subscription};
pub use config::{BootstrapPolicy, SyncConfig};
pub use debug::DebugPanel;
pub use error::{ConfigError, SyncError, SyncResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use sync::{BootstrapOutcome, StateReader, StockSync, SyncPhase};
pub use types::{
    ContextId, ItemId, Revision, StockLevel, StockQuantity, StockState, TimeStamp, UpdateEvent,
    UpdateTarget,
};
pub use view::InventoryView;
