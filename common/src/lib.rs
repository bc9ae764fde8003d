pub mod config;
pub mod flash;
pub mod record;
pub mod store;
pub mod topics;
pub mod types;
pub mod update;

pub use config::{AuthMode, SysConfig, CFG_HOLDER};
pub use flash::{FlashDriver, FlashError, FlashLayout, MemFlash, Slot, CFG_LOCATION, SECTOR_SIZE};
pub use record::{SaveFlag, RECORD_SIZE};
pub use store::{ConfigStore, SaveStage, StoreError};
pub use topics::*;
pub use types::{ChannelTopics, ConfigView, DiscoveryAnnouncement};
pub use update::{apply_fields, apply_update, Restart, UpdateReport, UpdateTokens};
