//! Redundant two-slot configuration store.
//!
//! A commit writes the record into the slot that is *not* active, and only then rewrites the
//! pointer region to select it. Losing power before the pointer erase leaves the previous
//! record active; losing power inside the pointer erase/program is the one window this scheme
//! does not cover.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::SysConfig,
    flash::{FlashDriver, FlashError, FlashLayout, Slot},
    record::{SaveFlag, RECORD_SIZE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    Idle,
    DataSlotWriting,
    PointerWriting,
}

impl fmt::Display for SaveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::DataSlotWriting => "writing data slot",
            Self::PointerWriting => "writing slot pointer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Pointer,
    Data(Slot),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pointer => f.write_str("slot pointer"),
            Self::Data(Slot::A) => f.write_str("slot A"),
            Self::Data(Slot::B) => f.write_str("slot B"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed reading {region}")]
    Read {
        region: Region,
        #[source]
        source: FlashError,
    },

    #[error("save failed while {stage}")]
    Save {
        stage: SaveStage,
        #[source]
        source: FlashError,
    },
}

pub struct ConfigStore<F> {
    flash: F,
    layout: FlashLayout,
    chip_id: u32,
    save_flag: SaveFlag,
    stage: SaveStage,
}

impl<F: FlashDriver> ConfigStore<F> {
    pub fn new(flash: F, layout: FlashLayout, chip_id: u32) -> Self {
        Self {
            flash,
            layout,
            chip_id,
            save_flag: SaveFlag { flag: 0 },
            stage: SaveStage::Idle,
        }
    }

    pub fn layout(&self) -> FlashLayout {
        self.layout
    }

    pub fn chip_id(&self) -> u32 {
        self.chip_id
    }

    pub fn save_stage(&self) -> SaveStage {
        self.stage
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Reads the pointer region and reports which slot it selects.
    pub fn active_slot(&mut self) -> Result<Slot, StoreError> {
        let flag = self.read_pointer()?;
        Ok(Slot::from_flag(flag.flag))
    }

    /// Loads the active record, falling back to full factory defaults (and committing them)
    /// when the slot does not hold an initialized record.
    pub fn load(&mut self) -> Result<SysConfig, StoreError> {
        info!("loading configuration");
        self.load_or_else(SysConfig::factory)
    }

    /// Like [`ConfigStore::load`], but an uninitialized slot is replaced by the network,
    /// broker and application-topic defaults only. Identity fields come back empty.
    pub fn load_remote_profile(&mut self) -> Result<SysConfig, StoreError> {
        info!("loading configuration for remote update");
        self.load_or_else(|_| SysConfig::remote_profile())
    }

    pub fn save(&mut self, config: &SysConfig) -> Result<(), StoreError> {
        self.save_flag = self.read_pointer()?;
        let target = Slot::from_flag(self.save_flag.flag).other();
        debug!("committing configuration to {}", Region::Data(target));

        self.stage = SaveStage::DataSlotWriting;
        let sector = self.layout.slot_sector(target);
        self.write_sector(sector, &config.to_bytes())?;

        self.save_flag = SaveFlag {
            flag: target.flag(),
        };

        self.stage = SaveStage::PointerWriting;
        let sector = self.layout.pointer_sector();
        self.write_sector(sector, &self.save_flag.to_bytes())?;

        self.stage = SaveStage::Idle;
        Ok(())
    }

    fn load_or_else(
        &mut self,
        defaults: impl FnOnce(u32) -> SysConfig,
    ) -> Result<SysConfig, StoreError> {
        self.save_flag = self.read_pointer()?;
        let slot = Slot::from_flag(self.save_flag.flag);
        debug!("slot pointer selects {}", Region::Data(slot));

        let config = self.read_slot(slot)?;
        if config.is_initialized() {
            return Ok(config);
        }

        warn!(
            "{} holder {:#x} does not match, restoring defaults",
            Region::Data(slot),
            config.cfg_holder
        );
        let config = defaults(self.chip_id);
        info!("default configuration for {}", config.device_id);
        self.save(&config)?;
        Ok(config)
    }

    // Erase-then-program of one sector, failures tagged with the current save stage.
    fn write_sector(&mut self, sector: u32, data: &[u8]) -> Result<(), StoreError> {
        let offset = FlashLayout::offset(sector).map_err(|source| self.save_failed(source))?;
        self.flash
            .erase_sector(sector)
            .map_err(|source| self.save_failed(source))?;
        self.flash
            .write(offset, data)
            .map_err(|source| self.save_failed(source))
    }

    fn read_region(&mut self, region: Region, buf: &mut [u8]) -> Result<(), StoreError> {
        let sector = match region {
            Region::Pointer => self.layout.pointer_sector(),
            Region::Data(slot) => self.layout.slot_sector(slot),
        };
        FlashLayout::offset(sector)
            .and_then(|offset| self.flash.read(offset, buf))
            .map_err(|source| StoreError::Read { region, source })
    }

    fn read_pointer(&mut self) -> Result<SaveFlag, StoreError> {
        let mut buf = [0u8; SaveFlag::SIZE];
        self.read_region(Region::Pointer, &mut buf)?;
        Ok(SaveFlag::from_bytes(buf))
    }

    fn read_slot(&mut self, slot: Slot) -> Result<SysConfig, StoreError> {
        let mut buf = [0u8; RECORD_SIZE];
        self.read_region(Region::Data(slot), &mut buf)?;
        Ok(SysConfig::from_bytes(&buf))
    }

    fn save_failed(&self, source: FlashError) -> StoreError {
        StoreError::Save {
            stage: self.stage,
            source,
        }
    }
}
