//! Flash driver seam and the sector layout used by the configuration store.
//!
//! Flash characteristics assumed by [`FlashDriver`] users:
//!
//! - erase works on whole sectors of [`SECTOR_SIZE`] bytes and sets every byte to `0xFF`
//! - programming can only clear bits (1 -> 0); a region must be erased before it is rewritten
//! - every call blocks until it completes; a failure is a hardware fault

use thiserror::Error;

pub const SECTOR_SIZE: u32 = 4096;

/// Default base sector of the configuration regions.
pub const CFG_LOCATION: u32 = 0x3C;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("flash access out of range: offset {offset:#x}, len {len}")]
    OutOfRange { offset: u32, len: usize },

    #[error("power lost during flash operation")]
    PowerLoss,

    #[error("flash image io failed: {0}")]
    Io(String),

    #[error("flash driver returned error code {0}")]
    Driver(i32),
}

pub trait FlashDriver {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl<F: FlashDriver + ?Sized> FlashDriver for &mut F {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        (**self).erase_sector(sector)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(offset, data)
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Pointer flag value that selects this slot.
    pub fn flag(self) -> u32 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn from_flag(flag: u32) -> Self {
        if flag == 0 {
            Self::A
        } else {
            Self::B
        }
    }
}

/// Sector addresses of the two data slots and the pointer region.
///
/// ```text
/// base + 0   slot A
/// base + 1   slot B
/// base + 2   (unused)
/// base + 3   pointer
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashLayout {
    pub base_sector: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            base_sector: CFG_LOCATION,
        }
    }
}

impl FlashLayout {
    pub const SPAN_SECTORS: u32 = 4;

    pub fn new(base_sector: u32) -> Self {
        Self { base_sector }
    }

    pub fn slot_sector(&self, slot: Slot) -> u32 {
        match slot {
            Slot::A => self.base_sector,
            Slot::B => self.base_sector.saturating_add(1),
        }
    }

    pub fn pointer_sector(&self) -> u32 {
        self.base_sector.saturating_add(3)
    }

    /// First sector past the configuration regions.
    pub fn end_sector(&self) -> u32 {
        self.base_sector.saturating_add(Self::SPAN_SECTORS)
    }

    /// Whether every byte of the four sectors has a 32-bit flash address.
    pub fn is_addressable(&self) -> bool {
        self.base_sector
            .checked_add(Self::SPAN_SECTORS)
            .and_then(|end| end.checked_mul(SECTOR_SIZE))
            .is_some()
    }

    pub fn offset(sector: u32) -> Result<u32, FlashError> {
        sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(FlashError::OutOfRange {
                offset: u32::MAX,
                len: SECTOR_SIZE as usize,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase { sector: u32 },
    Write { offset: u32, len: usize },
}

/// In-memory flash with NOR semantics.
///
/// Supports power-loss injection: after [`MemFlash::fail_after`] the n+1-th mutating
/// operation is torn halfway and every later call fails until power is restored.
#[derive(Debug, Clone)]
pub struct MemFlash {
    storage: Vec<u8>,
    erase_counts: Vec<u32>,
    ops: Vec<FlashOp>,
    ops_until_power_loss: Option<usize>,
    powered: bool,
}

impl MemFlash {
    pub fn new(sectors: u32) -> Self {
        Self {
            storage: vec![0xFF; sectors as usize * SECTOR_SIZE as usize],
            erase_counts: vec![0; sectors as usize],
            ops: Vec::new(),
            ops_until_power_loss: None,
            powered: true,
        }
    }

    /// Flash just large enough to hold `layout`.
    pub fn for_layout(layout: FlashLayout) -> Self {
        Self::new(layout.end_sector())
    }

    /// Wraps an existing image. The length is rounded up to whole erased sectors.
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let sector = SECTOR_SIZE as usize;
        let sectors = image.len().div_ceil(sector);
        image.resize(sectors * sector, 0xFF);

        Self {
            storage: image,
            erase_counts: vec![0; sectors],
            ops: Vec::new(),
            ops_until_power_loss: None,
            powered: true,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.storage
    }

    pub fn contents(&self, offset: u32, len: usize) -> &[u8] {
        &self.storage[offset as usize..offset as usize + len]
    }

    pub fn erase_count(&self, sector: u32) -> u32 {
        self.erase_counts[sector as usize]
    }

    /// Mutating operations performed so far, oldest first.
    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Lets `ops` more erase/write calls succeed, then tears the next one.
    pub fn fail_after(&mut self, ops: usize) {
        self.ops_until_power_loss = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.ops_until_power_loss = None;
        self.powered = true;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.storage.len())
            .ok_or(FlashError::OutOfRange { offset, len })?;
        Ok(start..end)
    }

    // Returns true when this operation is the one that loses power.
    fn consume_budget(&mut self) -> Result<bool, FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }

        match self.ops_until_power_loss {
            Some(0) => {
                self.powered = false;
                Ok(true)
            }
            Some(ref mut left) => {
                *left -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

impl FlashDriver for MemFlash {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let range = self.check_range(FlashLayout::offset(sector)?, SECTOR_SIZE as usize)?;
        let torn = self.consume_budget()?;

        let end = if torn {
            range.start + range.len() / 2
        } else {
            range.end
        };
        self.storage[range.start..end].fill(0xFF);
        self.erase_counts[sector as usize] += 1;
        self.ops.push(FlashOp::Erase { sector });

        if torn {
            return Err(FlashError::PowerLoss);
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.check_range(offset, data.len())?;
        let torn = self.consume_budget()?;

        let len = if torn { data.len() / 2 } else { data.len() };
        for (cell, byte) in self.storage[range.start..range.start + len]
            .iter_mut()
            .zip(data)
        {
            *cell &= *byte;
        }
        self.ops.push(FlashOp::Write {
            offset,
            len: data.len(),
        });

        if torn {
            return Err(FlashError::PowerLoss);
        }
        Ok(())
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if !self.powered {
            return Err(FlashError::PowerLoss);
        }
        let range = self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.storage[range]);
        Ok(())
    }
}
