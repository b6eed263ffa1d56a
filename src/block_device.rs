//! Arbitrary-offset read/program on top of a page-erase/page-program NOR-ish
//! flash device.
//!
//! The underlying device (driver, chip-select wiring, etc) is a collaborator
//! reached through `embedded_storage`'s `ReadNorFlash`/`NorFlash` traits, the
//! same traits the rest of the corpus's bootloader code builds on. This
//! module only adds the bounce buffer needed to turn page-granular
//! erase+program into byte-addressable read/program, which is all the
//! fragmentation and verification code above it ever wants.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The requested read/program window falls (partially or fully) outside
    /// the device.
    OutOfRange,
    /// The underlying device driver reported an error.
    Device,
}

/// Byte-addressable read/program over a flash device whose native program
/// unit is `PAGE` bytes.
///
/// `PAGE` must equal both `D::WRITE_SIZE` and `D::ERASE_SIZE` for the device
/// in use — true of the uniform-page serial dataflash parts (e.g. the AT45
/// family) this adapter is modeled on.
pub struct BlockDevice<D, const PAGE: usize> {
    device: D,
}

impl<D, const PAGE: usize> BlockDevice<D, PAGE>
where
    D: NorFlash,
{
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn size(&self) -> u32 {
        self.device.capacity() as u32
    }

    pub const fn page_size(&self) -> u32 {
        PAGE as u32
    }

    fn check_range(&self, offset: u32, length: usize) -> Result<(), DeviceError> {
        let end = offset
            .checked_add(length as u32)
            .ok_or(DeviceError::OutOfRange)?;
        if end > self.size() {
            return Err(DeviceError::OutOfRange);
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read(&mut self, buf: &mut [u8], offset: u32) -> Result<(), DeviceError> {
        self.check_range(offset, buf.len())?;
        self.device
            .read(offset, buf)
            .map_err(|_| DeviceError::Device)
    }

    /// Program `src` at `offset`, performing a read-modify-write across
    /// whichever pages the window touches. Bytes outside `[offset, offset +
    /// src.len())` within a touched page are preserved.
    pub fn program(&mut self, src: &[u8], offset: u32) -> Result<(), DeviceError> {
        self.check_range(offset, src.len())?;

        let page = PAGE as u32;
        let mut page_start = (offset / page) * page;

        while page_start < offset + src.len() as u32 {
            let mut bounce = [0u8; PAGE];
            self.device
                .read(page_start, &mut bounce)
                .map_err(|_| DeviceError::Device)?;

            // Overlay the part of `src` that falls within this page.
            let page_end = page_start + page;
            let overlay_start = offset.max(page_start);
            let overlay_end = (offset + src.len() as u32).min(page_end);
            if overlay_start < overlay_end {
                let src_off = (overlay_start - offset) as usize;
                let src_len = (overlay_end - overlay_start) as usize;
                let bounce_off = (overlay_start - page_start) as usize;
                bounce[bounce_off..bounce_off + src_len]
                    .copy_from_slice(&src[src_off..src_off + src_len]);
            }

            self.device
                .erase(page_start, page_end)
                .map_err(|_| DeviceError::Device)?;
            self.device
                .write(page_start, &bounce)
                .map_err(|_| DeviceError::Device)?;

            page_start += page;
        }

        Ok(())
    }
}

/// Narrow read/program seam the fragmentation codec depends on, so it never
/// needs to know the concrete device type or page size of the adapter it's
/// handed.
pub trait Storage {
    fn read_bytes(&mut self, buf: &mut [u8], offset: u32) -> Result<(), DeviceError>;
    fn program_bytes(&mut self, src: &[u8], offset: u32) -> Result<(), DeviceError>;
}

impl<D, const PAGE: usize> Storage for BlockDevice<D, PAGE>
where
    D: NorFlash,
{
    fn read_bytes(&mut self, buf: &mut [u8], offset: u32) -> Result<(), DeviceError> {
        BlockDevice::read(self, buf, offset)
    }

    fn program_bytes(&mut self, src: &[u8], offset: u32) -> Result<(), DeviceError> {
        BlockDevice::program(self, src, offset)
    }
}
