//! The single active fragmentation session: owns the FEC codec, the
//! directly-received bitmap, and the loss counters the status query reports.

use crate::block_device::Storage;
use crate::fec::{FecCodec, MAX_FRAGMENTS};
use crate::status::Status;

/// Result of feeding one fragment into the session.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragOutcome {
    /// Accepted; session still incomplete.
    Ok,
    /// Accepted; this fragment completed the payload.
    Complete,
    /// A duplicate or otherwise inert fragment; no state changed.
    Ignored,
}

pub struct SessionStatus {
    pub received_count: usize,
    pub lost_count: usize,
    pub missing_first_index: Option<usize>,
    pub out_of_memory: bool,
}

pub struct FragSession {
    codec: FecCodec,
    nb_frag: usize,
    frag_size: usize,
    padding: usize,
    mc_group_bitmask: u8,
    highest_index_seen: usize,
    out_of_memory: bool,
}

impl FragSession {
    pub fn setup(
        nb_frag: u16,
        frag_size: u8,
        padding: u8,
        mc_group_bitmask: u8,
        flash_offset: u32,
    ) -> Result<Self, Status> {
        let nb_frag = nb_frag as usize;
        let frag_size = frag_size as usize;
        let padding = padding as usize;
        if nb_frag == 0 || frag_size == 0 || padding >= frag_size {
            return Err(Status::ParameterError);
        }
        if nb_frag > MAX_FRAGMENTS {
            return Err(Status::OutOfMemory);
        }
        let codec = FecCodec::new(nb_frag, frag_size, flash_offset)?;
        Ok(Self {
            codec,
            nb_frag,
            frag_size,
            padding,
            mc_group_bitmask,
            highest_index_seen: 0,
            out_of_memory: false,
        })
    }

    pub fn nb_frag(&self) -> usize {
        self.nb_frag
    }

    /// Size in bytes of the assembled, unpadded payload.
    pub fn payload_size(&self) -> usize {
        self.nb_frag * self.frag_size - self.padding
    }

    pub fn accepts_address(&self, mc_group_bit: Option<u8>) -> bool {
        match mc_group_bit {
            None => true,
            Some(bit) => self.mc_group_bitmask & (1 << bit) != 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.codec.is_complete()
    }

    pub fn process_fragment<S: Storage>(
        &mut self,
        storage: &mut S,
        index1: usize,
        payload: &[u8],
    ) -> Result<FragOutcome, Status> {
        if index1 > self.highest_index_seen {
            self.highest_index_seen = index1;
        }

        let was_received = index1 >= 1 && index1 <= self.nb_frag && self.codec.has_data(index1);

        let complete = if index1 >= 1 && index1 <= self.nb_frag {
            self.codec.process_data_row(storage, index1, payload)?
        } else {
            let redundancy_index = (index1 - self.nb_frag) as u16;
            self.codec
                .process_redundancy_row(storage, redundancy_index, payload)?
        };

        if was_received {
            return Ok(FragOutcome::Ignored);
        }
        Ok(if complete {
            FragOutcome::Complete
        } else {
            FragOutcome::Ok
        })
    }

    pub fn status(&self) -> SessionStatus {
        let received_count = self.codec.received_count();
        let lost_count = self.highest_index_seen.saturating_sub(received_count);
        let missing_first_index = (1..=self.nb_frag).find(|&i| !self.codec.has_data(i));
        SessionStatus {
            received_count,
            lost_count,
            missing_first_index,
            out_of_memory: self.out_of_memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::BlockDevice;
    use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

    const PAGE: usize = 16;

    struct MemDevice {
        data: [u8; 4096],
    }

    #[derive(Debug)]
    struct MemError;
    impl NorFlashError for MemError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }
    impl ErrorType for MemDevice {
        type Error = MemError;
    }
    impl ReadNorFlash for MemDevice {
        const READ_SIZE: usize = 1;
        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
            Ok(())
        }
        fn capacity(&self) -> usize {
            self.data.len()
        }
    }
    impl NorFlash for MemDevice {
        const WRITE_SIZE: usize = PAGE;
        const ERASE_SIZE: usize = PAGE;
        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            for b in &mut self.data[from as usize..to as usize] {
                *b = 0;
            }
            Ok(())
        }
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn status_tracks_loss_across_sparse_indices() {
        let mut bd: BlockDevice<MemDevice, PAGE> = BlockDevice::new(MemDevice { data: [0u8; 4096] });
        let mut session = FragSession::setup(5, 8, 0, 0, 0).unwrap();

        for i in [2usize, 3, 5] {
            session
                .process_fragment(&mut bd, i, &[i as u8; 8])
                .unwrap();
        }

        let status = session.status();
        assert_eq!(status.received_count, 3);
        assert_eq!(status.lost_count, 2);
        assert_eq!(status.missing_first_index, Some(1));
    }

    #[test]
    fn duplicate_fragment_reports_ignored() {
        let mut bd: BlockDevice<MemDevice, PAGE> = BlockDevice::new(MemDevice { data: [0u8; 4096] });
        let mut session = FragSession::setup(2, 4, 0, 0, 0).unwrap();

        let first = session.process_fragment(&mut bd, 1, &[1, 1, 1, 1]).unwrap();
        assert_eq!(first, FragOutcome::Ok);
        let second = session.process_fragment(&mut bd, 1, &[1, 1, 1, 1]).unwrap();
        assert_eq!(second, FragOutcome::Ignored);
    }

    #[test]
    fn address_filter_respects_group_bitmask() {
        let session = FragSession::setup(2, 4, 0, 0b0010, 0).unwrap();
        assert!(session.accepts_address(None));
        assert!(session.accepts_address(Some(1)));
        assert!(!session.accepts_address(Some(0)));
    }
}
