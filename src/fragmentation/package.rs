//! Port 201 wire framing: fragmentation package command parser/encoder on
//! top of [`FragSession`].

use heapless::Vec as HVec;

use super::session::{FragOutcome, FragSession};
use crate::block_device::Storage;
use crate::status::Status;

pub const PORT: u8 = 201;
const PACKAGE_ID: u8 = 3;
const PACKAGE_VERSION: u8 = 1;

/// Longest reply this package ever produces.
const MAX_REPLY: usize = 8;
pub type Reply = HVec<u8, MAX_REPLY>;

fn reply(bytes: &[u8]) -> Reply {
    let mut v = Reply::new();
    let _ = v.extend_from_slice(bytes);
    v
}

pub struct FragmentationPackage {
    session: Option<FragSession>,
}

impl Default for FragmentationPackage {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentationPackage {
    pub const fn new() -> Self {
        Self { session: None }
    }

    pub fn session(&self) -> Option<&FragSession> {
        self.session.as_ref()
    }

    /// `mc_group_bit` identifies which multicast address (if any, vs.
    /// unicast) the frame arrived on, already resolved by the facade.
    pub fn handle<S: Storage>(
        &mut self,
        storage: &mut S,
        frag_storage_offset: u32,
        mc_group_bit: Option<u8>,
        frame: &[u8],
    ) -> Result<(Option<Reply>, Option<FragOutcome>), Status> {
        let &[cmd, ref rest @ ..] = frame else {
            return Err(Status::InvalidPacketLength);
        };

        match cmd {
            0x00 => Ok((Some(reply(&[0x00, PACKAGE_ID, PACKAGE_VERSION])), None)),
            0x02 => self.handle_setup(rest, frag_storage_offset).map(|r| (Some(r), None)),
            0x03 => Ok((Some(self.handle_delete(rest)?), None)),
            0x01 => Ok((Some(self.handle_status(rest)?), None)),
            0x08 => self.handle_data(storage, mc_group_bit, rest),
            _ => Err(Status::UnknownCommand),
        }
    }

    fn handle_setup(&mut self, rest: &[u8], frag_storage_offset: u32) -> Result<Reply, Status> {
        let &[flags, nb_frag_lo, nb_frag_hi, frag_size, padding, control, d0, d1, d2, d3] = rest
        else {
            return Err(Status::InvalidPacketLength);
        };
        let _ = (d0, d1, d2, d3);

        let frag_index = flags & 0b11;
        let mc_group_bitmask = (flags >> 2) & 0b1111;
        let nb_frag = u16::from_le_bytes([nb_frag_lo, nb_frag_hi]);
        let frag_algo = control & 0b111;

        let mut status_bits: u8 = frag_index;
        let mut ok = frag_index == 0;
        if frag_algo != 0 {
            status_bits |= 1 << 2; // encoding unsupported
            ok = false;
        }
        if frag_index != 0 {
            status_bits |= 1 << 4; // frag index unsupported
        }

        if ok {
            match FragSession::setup(nb_frag, frag_size, padding, mc_group_bitmask, frag_storage_offset) {
                Ok(session) => {
                    crate::log::debug!("frag: session set up, nb_frag={}, frag_size={}", nb_frag, frag_size);
                    self.session = Some(session);
                }
                Err(Status::OutOfMemory) => {
                    crate::log::log_warn!("frag: setup rejected, out of memory for nb_frag={}", nb_frag);
                    status_bits |= 1 << 3;
                }
                Err(Status::ParameterError) => status_bits |= 1 << 5, // wrong_descriptor-adjacent: malformed geometry
                Err(e) => return Err(e),
            }
        } else {
            crate::log::log_warn!("frag: setup rejected, status_bits={:#x}", status_bits);
        }

        Ok(reply(&[0x02, status_bits]))
    }

    fn handle_delete(&mut self, rest: &[u8]) -> Result<Reply, Status> {
        let &[index_byte] = rest else {
            return Err(Status::InvalidPacketLength);
        };
        let frag_index = index_byte & 0b11;
        let mut status_bits = frag_index;
        if self.session.is_none() {
            status_bits |= 1 << 2; // session does not exist
        } else {
            self.session = None;
        }
        Ok(reply(&[0x03, status_bits]))
    }

    fn handle_status(&mut self, rest: &[u8]) -> Result<Reply, Status> {
        let &[index_byte] = rest else {
            return Err(Status::InvalidPacketLength);
        };
        let frag_index = index_byte & 0b11;

        let Some(session) = &self.session else {
            return Ok(reply(&[0x01, frag_index, 0, 0, 0]));
        };
        let s = session.status();
        let status_bits = 0u8; // not-enough-memory bit reserved for future use
        Ok(reply(&[
            0x01,
            frag_index,
            s.received_count as u8,
            s.lost_count as u8,
            status_bits,
        ]))
    }

    fn handle_data<S: Storage>(
        &mut self,
        storage: &mut S,
        mc_group_bit: Option<u8>,
        rest: &[u8],
    ) -> Result<(Option<Reply>, Option<FragOutcome>), Status> {
        if rest.len() < 3 {
            return Err(Status::InvalidPacketLength);
        }
        let index1 = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let payload = &rest[2..];

        let Some(session) = &mut self.session else {
            return Err(Status::FragSessionNotActive);
        };
        if !session.accepts_address(mc_group_bit) {
            return Ok((None, None));
        }

        let outcome = session.process_fragment(storage, index1, payload)?;
        if outcome == FragOutcome::Complete {
            crate::log::debug!("frag: session complete at fragment index {}", index1);
        }
        Ok((None, Some(outcome)))
    }
}
