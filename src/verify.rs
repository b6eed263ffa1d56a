//! Firmware verification pipeline: runs once the fragmentation session
//! reports completion, over the assembled payload sitting on the block
//! device. Never retried — a failure here means the image is discarded and
//! the session must be set up again.

use crc::{Crc, CRC_64_ECMA_182};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

use crate::block_device::Storage;
use crate::client::Config;
use crate::status::Status;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const MANUFACTURER_UUID_LEN: usize = 16;
const DEVICE_CLASS_UUID_LEN: usize = 16;
const SIG_LEN_BYTE: usize = 1;
const MAX_SIGNATURE_LEN: usize = 72;
const TRAILER_LEN: usize = MANUFACTURER_UUID_LEN + DEVICE_CLASS_UUID_LEN + SIG_LEN_BYTE + MAX_SIGNATURE_LEN;

const BOOTLOADER_MAGIC: u32 = 0x4655_4f54; // "FUOT"
const BOOTLOADER_HEADER_VERSION: u32 = 1;
pub const EXTERNAL_HEADER_SIZE: usize = 4 + 4 + 8 + 8 + 32 + 16 + MAX_SIGNATURE_LEN;

const CHUNK: usize = 64;

#[derive(Debug)]
pub struct VerificationReport {
    pub crc64: u64,
    pub sha256: [u8; 32],
}

pub trait VerificationObserver {
    fn verification_starting(&mut self) {}
    fn verification_finished(&mut self) {}
}

/// Runs the full pipeline (CRC, SHA-256, UUID check, signature check,
/// bootloader header write) and returns the CRC for the uplink status
/// report, or `Status::VerificationFailed`/`Status::StorageError` on
/// failure. Nothing is written to the bootloader header region unless every
/// check passes.
pub fn run<S: Storage, O: VerificationObserver>(
    storage: &mut S,
    config: &Config,
    payload_size: usize,
    observer: &mut O,
) -> Result<VerificationReport, Status> {
    crate::log::debug!("verify: pipeline starting, payload_size={}", payload_size);
    observer.verification_starting();
    let result = run_inner(storage, config, payload_size);
    observer.verification_finished();
    match &result {
        Ok(_) => crate::log::debug!("verify: pipeline finished, image accepted"),
        Err(_status) => crate::log::log_warn!("verify: pipeline finished, image rejected"),
    }
    result
}

fn run_inner<S: Storage>(
    storage: &mut S,
    config: &Config,
    payload_size: usize,
) -> Result<VerificationReport, Status> {
    if payload_size <= TRAILER_LEN {
        return Err(Status::ParameterError);
    }
    let signed_len = payload_size - TRAILER_LEN;

    let crc64 = streaming_crc(storage, config.frag_storage_offset, payload_size)?;
    let sha256 = streaming_sha256(storage, config.frag_storage_offset, signed_len)?;

    let trailer_offset = config.frag_storage_offset + signed_len as u32;
    let mut trailer = [0u8; TRAILER_LEN];
    storage
        .read_bytes(&mut trailer, trailer_offset)
        .map_err(|_| Status::StorageError)?;

    let manufacturer_uuid = &trailer[0..16];
    let device_class_uuid = &trailer[16..32];
    if manufacturer_uuid != config.manufacturer_uuid || device_class_uuid != config.device_class_uuid {
        crate::log::log_warn!("verify: manufacturer/device-class uuid mismatch in trailer");
        return Err(Status::VerificationFailed);
    }

    let sig_len = trailer[32] as usize;
    if sig_len == 0 || sig_len > MAX_SIGNATURE_LEN {
        crate::log::log_warn!("verify: trailer signature length out of range");
        return Err(Status::VerificationFailed);
    }
    let signature_bytes = &trailer[33..33 + sig_len];
    let signature = Signature::from_der(signature_bytes).map_err(|_| {
        crate::log::log_warn!("verify: trailer signature is not valid DER");
        Status::VerificationFailed
    })?;

    config.ecdsa_public_key.verify(&sha256, &signature).map_err(|_| {
        crate::log::log_warn!("verify: ECDSA signature check failed");
        Status::VerificationFailed
    })?;

    write_bootloader_header(storage, config, payload_size as u64, &sha256)?;

    Ok(VerificationReport { crc64, sha256 })
}

fn streaming_crc<S: Storage>(storage: &mut S, offset: u32, len: usize) -> Result<u64, Status> {
    let mut digest = CRC64.digest();
    let mut remaining = len;
    let mut cursor = offset;
    let mut buf = [0u8; CHUNK];
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        storage
            .read_bytes(&mut buf[..n], cursor)
            .map_err(|_| Status::StorageError)?;
        digest.update(&buf[..n]);
        cursor += n as u32;
        remaining -= n;
    }
    Ok(digest.finalize())
}

fn streaming_sha256<S: Storage>(storage: &mut S, offset: u32, len: usize) -> Result<[u8; 32], Status> {
    let mut hasher = Sha256::new();
    let mut remaining = len;
    let mut cursor = offset;
    let mut buf = [0u8; CHUNK];
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        storage
            .read_bytes(&mut buf[..n], cursor)
            .map_err(|_| Status::StorageError)?;
        hasher.update(&buf[..n]);
        cursor += n as u32;
        remaining -= n;
    }
    Ok(hasher.finalize().into())
}

fn write_bootloader_header<S: Storage>(
    storage: &mut S,
    config: &Config,
    fw_size: u64,
    sha256: &[u8; 32],
) -> Result<(), Status> {
    let mut header = [0u8; EXTERNAL_HEADER_SIZE];
    let mut w = 0;
    header[w..w + 4].copy_from_slice(&BOOTLOADER_MAGIC.to_be_bytes());
    w += 4;
    header[w..w + 4].copy_from_slice(&BOOTLOADER_HEADER_VERSION.to_be_bytes());
    w += 4;
    header[w..w + 8].copy_from_slice(&0u64.to_be_bytes()); // fw_version: left to the bootloader
    w += 8;
    header[w..w + 8].copy_from_slice(&fw_size.to_be_bytes());
    w += 8;
    header[w..w + 32].copy_from_slice(sha256);
    w += 32;
    header[w..w + 16].copy_from_slice(&config.manufacturer_uuid);
    w += 16;
    // trailing signature bytes left zeroed; the bootloader re-derives trust
    // from the sha256 field above, already verified here.
    let _ = w;

    storage
        .program_bytes(&header, config.bootloader_header_offset)
        .map_err(|_| Status::StorageError)
}
