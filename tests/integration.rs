//! End-to-end scenarios driving the facade the way a host integration would:
//! one wire frame in, zero or more uplinks and callback invocations out.

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};
use lorawan_fuota::{BlockDevice, ClassCSession, Config, UpdateClient, UpdateClientCallbacks};
use p256::ecdsa::{SigningKey, VerifyingKey};

const PAGE: usize = 32;

struct MemDevice {
    data: [u8; 16384],
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

fn device() -> BlockDevice<MemDevice, PAGE> {
    BlockDevice::new(MemDevice { data: [0u8; 16384] })
}

#[derive(Default)]
struct Recorder {
    sent: Vec<(u8, Vec<u8>)>,
    class_a: usize,
    class_c: Vec<ClassCSession>,
    firmware_ready: usize,
}

impl UpdateClientCallbacks for Recorder {
    fn send(&mut self, port: u8, data: &[u8]) {
        self.sent.push((port, data.to_vec()));
    }
    fn switch_to_class_a(&mut self) {
        self.class_a += 1;
    }
    fn switch_to_class_c(&mut self, session: ClassCSession) {
        self.class_c.push(session);
    }
    fn firmware_ready(&mut self, _report: &lorawan_fuota::verify::VerificationReport) {
        self.firmware_ready += 1;
    }
}

#[derive(Default)]
struct TestRng(u64);
impl rand_core::RngCore for TestRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
impl rand_core::CryptoRng for TestRng {}

fn test_config(verifying_key: VerifyingKey) -> Config {
    Config {
        app_key: core::array::from_fn(|i| i as u8),
        ecdsa_public_key: verifying_key,
        manufacturer_uuid: [0xAA; 16],
        device_class_uuid: [0xBB; 16],
        frag_storage_offset: 0,
        bootloader_header_offset: 8192,
        supported_frequencies_hz: &[868_100_000, 868_300_000, 10_000],
        supported_datarates: &[0, 1, 2],
    }
}

#[test]
fn frag_setup_with_unsupported_index_creates_no_session() {
    let signing_key = SigningKey::random(&mut TestRng::default());
    let config = test_config(*signing_key.verifying_key());
    let mut client = UpdateClient::new(config, device(), Recorder::default());

    // frag_index = 1 in the low 2 bits of the flags byte: only index 0 is supported.
    let frame = [0x02u8, 0b0000_0001, 0x05, 0x00, 0x08, 0x00, 0x00, 0, 0, 0, 0];
    client.handle_fragmentation_command(0, &frame).unwrap();

    assert_eq!(client.callbacks().sent.len(), 1);
    let (port, reply) = &client.callbacks().sent[0];
    assert_eq!(*port, 201);
    assert_eq!(reply[0], 0x02);
    assert_ne!(reply[1] & 0b1_0000, 0);
}

#[test]
fn frag_session_completes_and_triggers_verification_failure() {
    let signing_key = SigningKey::random(&mut TestRng::default());
    let wrong_key = SigningKey::random(&mut TestRng::default());
    let config = test_config(*wrong_key.verifying_key());
    let mut client = UpdateClient::new(config, device(), Recorder::default());

    let nb_frag: u16 = 16;
    let frag_size: u8 = 16;
    let setup = [
        0x02u8, 0x00, nb_frag.to_le_bytes()[0], nb_frag.to_le_bytes()[1], frag_size, 0x00, 0x00, 0, 0, 0, 0,
    ];
    client.handle_fragmentation_command(0, &setup).unwrap();
    assert_eq!(client.callbacks().sent[0].1, vec![0x02, 0x00]);

    // Feed four full-size fragments; the last one trips completion and the
    // verification pipeline, which fails because the image is unsigned.
    for i in 1u16..=nb_frag {
        let mut frame = vec![0x08u8];
        frame.extend_from_slice(&i.to_le_bytes());
        frame.extend(core::iter::repeat(i as u8).take(frag_size as usize));
        let result = client.handle_fragmentation_command(0, &frame);
        if i == nb_frag {
            assert!(result.is_err(), "final fragment should surface verification failure");
        } else {
            result.unwrap();
        }
    }

    let _ = signing_key; // unused signer: the image deliberately carries no valid signature
    assert_eq!(client.callbacks().firmware_ready, 0);
}

#[test]
fn multicast_setup_with_group_id_past_range_is_rejected() {
    let signing_key = SigningKey::random(&mut TestRng::default());
    let config = test_config(*signing_key.verifying_key());
    let mut client = UpdateClient::new(config, device(), Recorder::default());

    let mut frame = vec![0x02u8, 4]; // group id 4 is out of the 4-slot range
    frame.extend(core::iter::repeat(0u8).take(4 + 16 + 4 + 4));
    client.handle_multicast_control_command(&frame).unwrap();

    let (port, reply) = &client.callbacks().sent[0];
    assert_eq!(*port, 200);
    assert_eq!(reply[0], 0x02);
    assert_ne!(reply[1] & 0b001, 0);
}

#[test]
fn class_c_session_requested_in_the_past_fires_on_first_poll() {
    let signing_key = SigningKey::random(&mut TestRng::default());
    let config = test_config(*signing_key.verifying_key());
    let mut client = UpdateClient::new(config, device(), Recorder::default());
    client.out_of_band_clock_sync(2_000_000);

    let mut setup = vec![0x02u8, 0];
    setup.extend(core::iter::repeat(0u8).take(4 + 16 + 4 + 4));
    client.handle_multicast_control_command(&setup).unwrap();

    let mut session_req = vec![0x04u8, 0];
    session_req.extend_from_slice(&(2_000_000u32 - 30).to_le_bytes());
    session_req.push(6); // timeout exponent
    session_req.extend_from_slice(&[0x64, 0x00, 0x00]); // freq/100 = 100 -> 10_000 Hz
    session_req.push(0); // datarate
    client.handle_multicast_control_command(&session_req).unwrap();

    let (_, reply) = &client.callbacks().sent[1];
    assert_eq!(reply[0], 0x04);
    assert_eq!(reply[1], 0x00);
    assert_eq!(&reply[2..5], &[0, 0, 0], "start time already in the past: delta clamped to 0");

    client.poll();
    assert_eq!(client.callbacks().class_c.len(), 1);
    assert_eq!(client.callbacks().class_c[0].downlink_freq_hz, 10_000);
}

#[test]
fn clock_correction_with_matching_token_applies_and_advances_token() {
    let signing_key = SigningKey::random(&mut TestRng::default());
    let config = test_config(*signing_key.verifying_key());
    let mut client = UpdateClient::new(config, device(), Recorder::default());
    client.out_of_band_clock_sync(1_000_000);

    let correction: i32 = -2400;
    let mut frame = vec![0x01u8];
    frame.extend_from_slice(&correction.to_le_bytes());
    frame.push(0x00); // token_ans = 0 matches the device's fresh token_req
    client.handle_clock_sync_command(&frame).unwrap();

    assert_eq!(client.current_time_s(), 1_000_000 - 2400);
}
