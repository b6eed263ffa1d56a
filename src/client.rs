//! The update client facade: owns the block device, the wall clock, and the
//! three co-resident packages, and multiplexes inbound frames onto them.

use p256::ecdsa::VerifyingKey;

use crate::block_device::Storage;
use crate::clock::WallClock;
use crate::clock_sync::ClockSyncPackage;
use crate::fragmentation::{FragOutcome, FragmentationPackage};
use crate::multicast::{ClassCSession, MulticastPackage};
use crate::status::Status;
use crate::verify::{self, VerificationObserver, VerificationReport};

/// Compile-time-constant deployment parameters. There is no filesystem on
/// the device side, so unlike a host service's config file this is built
/// once by the integrator and handed to [`UpdateClient::new`].
pub struct Config {
    pub app_key: [u8; 16],
    pub ecdsa_public_key: VerifyingKey,
    pub manufacturer_uuid: [u8; 16],
    pub device_class_uuid: [u8; 16],
    pub frag_storage_offset: u32,
    pub bootloader_header_offset: u32,
    pub supported_frequencies_hz: &'static [u32],
    pub supported_datarates: &'static [u8],
}

/// Collaborator the facade drives instead of individual function pointers —
/// matches the teacher crate's preference for a generic trait bound over a
/// boxed trait object in a no-alloc crate.
pub trait UpdateClientCallbacks {
    fn send(&mut self, port: u8, data: &[u8]);
    fn switch_to_class_a(&mut self);
    fn switch_to_class_c(&mut self, session: ClassCSession);
    fn frag_session_complete(&mut self) {}
    fn firmware_ready(&mut self, report: &VerificationReport) {
        let _ = report;
    }
    fn verification_starting(&mut self) {}
    fn verification_finished(&mut self) {}
}

struct ObserverAdapter<'a, C: UpdateClientCallbacks>(&'a mut C);

impl<'a, C: UpdateClientCallbacks> VerificationObserver for ObserverAdapter<'a, C> {
    fn verification_starting(&mut self) {
        self.0.verification_starting();
    }
    fn verification_finished(&mut self) {
        self.0.verification_finished();
    }
}

pub struct UpdateClient<B, C> {
    config: Config,
    storage: B,
    callbacks: C,
    clock: WallClock,
    frag: FragmentationPackage,
    multicast: MulticastPackage,
    clock_sync: ClockSyncPackage,
}

impl<B: Storage, C: UpdateClientCallbacks> UpdateClient<B, C> {
    pub fn new(config: Config, storage: B, callbacks: C) -> Self {
        Self {
            config,
            storage,
            callbacks,
            clock: WallClock::new(),
            frag: FragmentationPackage::new(),
            multicast: MulticastPackage::new(),
            clock_sync: ClockSyncPackage::new(),
        }
    }

    pub fn current_time_s(&self) -> i64 {
        self.clock.current_time_s()
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    /// Seeds the wall clock from a source outside the clock-sync package
    /// (e.g. a provisioning step or a GPS fix at boot).
    pub fn out_of_band_clock_sync(&mut self, gps_epoch_s: i64) {
        self.clock.set(gps_epoch_s);
    }

    /// Emits a device-initiated `AppTimeReq` on port 202.
    pub fn request_clock_sync(&mut self, ans_required: bool) {
        let reply = self.clock_sync.request_clock_sync(&self.clock, ans_required);
        self.callbacks.send(crate::clock_sync::PORT, &reply);
    }

    /// Dispatches one frame received on port 201. `addr` is the device or
    /// multicast address the frame arrived on; `0` is the unicast sentinel.
    pub fn handle_fragmentation_command(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Status> {
        let mc_group_bit = if addr == 0 {
            None
        } else {
            self.multicast.fragmentation_address_bit(addr)
        };

        let (reply, outcome) = self.frag.handle(
            &mut self.storage,
            self.config.frag_storage_offset,
            mc_group_bit,
            bytes,
        )?;

        if let Some(reply) = reply {
            self.callbacks.send(crate::fragmentation::PORT, &reply);
        }

        if let Some(bit) = mc_group_bit {
            if matches!(outcome, Some(FragOutcome::Ok) | Some(FragOutcome::Complete)) {
                self.multicast.note_fragment_activity(bit, self.clock.current_time_s(), 0);
            }
        }

        if let Some(FragOutcome::Complete) = outcome {
            self.callbacks.frag_session_complete();
            self.run_verification()?;
        }

        Ok(())
    }

    /// Dispatches one frame received on port 200.
    pub fn handle_multicast_control_command(&mut self, bytes: &[u8]) -> Result<(), Status> {
        let now = self.clock.current_time_s();
        if let Some(reply) = self.multicast.handle(
            &self.config.app_key,
            now,
            self.config.supported_frequencies_hz,
            self.config.supported_datarates,
            bytes,
        )? {
            self.callbacks.send(crate::multicast::PORT, &reply);
        }
        Ok(())
    }

    /// Dispatches one frame received on port 202.
    pub fn handle_clock_sync_command(&mut self, bytes: &[u8]) -> Result<(), Status> {
        let (applied, reply) = self.clock_sync.handle(&mut self.clock, bytes)?;
        if applied.is_some() {
            self.multicast.rearm_after_clock_adjust();
        }
        if let Some(reply) = reply {
            self.callbacks.send(crate::clock_sync::PORT, &reply);
        }
        Ok(())
    }

    /// Drives pending class-C starts and session timeouts. The host calls
    /// this from its own scheduling loop; nothing here blocks.
    pub fn poll(&mut self) {
        let now = self.clock.current_time_s();
        self.multicast.poll(now, &mut self.callbacks);
    }

    fn run_verification(&mut self) -> Result<(), Status> {
        let Some(session) = self.frag.session() else {
            return Ok(());
        };
        let payload_size = session.payload_size();
        let mut observer = ObserverAdapter(&mut self.callbacks);
        match verify::run(&mut self.storage, &self.config, payload_size, &mut observer) {
            Ok(report) => {
                self.callbacks.firmware_ready(&report);
                Ok(())
            }
            Err(status) => Err(status),
        }
    }
}
