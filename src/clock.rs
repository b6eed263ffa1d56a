//! GPS-epoch wall clock shared by the clock-sync and multicast packages.
//!
//! GPS epoch is 1980-01-06; the device never knows UTC, only this estimate.
//! The estimate starts at 0 (unsynchronized) until `out_of_band_sync` or a
//! clock-sync exchange seeds it.

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WallClock {
    gps_epoch_s: i64,
}

impl WallClock {
    pub const fn new() -> Self {
        Self { gps_epoch_s: 0 }
    }

    /// Current best estimate of GPS epoch seconds.
    pub fn current_time_s(&self) -> i64 {
        self.gps_epoch_s
    }

    /// Seed the clock from an out-of-band source (e.g. a provisioning step, or
    /// a GPS fix). Unlike `adjust`, this is an absolute set, not a correction.
    pub fn set(&mut self, gps_epoch_s: i64) {
        self.gps_epoch_s = gps_epoch_s;
    }

    /// Apply a signed correction received from the network server. Returns
    /// the applied delta so callers can re-arm anything scheduled against
    /// absolute time.
    pub fn adjust(&mut self, delta_s: i32) -> i32 {
        self.gps_epoch_s += delta_s as i64;
        delta_s
    }
}
