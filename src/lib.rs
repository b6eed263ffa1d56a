//! LoRaWAN FUOTA update client: fragmented data-block transport with
//! forward-error correction, remote multicast-group/class-C control, and
//! application-layer clock synchronization, sharing a block device, an
//! uplink channel, and a wall-clock estimate.
//!
//! `no_std`, no heap allocator. Large per-session state (the fragment
//! matrix, the assembled firmware image) lives on the block device; RAM
//! holds only the fixed-capacity structures bounded by [`fec::MAX_FRAGMENTS`].
#![no_std]

pub mod block_device;
pub mod clock;
pub mod clock_sync;
pub mod fec;
pub mod fragmentation;
mod log;
pub mod multicast;
mod serde;
pub mod status;
pub mod verify;

pub mod client;

pub use block_device::BlockDevice;
pub use client::{Config, UpdateClient, UpdateClientCallbacks};
pub use clock::WallClock;
pub use multicast::ClassCSession;
pub use status::Status;
