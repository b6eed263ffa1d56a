//! Shared status/error enumeration used across the fragmentation, multicast and
//! clock-sync packages.
//!
//! Protocol-level failures (e.g. "frag index not supported", "frequency not
//! supported") never surface as a return value; they are encoded directly
//! into the on-wire status byte of the package that produced them.
//! `FrequencyNotSupported`/`DatarateNotSupported` are declared here rather
//! than dropped because the host may still want to match on them in the
//! future, but today this enum is otherwise only for conditions the host
//! needs to observe as a return: a malformed frame, a storage failure, a
//! verification failure, and so on.

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    InvalidPacketLength,
    UnknownCommand,
    InternalError,
    StorageError,
    FragSessionNotActive,
    MatrixError,
    OutOfMemory,
    CryptoKeyDerivationFailed,
    VerificationFailed,
    ParameterError,
    FrequencyNotSupported,
    DatarateNotSupported,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}
