//! Packet interception primitives.
//!
//! The engine never talks to a driver directly. It goes through two traits:
//! - [`PacketDriver`] validates platform preconditions and opens handles.
//! - [`PacketHandle`] is one open filter: blocking `recv`, `send`, checksum
//!   helper and `shutdown`.
//!
//! Backends:
//! - Windows: WinDivert 2.x (`windivert_backend`)
//! - elsewhere: [`UnsupportedDriver`], which fails every enable with `Platform`

pub mod loops;

#[cfg(target_os = "windows")]
pub mod windivert_backend;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use crate::error::BypassError;

#[cfg(target_os = "windows")]
pub(crate) type PlatformAddress = windivert::address::WinDivertAddress<windivert::prelude::NetworkLayer>;

#[cfg(not(target_os = "windows"))]
#[derive(Debug, Clone, Default)]
pub(crate) struct PlatformAddress;

/// One raw IP packet plus the driver metadata needed to re-inject it.
#[derive(Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub outbound: bool,
    /// Set on packets the engine synthesizes, so its own filters skip them.
    pub impostor: bool,
    pub(crate) address: Option<PlatformAddress>,
}

impl Packet {
    pub fn new(data: Vec<u8>, outbound: bool) -> Self {
        Self {
            data,
            outbound,
            impostor: false,
            address: None,
        }
    }

    /// A synthesized packet that inherits this packet's routing metadata.
    pub fn derive(&self, data: Vec<u8>) -> Self {
        Self {
            data,
            outbound: self.outbound,
            impostor: true,
            address: self.address.clone(),
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.data.len())
            .field("outbound", &self.outbound)
            .field("impostor", &self.impostor)
            .finish()
    }
}

/// Outcome of a failed `recv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvError {
    /// The handle was shut down; the loop must exit.
    Aborted,
    /// A one-off failure; the loop keeps going.
    Transient(String),
}

/// One open interception filter.
pub trait PacketHandle: Send + Sync {
    /// Block until a packet matching the filter arrives.
    fn recv(&self) -> Result<Packet, RecvError>;

    /// Inject a packet onto the wire.
    fn send(&self, packet: &Packet) -> Result<(), BypassError>;

    /// Recompute IP/TCP/UDP checksums in place.
    fn calc_checksums(&self, packet: &mut Packet);

    /// Stop delivering packets; a blocked `recv` returns `RecvError::Aborted`.
    fn shutdown(&self);

    /// Filter expression this handle was opened with.
    fn filter(&self) -> &str;
}

/// Opens interception handles.
pub trait PacketDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Platform, privilege and driver-availability checks.
    fn check_preconditions(&self) -> Result<(), BypassError>;

    fn open(&self, filter: &str, priority: i16) -> Result<Arc<dyn PacketHandle>, BypassError>;
}

/// Send `packet` after recomputing its checksums; a send failure is logged and swallowed.
pub fn send_fresh(io: &dyn PacketHandle, mut packet: Packet) -> bool {
    io.calc_checksums(&mut packet);
    send_logged(io, &packet)
}

/// Send `packet` as-is; a send failure is logged and swallowed.
pub fn send_logged(io: &dyn PacketHandle, packet: &Packet) -> bool {
    match io.send(packet) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("packet send failed on [{}]: {e}", io.filter());
            false
        }
    }
}

/// The driver for the current platform.
pub fn default_driver() -> Arc<dyn PacketDriver> {
    #[cfg(target_os = "windows")]
    {
        Arc::new(windivert_backend::WinDivertDriver)
    }
    #[cfg(not(target_os = "windows"))]
    {
        Arc::new(UnsupportedDriver)
    }
}

/// Driver for platforms without a packet-diversion backend.
pub struct UnsupportedDriver;

impl PacketDriver for UnsupportedDriver {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn check_preconditions(&self) -> Result<(), BypassError> {
        if !is_elevated() {
            return Err(BypassError::Privilege(
                "packet interception requires root privileges".into(),
            ));
        }
        Err(BypassError::Platform(format!(
            "packet interception is not available on {}",
            std::env::consts::OS
        )))
    }

    fn open(&self, filter: &str, _priority: i16) -> Result<Arc<dyn PacketHandle>, BypassError> {
        Err(BypassError::Platform(format!(
            "cannot open filter [{filter}] on {}",
            std::env::consts::OS
        )))
    }
}

/// Whether the process runs with administrative rights.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    true
}
