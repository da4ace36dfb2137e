//! Windows packet interception using WinDivert 2.x.
//!
//! Every handle is opened in intercept mode at the network layer: matching
//! packets are removed from the stack and only reach the wire again if the
//! engine re-injects them. Synthesized packets are sent with the impostor
//! flag so that filters carrying `!impostor` never see them twice.
//!
//! SAFETY: an intercept handle with a broad filter diverts real traffic.
//! The loop owning a handle must keep re-injecting until it exits.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use windivert::prelude::*;

use super::{Packet, PacketDriver, PacketHandle, RecvError};
use crate::config;
use crate::error::{driver_error_hint, BypassError};

const ERROR_NO_DATA: i32 = 232;
const ERROR_OPERATION_ABORTED: i32 = 995;

/// Opens WinDivert network-layer handles.
pub struct WinDivertDriver;

impl PacketDriver for WinDivertDriver {
    fn name(&self) -> &'static str {
        "windivert"
    }

    fn check_preconditions(&self) -> Result<(), BypassError> {
        if !cfg!(target_pointer_width = "64") {
            return Err(BypassError::Platform(
                "WinDivert backend requires a 64-bit process".into(),
            ));
        }
        if !driver_file_present() {
            return Err(BypassError::DriverMissing(
                "WinDivert64.sys not found next to the executable".into(),
            ));
        }
        Ok(())
    }

    fn open(&self, filter: &str, priority: i16) -> Result<Arc<dyn PacketHandle>, BypassError> {
        tracing::info!("Opening WinDivert handle: filter='{filter}', priority={priority}");
        let wd = WinDivert::network(filter, priority, WinDivertFlags::new()).map_err(|e| {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            tracing::error!("WinDivert::network() failed: {e:?} (code {code})");
            map_open_error(filter, code, &format!("{e:?}"))
        })?;
        tracing::info!("WinDivert handle open: [{filter}]");
        Ok(Arc::new(WinDivertHandle {
            wd,
            filter: filter.to_string(),
            shut: AtomicBool::new(false),
            buf: Mutex::new(vec![0u8; config::RECV_BUFFER_SIZE]),
        }))
    }
}

fn map_open_error(filter: &str, code: i32, detail: &str) -> BypassError {
    let msg = format!(
        "failed to open WinDivert handle [{filter}]: {} ({detail})",
        driver_error_hint(code)
    );
    match code {
        5 => BypassError::Privilege(msg),
        2 | 577 | 1060 | 1275 => BypassError::DriverMissing(msg),
        _ => BypassError::HandleOpen(msg),
    }
}

fn driver_file_present() -> bool {
    let Ok(exe) = std::env::current_exe() else {
        return true;
    };
    let Some(dir) = exe.parent() else {
        return true;
    };
    dir.join("WinDivert64.sys").exists()
}

/// One open WinDivert handle.
pub struct WinDivertHandle {
    wd: WinDivert<NetworkLayer>,
    filter: String,
    shut: AtomicBool,
    buf: Mutex<Vec<u8>>,
}

// SAFETY: a WinDivert HANDLE may be used from several threads at once; the
// driver serializes recv/send internally. The receive buffer is behind a Mutex.
unsafe impl Sync for WinDivertHandle {}

impl PacketHandle for WinDivertHandle {
    fn recv(&self) -> Result<Packet, RecvError> {
        if self.shut.load(Ordering::Relaxed) {
            return Err(RecvError::Aborted);
        }
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| RecvError::Transient("receive buffer poisoned".into()))?;
        match self.wd.recv(Some(&mut buf[..])) {
            Ok(packet) => Ok(Packet {
                data: packet.data.to_vec(),
                outbound: packet.address.outbound(),
                impostor: false,
                address: Some(packet.address),
            }),
            Err(e) => {
                let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if self.shut.load(Ordering::Relaxed)
                    || code == ERROR_OPERATION_ABORTED
                    || code == ERROR_NO_DATA
                {
                    Err(RecvError::Aborted)
                } else {
                    Err(RecvError::Transient(format!("{e}")))
                }
            }
        }
    }

    fn send(&self, packet: &Packet) -> Result<(), BypassError> {
        let mut wd_packet = match &packet.address {
            Some(address) => WinDivertPacket::<NetworkLayer> {
                address: address.clone(),
                data: Cow::Borrowed(packet.data.as_slice()),
            },
            None => {
                // SAFETY: the zeroed address is completed below before sending.
                let mut p = unsafe { WinDivertPacket::<NetworkLayer>::new(packet.data.clone()) };
                p.address.set_outbound(packet.outbound);
                p
            }
        };
        if packet.impostor {
            wd_packet.address.set_impostor(true);
        }
        self.wd
            .send(&wd_packet)
            .map(|_| ())
            .map_err(|e| BypassError::Io(format!("WinDivert send error: {e}")))
    }

    fn calc_checksums(&self, packet: &mut Packet) {
        // SAFETY: only the data buffer is used for checksum calculation.
        let mut wd_packet =
            unsafe { WinDivertPacket::<NetworkLayer>::new(std::mem::take(&mut packet.data)) };
        if let Err(e) = wd_packet.recalculate_checksums(ChecksumFlags::new()) {
            tracing::warn!("WinDivert checksum calculation failed: {e}");
        }
        packet.data = wd_packet.data.into_owned();
    }

    fn shutdown(&self) {
        // The blocked recv returns with the next diverted packet; the loop
        // re-injects it and exits.
        self.shut.store(true, Ordering::Relaxed);
        tracing::info!("WinDivert handle shutdown requested: [{}]", self.filter);
    }

    fn filter(&self) -> &str {
        &self.filter
    }
}

impl Drop for WinDivertHandle {
    fn drop(&mut self) {
        if let Err(e) = self.wd.close(CloseAction::Nothing) {
            tracing::warn!("WinDivert close failed for [{}]: {e}", self.filter);
        } else {
            tracing::info!("WinDivert handle closed: [{}]", self.filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mapping_by_code() {
        assert_eq!(map_open_error("f", 5, "").kind(), "Privilege");
        assert_eq!(map_open_error("f", 2, "").kind(), "DriverMissing");
        assert_eq!(map_open_error("f", 1060, "").kind(), "DriverMissing");
        assert_eq!(map_open_error("f", 87, "").kind(), "HandleOpen");
        assert!(map_open_error("tcp", 87, "x").to_string().contains("[tcp]"));
    }
}
