//! Interception loops: one dedicated OS thread per open handle.
//!
//! Each loop blocks on `recv`, runs its strategy list, and re-injects the
//! packet unless a strategy handled it. A panic inside a loop is caught at
//! the thread boundary and reported through the fault hook; it never takes
//! the process down and never leaves a silently dead loop behind.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::{send_logged, Packet, PacketHandle, RecvError};
use crate::codec;
use crate::config;
use crate::core::BypassMetrics;
use crate::error::BypassError;
use crate::strategies::PacketStrategy;

/// Called with `(loop name, message)` when a loop dies unexpectedly.
pub type FaultHook = Arc<dyn Fn(&str, String) + Send + Sync>;

/// A running loop owned by the engine.
pub struct LoopHandle {
    pub name: String,
    pub io: Arc<dyn PacketHandle>,
    done: oneshot::Receiver<()>,
    thread: std::thread::JoinHandle<()>,
}

impl LoopHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop to exit. On timeout the thread is detached.
    pub async fn join(self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.done).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Loop '{}' did not stop within {timeout:?}; detaching", self.name);
                false
            }
        }
    }
}

/// Run one received packet through the strategies; re-inject unless handled.
pub fn dispatch(
    io: &dyn PacketHandle,
    strategies: &[Box<dyn PacketStrategy>],
    metrics: &BypassMetrics,
    packet: Packet,
) {
    BypassMetrics::bump(&metrics.packets_processed);
    let Some(parsed) = codec::parse(&packet.data) else {
        send_logged(io, &packet);
        return;
    };
    for strategy in strategies {
        if strategy.process(io, &packet, &parsed) {
            return;
        }
    }
    send_logged(io, &packet);
}

/// Spawn a named loop thread over `io`.
pub fn spawn_loop(
    name: &str,
    io: Arc<dyn PacketHandle>,
    strategies: Vec<Box<dyn PacketStrategy>>,
    metrics: Arc<BypassMetrics>,
    stop: Arc<AtomicBool>,
    on_fault: FaultHook,
) -> Result<LoopHandle, BypassError> {
    let (done_tx, done_rx) = oneshot::channel();
    let loop_name = name.to_string();
    let loop_io = Arc::clone(&io);

    let thread = std::thread::Builder::new()
        .name(format!("dpiguard-{name}"))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                run(&loop_name, loop_io.as_ref(), &strategies, &metrics, &stop)
            }));
            match result {
                Ok(Some(reason)) => on_fault(&loop_name, reason),
                Ok(None) => {}
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!("Loop '{loop_name}' panicked: {msg}");
                    on_fault(&loop_name, format!("panic: {msg}"));
                }
            }
            let _ = done_tx.send(());
        })
        .map_err(|e| BypassError::Io(format!("failed to spawn loop thread '{name}': {e}")))?;

    Ok(LoopHandle {
        name: name.to_string(),
        io,
        done: done_rx,
        thread,
    })
}

/// Loop body. Returns a fault reason if the handle died without a stop request.
fn run(
    name: &str,
    io: &dyn PacketHandle,
    strategies: &[Box<dyn PacketStrategy>],
    metrics: &BypassMetrics,
    stop: &AtomicBool,
) -> Option<String> {
    tracing::info!("Loop '{name}' started on [{}]", io.filter());
    let fault = loop {
        match io.recv() {
            Ok(packet) => {
                if stop.load(Ordering::Relaxed) {
                    send_logged(io, &packet);
                    break None;
                }
                dispatch(io, strategies, metrics, packet);
            }
            Err(RecvError::Aborted) => {
                if stop.load(Ordering::Relaxed) {
                    break None;
                }
                tracing::error!("Loop '{name}': handle aborted without a stop request");
                break Some("handle aborted unexpectedly".to_string());
            }
            Err(RecvError::Transient(e)) => {
                if stop.load(Ordering::Relaxed) {
                    break None;
                }
                tracing::debug!("Loop '{name}' recv error: {e}");
                std::thread::sleep(Duration::from_millis(config::RECV_ERROR_BACKOFF_MS));
            }
        }
    };
    tracing::info!("Loop '{name}' stopped");
    fault
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockHandle;
    use crate::codec::fixtures::*;
    use crate::codec::{ParsedPacket, TCP_ACK, TCP_RST};
    use std::sync::Mutex;

    struct DropRst;

    impl PacketStrategy for DropRst {
        fn name(&self) -> &'static str {
            "drop_rst"
        }
        fn process(&self, _io: &dyn PacketHandle, _p: &Packet, parsed: &ParsedPacket) -> bool {
            parsed.is_rst()
        }
    }

    fn faults() -> (FaultHook, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: FaultHook = Arc::new(move |name: &str, msg: String| {
            sink.lock().unwrap().push(format!("{name}: {msg}"));
        });
        (hook, seen)
    }

    fn start(io: &Arc<MockHandle>, stop: &Arc<AtomicBool>, hook: FaultHook) -> LoopHandle {
        spawn_loop(
            "test",
            Arc::clone(io) as Arc<dyn PacketHandle>,
            vec![Box::new(DropRst)],
            Arc::new(BypassMetrics::new()),
            Arc::clone(stop),
            hook,
        )
        .unwrap()
    }

    #[test]
    fn test_dispatch_reinjects_unhandled_and_invalid() {
        let io = MockHandle::new("t", 0);
        let metrics = BypassMetrics::new();
        let strategies: Vec<Box<dyn PacketStrategy>> = vec![Box::new(DropRst)];

        dispatch(&io, &strategies, &metrics, Packet::new(vec![0xFF; 10], true));
        let ack = ipv4_tcp(CLIENT, SERVER, 1, 443, 64, 0, TCP_ACK, b"");
        dispatch(&io, &strategies, &metrics, Packet::new(ack, true));
        let rst = ipv4_tcp(SERVER, CLIENT, 443, 1, 64, 0, TCP_RST, b"");
        dispatch(&io, &strategies, &metrics, Packet::new(rst, false));

        assert_eq!(io.sent().len(), 2);
        assert_eq!(metrics.snapshot().packets_processed, 3);
    }

    #[tokio::test]
    async fn test_loop_survives_transient_errors_and_stops() {
        let io = Arc::new(MockHandle::new("t", 0));
        let stop = Arc::new(AtomicBool::new(false));
        let (hook, seen) = faults();
        let handle = start(&io, &stop, hook);

        io.push_error("blip");
        io.push_packet(ipv4_tcp(CLIENT, SERVER, 1, 443, 64, 0, TCP_ACK, b""));
        assert!(io.wait_for_sent(1, Duration::from_secs(2)));

        stop.store(true, Ordering::SeqCst);
        io.shutdown();
        assert!(handle.join(Duration::from_secs(2)).await);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_is_contained_and_reported() {
        let io = Arc::new(MockHandle::new("t", 0));
        let stop = Arc::new(AtomicBool::new(false));
        let (hook, seen) = faults();
        let handle = start(&io, &stop, hook);

        io.push_panic();
        assert!(handle.join(Duration::from_secs(2)).await);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("scripted loop panic"));
    }

    #[tokio::test]
    async fn test_unexpected_abort_is_a_fault() {
        let io = Arc::new(MockHandle::new("t", 0));
        let stop = Arc::new(AtomicBool::new(false));
        let (hook, seen) = faults();
        let handle = start(&io, &stop, hook);

        io.shutdown();
        assert!(handle.join(Duration::from_secs(2)).await);
        assert!(seen.lock().unwrap()[0].contains("aborted"));
    }
}
