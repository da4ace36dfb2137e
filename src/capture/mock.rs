//! In-memory packet driver for tests.
//!
//! `MockDriver` records every opened filter and can be told to refuse an open
//! or to fail the precondition check. `MockHandle` serves scripted packets from
//! an inbox, blocks on an empty inbox until shutdown, and records everything sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{Packet, PacketDriver, PacketHandle, RecvError};
use crate::error::BypassError;

enum Scripted {
    Packet(Packet),
    Error(String),
    Panic,
}

pub struct MockHandle {
    filter: String,
    pub priority: i16,
    inbox: Mutex<VecDeque<Scripted>>,
    ready: Condvar,
    sent: Mutex<Vec<Packet>>,
    shut: AtomicBool,
    pub checksum_calls: AtomicUsize,
}

impl MockHandle {
    pub fn new(filter: &str, priority: i16) -> Self {
        Self {
            filter: filter.to_string(),
            priority,
            inbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            sent: Mutex::new(Vec::new()),
            shut: AtomicBool::new(false),
            checksum_calls: AtomicUsize::new(0),
        }
    }

    fn push(&self, item: Scripted) {
        self.inbox.lock().unwrap().push_back(item);
        self.ready.notify_all();
    }

    pub fn push_packet(&self, data: Vec<u8>) {
        self.push(Scripted::Packet(Packet::new(data, true)));
    }

    pub fn push_error(&self, msg: &str) {
        self.push(Scripted::Error(msg.to_string()));
    }

    /// The next `recv` panics, simulating a bug inside a loop worker.
    pub fn push_panic(&self) {
        self.push(Scripted::Panic);
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent().into_iter().map(|p| p.data).collect()
    }

    pub fn is_shut(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` packets were sent or `timeout` elapses.
    pub fn wait_for_sent(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sent.lock().unwrap().len() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.sent.lock().unwrap().len() >= n
    }

    /// Poll until the inbox is drained or `timeout` elapses.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.inbox.lock().unwrap().is_empty() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl PacketHandle for MockHandle {
    fn recv(&self) -> Result<Packet, RecvError> {
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if self.shut.load(Ordering::SeqCst) {
                return Err(RecvError::Aborted);
            }
            match inbox.pop_front() {
                Some(Scripted::Packet(p)) => return Ok(p),
                Some(Scripted::Error(e)) => return Err(RecvError::Transient(e)),
                Some(Scripted::Panic) => {
                    drop(inbox);
                    panic!("scripted loop panic");
                }
                None => {
                    inbox = self
                        .ready
                        .wait_timeout(inbox, Duration::from_millis(20))
                        .unwrap()
                        .0;
                }
            }
        }
    }

    fn send(&self, packet: &Packet) -> Result<(), BypassError> {
        self.sent.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn calc_checksums(&self, _packet: &mut Packet) {
        self.checksum_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    fn filter(&self) -> &str {
        &self.filter
    }
}

#[derive(Default)]
pub struct MockDriver {
    opened: Mutex<Vec<Arc<MockHandle>>>,
    fail_filter_containing: Mutex<Option<String>>,
    deny_privilege: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every subsequent open whose filter contains `needle` fails.
    pub fn fail_open_when(&self, needle: &str) {
        *self.fail_filter_containing.lock().unwrap() = Some(needle.to_string());
    }

    pub fn deny_privilege(&self) {
        self.deny_privilege.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Arc<MockHandle>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Handles that have been opened and not yet shut down.
    pub fn live_handles(&self) -> Vec<Arc<MockHandle>> {
        self.opened()
            .into_iter()
            .filter(|h| !h.is_shut())
            .collect()
    }

    /// Most recently opened handle whose filter contains `needle`.
    pub fn handle_with(&self, needle: &str) -> Option<Arc<MockHandle>> {
        self.opened()
            .into_iter()
            .rev()
            .find(|h| h.filter().contains(needle))
    }
}

impl PacketDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn check_preconditions(&self) -> Result<(), BypassError> {
        if self.deny_privilege.load(Ordering::SeqCst) {
            return Err(BypassError::Privilege("mock: not elevated".into()));
        }
        Ok(())
    }

    fn open(&self, filter: &str, priority: i16) -> Result<Arc<dyn PacketHandle>, BypassError> {
        if let Some(needle) = self.fail_filter_containing.lock().unwrap().as_deref() {
            if filter.contains(needle) {
                return Err(BypassError::HandleOpen(format!("mock refused [{filter}]")));
            }
        }
        let handle = Arc::new(MockHandle::new(filter, priority));
        self.opened.lock().unwrap().push(Arc::clone(&handle));
        Ok(handle as Arc<dyn PacketHandle>)
    }
}
