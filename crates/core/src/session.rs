//! Request/reply session over the device link.
//!
//! One background I/O thread owns the transport. It drains queued outgoing
//! command frames onto the wire and sorts incoming 3-byte replies into
//! per-command-tag FIFO queues. The device answers commands of a given type
//! strictly in the order they were sent, so a caller that issues N commands
//! of one type later drains exactly N replies from that type's queue and
//! gets them in order. There is no per-request identifier.
//!
//! That guarantee is also the session's one concurrency precondition:
//! callers must never hold two listeners for the same tag, and must never
//! leave a listener registered past its need, because unread replies would
//! masquerade as fresh state for the next registrant. [`Session::listen`]
//! rejects a busy tag and [`Listener`] unregisters itself on drop.
//!
//! An I/O fault inside the background thread lands on a session-wide fault
//! channel. Blocking reply waits do not consult it; they simply time out.
//! Long-running loops poll it through [`Session::take_fault`] between
//! operations, which is how a yanked cable surfaces as an error instead of
//! a hang.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::Error;
use crate::transport::Transport;
use crate::wire::{Command, Reply, CMD_LEN, REPLY_LEN};

/// Default bound for a single reply wait during block transfers.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

type ListenerMap = Arc<Mutex<HashMap<u8, Sender<Reply>>>>;
type FaultCell = Arc<Mutex<Option<Error>>>;

/// A live connection to the device.
///
/// Created when a physical connection is established and dropped when the
/// cartridge workflow ends; dropping stops the I/O thread. Exactly one
/// session owns the transport at a time.
pub struct Session {
    cmd_tx: Sender<Vec<u8>>,
    listeners: ListenerMap,
    fault: FaultCell,
    running: Arc<AtomicBool>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Take ownership of `transport` and spawn the background I/O thread.
    pub fn open<T: Transport + 'static>(transport: T) -> Session {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Vec<u8>>();
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));
        let fault: FaultCell = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let io_thread = {
            let listeners = Arc::clone(&listeners);
            let fault = Arc::clone(&fault);
            let running = Arc::clone(&running);
            thread::spawn(move || io_loop(transport, cmd_rx, listeners, fault, running))
        };

        Session {
            cmd_tx,
            listeners,
            fault,
            running,
            io_thread: Some(io_thread),
        }
    }

    /// Register the reply queue for `tag`.
    ///
    /// Must happen before the matching commands are sent, and the listener
    /// must be dropped once the expected reply count has been drained.
    pub fn listen(&self, tag: u8) -> Result<Listener, Error> {
        let mut map = self.listeners.lock().unwrap();
        if map.contains_key(&tag) {
            return Err(Error::ListenerBusy { tag });
        }
        let (tx, rx) = mpsc::channel();
        map.insert(tag, tx);
        Ok(Listener {
            tag,
            rx,
            listeners: Arc::clone(&self.listeners),
        })
    }

    /// Queue `cmds` for transmission as one contiguous burst of frames.
    pub fn send(&self, cmds: &[Command]) -> Result<(), Error> {
        let mut bytes = Vec::with_capacity(cmds.len() * CMD_LEN);
        for cmd in cmds {
            bytes.extend_from_slice(&cmd.encode());
        }
        self.cmd_tx.send(bytes).map_err(|_| Error::SessionClosed)
    }

    /// Register, send one command, and drain its single reply.
    pub fn transact(
        &self,
        cmd: Command,
        timeout: Duration,
        op: &'static str,
    ) -> Result<Reply, Error> {
        debug_assert!(cmd.has_reply());
        let listener = self.listen(cmd.tag())?;
        self.send(&[cmd])?;
        listener.recv(timeout, op)
    }

    /// Take the pending background fault, if any.
    pub fn take_fault(&self) -> Option<Error> {
        self.fault.lock().unwrap().take()
    }

    /// Whether the background I/O thread is still alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Echo test. Returns whether the device echoed the byte back intact.
    pub fn loopback(&self, value: u8) -> Result<bool, Error> {
        match self.transact(Command::Loopback { value }, REPLY_TIMEOUT, "loopback")? {
            Reply::Loopback { value: echo } => Ok(echo == value),
            _ => Err(Error::Protocol("loopback")),
        }
    }

    /// Fire-and-forget pixel push to the device frame buffer.
    pub fn write_pixel(&self, r: u8, g: u8, b: u8) -> Result<(), Error> {
        self.send(&[Command::WritePixel { r, g, b }])
    }

    /// Set the device audio sample counter.
    pub fn set_audio(&self, samples: u16) -> Result<(), Error> {
        self.transact(Command::Audio { samples }, REPLY_TIMEOUT, "audio control")?;
        Ok(())
    }

    /// Read one byte of device PSRAM.
    pub fn read_psram(&self, addr: u16) -> Result<u8, Error> {
        let reply = self.transact(Command::ReadPsram { addr }, REPLY_TIMEOUT, "psram read")?;
        let (_, value) = reply.byte_echo().ok_or(Error::Protocol("psram read"))?;
        Ok(value)
    }

    /// Write one byte of device PSRAM.
    pub fn write_psram(&self, addr: u16, value: u8) -> Result<(), Error> {
        self.transact(
            Command::WritePsram { addr, value },
            REPLY_TIMEOUT,
            "psram write",
        )?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}

/// A registered reply queue for one command tag.
///
/// Dropping it unregisters the queue; any undrained replies go with it.
#[derive(Debug)]
pub struct Listener {
    tag: u8,
    rx: Receiver<Reply>,
    listeners: ListenerMap,
}

impl Listener {
    /// Wait for the next reply of this tag, bounded by `timeout`. `op`
    /// names the operation in the timeout error.
    pub fn recv(&self, timeout: Duration, op: &'static str) -> Result<Reply, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout { op }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::SessionClosed),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Ok(mut map) = self.listeners.lock() {
            map.remove(&self.tag);
        }
    }
}

/// Background thread body: write queued frames, read and dispatch replies.
fn io_loop<T: Transport>(
    mut transport: T,
    cmd_rx: Receiver<Vec<u8>>,
    listeners: ListenerMap,
    fault: FaultCell,
    running: Arc<AtomicBool>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 512];

    while running.load(Ordering::SeqCst) {
        loop {
            match cmd_rx.try_recv() {
                Ok(frame) => {
                    if let Err(e) = transport.send(&frame) {
                        report_fault(&fault, &running, e.into());
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        match transport.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                dispatch(&mut pending, &listeners);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                report_fault(&fault, &running, e.into());
                return;
            }
        }
    }
}

fn report_fault(fault: &FaultCell, running: &AtomicBool, error: Error) {
    warn!("session I/O thread stopping: {}", error);
    *fault.lock().unwrap() = Some(error);
    running.store(false, Ordering::SeqCst);
}

/// Carve complete reply frames out of `pending` and push each onto the
/// queue registered for its tag. An unknown tag byte drops a single byte
/// and rescans, which re-synchronizes after line noise.
fn dispatch(pending: &mut Vec<u8>, listeners: &ListenerMap) {
    while pending.len() >= REPLY_LEN {
        let mut frame = [0u8; REPLY_LEN];
        frame.copy_from_slice(&pending[..REPLY_LEN]);
        match Reply::decode(&frame) {
            Some(reply) => {
                pending.drain(..REPLY_LEN);
                let map = listeners.lock().unwrap();
                match map.get(&reply.tag()) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        debug!("reply 0x{:02X} arrived with no listener, discarding", frame[0]);
                    }
                }
            }
            None => {
                warn!("unknown reply tag 0x{:02X}, resynchronizing", frame[0]);
                pending.drain(..1);
            }
        }
    }
}
