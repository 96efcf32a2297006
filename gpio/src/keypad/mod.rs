//! Interrupt-driven membrane keypad.
//!
//! All rows rest at the active level, so a key press anywhere shows up as an edge on its
//! column. The edge disarms every column and schedules a scan after a debounce delay. The
//! scan drives one row at a time, reports the lowest active column of each row through the
//! key map, hands the batch to an [EventSink] and re-arms the columns.
mod device;
mod engine;
mod keymap;
mod keys;
mod lines;

use std::fmt::Debug;
use std::sync::mpsc::{self, Receiver, Sender};
use log::{debug, info};
use thiserror::Error;
use crate::GpioError;
pub use device::*;
pub use engine::*;
pub use keymap::*;
pub use keys::*;
pub use lines::*;

/// Number of rows of the membrane keypad.
pub const ROWS: usize = 4;
/// Number of columns of the membrane keypad.
pub const COLS: usize = 4;

pub type MembraneKeypad = KeypadDevice<ROWS, COLS>;

/// Bus type of devices built into the host.
pub const BUS_HOST: u16 = 0x19;

/// How a keypad presents itself to whoever consumes its events.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdentity {
    pub name: &'static str,
    pub phys: &'static str,
    pub bus: u16,
}

impl DeviceIdentity {
    pub const MEMBRANE: Self = Self {
        name: "Membrane Keypad",
        phys: "membrane/input0",
        bus: BUS_HOST,
    };
}

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum KeypadError {
    #[error("invalid keymap: {0}")]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error("failed to put the keypad at rest: {0}")]
    Scan(#[from] ScanIoError),
    #[error(transparent)]
    Gpio(#[from] GpioError),
}

/// One half of a key click.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent {
    pub code: KeyCode,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn press(code: KeyCode) -> Self {
        Self { code, pressed: true }
    }

    pub fn release(code: KeyCode) -> Self {
        Self { code, pressed: false }
    }
}

/// Receives decoded key events.
pub trait EventSink: Send {
    /// Announces the device and every key code it can report, before any event.
    fn register(&mut self, identity: &DeviceIdentity, capabilities: &[KeyCode]);

    /// Queues one event.
    fn report(&mut self, event: KeyEvent);

    /// Marks the queued events as complete, to be delivered together.
    fn sync(&mut self);

    /// Reports a whole batch, then syncs once.
    fn emit(&mut self, batch: &[KeyEvent]) {
        for &event in batch {
            self.report(event);
        }
        self.sync();
    }
}

/// Forwards every synced batch over a channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<Vec<KeyEvent>>,
    batch: Vec<KeyEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Vec<KeyEvent>>) {
        let (tx, rx) = mpsc::channel();
        let sink = Self {
            tx,
            batch: Vec::with_capacity(ROWS * 2),
        };
        (sink, rx)
    }
}

impl EventSink for ChannelSink {
    fn register(&mut self, identity: &DeviceIdentity, capabilities: &[KeyCode]) {
        info!(
            "Registered {} at {} (bus {:#04x}) with {} keys.",
            identity.name,
            identity.phys,
            identity.bus,
            capabilities.len()
        );
    }

    fn report(&mut self, event: KeyEvent) {
        self.batch.push(event);
    }

    fn sync(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        if self.tx.send(std::mem::take(&mut self.batch)).is_err() {
            debug!("Key event receiver is gone, dropping batch.");
        }
    }
}
