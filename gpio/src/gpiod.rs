//! GpiodDriver implementation for managing GPIO lines through the Linux GPIO character device,
//! using the gpiod library.
//!
//! Inputs are requested through `gpiod-core` directly, which hands out the line file
//! descriptor, so kernel edge events can be waited for with a timeout.
use crate::edge::Edge;
use crate::{
    GpioActiveLevel, GpioBias, GpioDriveMode, GpioDriver, GpioError, GpioInput, GpioOutput, GpioPin, GpioResult,
};
use bitvec::vec::BitVec;
use gpiod_core::{AsDevicePath, ChipInfo, Internal, RawEvent, ValuesInfo};
use log::{trace, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};
use std::fmt::{Debug, Formatter};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::time::Duration;

struct GpiodChip {
    chip: gpiod::Chip,
    // Second handle on the chip, for requests that keep their file descriptor.
    file: File,
    info: Internal<ChipInfo>,
    used_pins: BitVec<AtomicU8>,
}

/// GpiodDriver is a GPIO driver that uses the gpiod library to manage GPIO lines.
///
/// Handles it gives out keep the chip open on their own, so they can outlive the driver
/// and be moved to other threads.
#[derive(Clone)]
pub struct GpiodDriver {
    inner: Arc<GpiodChip>,
}

impl GpiodDriver {
    pub fn new(chip: gpiod::Chip) -> GpioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(chip.name().as_device_path())?;
        let info = Internal::<ChipInfo>::from_fd(file.as_raw_fd())?;
        let n = chip.num_lines() as usize;
        let bits = BitVec::repeat(false, n);
        Ok(Self {
            inner: Arc::new(GpiodChip {
                chip,
                file,
                info,
                used_pins: bits,
            }),
        })
    }

    /// Opens the chip at the given path, e.g. `/dev/gpiochip0`.
    pub fn open(path: &str) -> GpioResult<Self> {
        Self::new(gpiod::Chip::new(path)?)
    }
}

impl Debug for GpiodDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpiodDriver({})", self.inner.chip.name())
    }
}

impl GpioDriver for GpiodDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(self.inner.chip.num_lines() as usize)
    }

    fn line_name(&self, index: usize) -> GpioResult<Option<String>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        let info = self.inner.chip.line_info(index as u32)?;
        Ok(Some(info.name).filter(|name| !name.is_empty()))
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        if self.inner.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.inner.used_pins.set_aliased(index, true);
        trace!("{:?} claimed line {}", self, index);

        Ok(Box::new(GpiodPin {
            claim: Claim {
                driver: self.clone(),
                index,
            },
            active_level: GpioActiveLevel::High,
            bias: GpioBias::None,
            drive_mode: GpioDriveMode::PushPull,
            edge: None,
        }))
    }
}

impl From<GpioActiveLevel> for gpiod::Active {
    fn from(level: GpioActiveLevel) -> Self {
        match level {
            GpioActiveLevel::High => gpiod::Active::High,
            GpioActiveLevel::Low => gpiod::Active::Low,
        }
    }
}

impl From<GpioBias> for gpiod::Bias {
    fn from(bias: GpioBias) -> Self {
        match bias {
            GpioBias::None => gpiod::Bias::Disable,
            GpioBias::PullUp => gpiod::Bias::PullUp,
            GpioBias::PullDown => gpiod::Bias::PullDown,
        }
    }
}

impl From<GpioDriveMode> for gpiod::Drive {
    fn from(mode: GpioDriveMode) -> Self {
        match mode {
            GpioDriveMode::PushPull => gpiod::Drive::PushPull,
            GpioDriveMode::OpenDrain => gpiod::Drive::OpenDrain,
            GpioDriveMode::OpenSource => gpiod::Drive::OpenSource,
        }
    }
}

impl From<Edge> for gpiod::EdgeDetect {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Rising => gpiod::EdgeDetect::Rising,
            Edge::Falling => gpiod::EdgeDetect::Falling,
            Edge::Both => gpiod::EdgeDetect::Both,
        }
    }
}

impl From<gpiod::Edge> for Edge {
    fn from(edge: gpiod::Edge) -> Self {
        match edge {
            gpiod::Edge::Rising => Edge::Rising,
            gpiod::Edge::Falling => Edge::Falling,
        }
    }
}

/// Marks a line as used until dropped.
struct Claim {
    driver: GpiodDriver,
    index: usize,
}

impl Debug for Claim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.driver, self.index)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.driver.inner.used_pins.set_aliased(self.index, false);
        trace!("{:?} released", self);
    }
}

struct GpiodPin {
    claim: Claim,
    active_level: GpioActiveLevel,
    bias: GpioBias,
    drive_mode: GpioDriveMode,
    edge: Option<Edge>,
}

impl Debug for GpiodPin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.claim)
    }
}

impl GpioPin for GpiodPin {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn into_input(self: Box<Self>) -> GpioResult<Box<dyn GpioInput>> {
        let GpiodPin { claim, active_level, bias, edge, .. } = *self;
        let mut options = gpiod::Options::input([claim.index as u32])
            .consumer(env!("CARGO_PKG_NAME"))
            .active(active_level.into())
            .bias(bias.into());
        if let Some(edge) = edge {
            options = options.edge(edge.into());
        }

        let inner = &claim.driver.inner;
        let (values, fd) = inner.info.request_lines(inner.file.as_raw_fd(), options)?;
        // SAFETY: the request hands over a fresh descriptor that nothing else owns.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Box::new(GpiodInput {
            file,
            values,
            edges: edge.is_some(),
            claim,
        }))
    }

    fn into_output(self: Box<Self>, initial: bool) -> GpioResult<Box<dyn GpioOutput>> {
        let GpiodPin { claim, active_level, bias, drive_mode, .. } = *self;
        let line = claim.driver.inner.chip.request_lines(
            gpiod::Options::output([claim.index as u32])
                .consumer(env!("CARGO_PKG_NAME"))
                .active(active_level.into())
                .bias(bias.into())
                .drive(drive_mode.into())
                // Driven from the request on, with no window at the default level.
                .values([initial]),
        )?;
        Ok(Box::new(GpiodOutput { line, claim }))
    }

    fn supports_active_level(&self) -> bool {
        true
    }

    fn set_active_level(&mut self, level: GpioActiveLevel) -> GpioResult<()> {
        self.active_level = level;
        Ok(())
    }

    fn supports_bias(&self) -> bool {
        true
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        self.bias = bias;
        Ok(())
    }

    fn supports_drive_mode(&self) -> bool {
        true
    }

    // Only applies once the line becomes an output.
    fn set_drive_mode(&mut self, mode: GpioDriveMode) -> GpioResult<()> {
        self.drive_mode = mode;
        Ok(())
    }

    fn supports_edge_detect(&self) -> bool {
        true
    }

    // Only applies once the line becomes an input.
    fn set_edge_detect(&mut self, edge: Edge) -> GpioResult<()> {
        self.edge = Some(edge);
        Ok(())
    }
}

// `file` is declared first so the request is closed before the claim is released.
struct GpiodInput {
    file: File,
    values: Internal<ValuesInfo>,
    edges: bool,
    claim: Claim,
}

impl GpiodInput {
    /// Waits for the request to become readable. Returns whether it did.
    fn poll_readable(&self, timeout: Duration) -> GpioResult<bool> {
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut fds = [PollFd::new(self.file.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|events| events.contains(PollFlags::POLLIN))),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    fn read_event(&self) -> GpioResult<Edge> {
        let mut event = RawEvent::default();
        let read = (&self.file).read(event.as_mut())?;
        if read != size_of::<RawEvent>() {
            return Err(GpioError::Other(format!("short edge event read ({} bytes)", read)));
        }
        Ok(event.as_event(self.values.index())?.edge.into())
    }
}

impl Debug for GpiodInput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[input]", self.claim)
    }
}

impl GpioInput for GpiodInput {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn read(&self) -> GpioResult<bool> {
        let mut values = [false];
        self.values.get_values(self.file.as_raw_fd(), &mut values)?;
        Ok(values[0])
    }

    fn reports_edges(&self) -> bool {
        self.edges
    }

    fn wait_edges(&self, timeout: Duration) -> GpioResult<Vec<Edge>> {
        if !self.edges {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        let mut edges = Vec::new();
        let mut wait = timeout;
        // Drain everything already queued, without blocking after the first event.
        while self.poll_readable(wait)? {
            match self.read_event() {
                Ok(edge) => edges.push(edge),
                Err(e) => {
                    warn!("Dropping malformed edge event on {:?}: {}", self, e);
                    break;
                }
            }
            wait = Duration::ZERO;
        }
        Ok(edges)
    }
}

struct GpiodOutput {
    line: gpiod::Lines<gpiod::Output>,
    claim: Claim,
}

impl Debug for GpiodOutput {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[output]", self.claim)
    }
}

impl GpioOutput for GpiodOutput {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn write(&self, value: bool) -> GpioResult<()> {
        self.line.set_values([value])?;
        Ok(())
    }
}
