pub mod gpiod;
pub mod sim;
pub mod edge;
pub mod debounce;
pub mod keypad;

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use crate::edge::Edge;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum GpioError {
    #[error("pin already in use")]
    AlreadyInUse,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("the feature is not supported on this backend")]
    NotSupported,
    #[error("no line named {0:?}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
    #[error("error: {0}")]
    Other(String),
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Io(err.kind())
    }
}

pub type GpioResult<T> = Result<T, GpioError>;

pub trait GpioDriver: Debug {
    /// Gets the amount of GPIO lines available.
    fn count(&self) -> GpioResult<usize>;

    /// Gets the name the hardware description gave to the line at the given index, if any.
    fn line_name(&self, index: usize) -> GpioResult<Option<String>>;

    /// Finds the index of the line with the given name.
    ///
    /// # Errors
    /// - `GpioError::NotFound` if no line carries that name.
    fn find_line(&self, name: &str) -> GpioResult<usize> {
        for index in 0..self.count()? {
            if self.line_name(index)?.as_deref() == Some(name) {
                return Ok(index);
            }
        }
        Err(GpioError::NotFound(name.to_string()))
    }

    /// Gets the GPIO pin at the given index.
    ///
    /// The pin stays claimed until the returned handle (or whatever it is turned into) is dropped.
    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin>>;

    /// Resolves a [LineSpec] and claims the pin it names.
    fn get_pin_by_spec(&self, spec: &LineSpec) -> GpioResult<Box<dyn GpioPin>> {
        match spec {
            LineSpec::Offset(index) => self.get_pin(*index),
            LineSpec::Name(name) => self.get_pin(self.find_line(name)?),
        }
    }
}

/// Refers to a line either by its offset on the chip or by its name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LineSpec {
    Offset(usize),
    Name(String),
}

impl FromStr for LineSpec {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GpioError::InvalidArgument);
        }
        Ok(match s.parse() {
            Ok(offset) => LineSpec::Offset(offset),
            Err(_) => LineSpec::Name(s.to_string()),
        })
    }
}

impl Display for LineSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LineSpec::Offset(offset) => write!(f, "{}", offset),
            LineSpec::Name(name) => write!(f, "{:?}", name),
        }
    }
}

/// Specifies the active level of the GPIO pin.
///
/// By default, the active level is high.
///
/// Might be software-implemented.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioActiveLevel {
    #[default] High,
    Low,
}

/// Specifies the bias of the GPIO pin.
///
/// You can use this to enable pull-up or pull-down resistors.
/// These should work in both input and output modes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioBias {
    #[default] None,
    PullUp,
    PullDown,
}

/// Specifies the drive mode of the GPIO pin.
///
/// Works only in output mode.
///
/// By default, the drive mode is push-pull, which drives the pin high or low with low impedance.
/// There's also open-drain and open-source modes, that leave the pin floating when the output is high or low, respectively.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GpioDriveMode {
    /// GPIO pin is driven high or low with low impedance.
    #[default] PushPull,
    /// GPIO pin is driven low or left floating when high.
    OpenDrain,
    /// GPIO pin is driven high or left floating when low.
    OpenSource,
}

/// A claimed, not yet configured GPIO line.
///
/// Converting it into an input or output consumes the handle; the line stays claimed
/// for as long as the converted handle lives.
pub trait GpioPin: Debug + Send {
    /// Gets the index of the line on its driver.
    fn index(&self) -> usize;

    /// Sets the GPIO pin function to input, allowing reading its state.
    fn into_input(self: Box<Self>) -> GpioResult<Box<dyn GpioInput>>;
    /// Sets the GPIO pin function to output, allowing writing its state.
    ///
    /// The line is driven to `initial` as soon as it becomes an output.
    fn into_output(self: Box<Self>, initial: bool) -> GpioResult<Box<dyn GpioOutput>>;

    /// Gets whether the GPIO pin supports active level.
    fn supports_active_level(&self) -> bool {
        false
    }
    /// Sets the active level of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin does not support active level.
    fn set_active_level(&mut self, _level: GpioActiveLevel) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }

    /// Gets whether the GPIO pin supports bias (pull-up/pull-down resistors).
    fn supports_bias(&self) -> bool {
        false
    }
    /// Sets the bias of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin does not support bias.
    fn set_bias(&mut self, _bias: GpioBias) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }

    /// Gets whether the GPIO pin supports drive mode (push-pull, open-drain, open-source).
    fn supports_drive_mode(&self) -> bool {
        false
    }
    /// Sets the drive mode of the GPIO pin.
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin does not support drive mode.
    fn set_drive_mode(&mut self, _mode: GpioDriveMode) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }

    /// Gets whether the GPIO pin can report edges by itself once it is an input.
    fn supports_edge_detect(&self) -> bool {
        false
    }
    /// Makes the input report transitions matching `edge` through [GpioInput::wait_edges].
    ///
    /// # Errors
    /// - `GpioError::NotSupported` if the pin has no edge detection.
    fn set_edge_detect(&mut self, _edge: Edge) -> GpioResult<()> {
        Err(GpioError::NotSupported)
    }
}

pub trait GpioInput: Debug + Send + Sync {
    /// Gets the index of the line on its driver.
    fn index(&self) -> usize;
    /// Reads the logical state of the GPIO pin.
    fn read(&self) -> GpioResult<bool>;

    /// Gets whether [GpioInput::wait_edges] wakes up as soon as the line reports an edge.
    fn reports_edges(&self) -> bool {
        false
    }

    /// Waits up to `timeout` for edges reported by the line, and returns them in order.
    ///
    /// Lines without edge detection sleep for `timeout` and report nothing, leaving the
    /// caller to sample them.
    fn wait_edges(&self, timeout: Duration) -> GpioResult<Vec<Edge>> {
        thread::sleep(timeout);
        Ok(Vec::new())
    }
}

pub trait GpioOutput: Debug + Send {
    /// Gets the index of the line on its driver.
    fn index(&self) -> usize;
    /// Writes the logical state of the GPIO pin.
    fn write(&self, value: bool) -> GpioResult<()>;
}
