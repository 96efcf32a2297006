use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use log::debug;
use thiserror::Error;
use crate::edge::{Edge, EdgeSignal};
use crate::keypad::engine::ScanIoError;
use crate::{
    GpioActiveLevel, GpioBias, GpioDriveMode, GpioDriver, GpioError, GpioInput, GpioOutput,
    GpioPin, GpioResult, LineSpec,
};

/// Which side of the matrix a line belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineRole {
    Row,
    Col,
}

impl Display for LineRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LineRole::Row => write!(f, "row"),
            LineRole::Col => write!(f, "col"),
        }
    }
}

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum AcquisitionError {
    #[error("expected {expected} {role} lines, got {found}")]
    Count {
        role: LineRole,
        expected: usize,
        found: usize,
    },
    #[error("failed to acquire {role} line {line}: {source}")]
    Line {
        role: LineRole,
        line: String,
        #[source]
        source: GpioError,
    },
    #[error("failed to register the signal of column {col}: {source}")]
    Signal {
        col: usize,
        #[source]
        source: GpioError,
    },
}

/// Electrical configuration of the matrix lines.
///
/// The rest of the keypad only deals with logical levels; polarity lives here.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LineOptions {
    pub row_active_level: GpioActiveLevel,
    pub row_drive_mode: Option<GpioDriveMode>,
    pub col_active_level: GpioActiveLevel,
    pub col_bias: GpioBias,
}

fn apply_active_level(pin: &mut dyn GpioPin, level: GpioActiveLevel) -> GpioResult<()> {
    if level == GpioActiveLevel::High && !pin.supports_active_level() {
        return Ok(());
    }
    pin.set_active_level(level)
}

fn apply_bias(pin: &mut dyn GpioPin, bias: GpioBias) -> GpioResult<()> {
    if bias == GpioBias::None && !pin.supports_bias() {
        return Ok(());
    }
    pin.set_bias(bias)
}

fn apply_drive_mode(pin: &mut dyn GpioPin, mode: GpioDriveMode) -> GpioResult<()> {
    if mode == GpioDriveMode::PushPull && !pin.supports_drive_mode() {
        return Ok(());
    }
    pin.set_drive_mode(mode)
}

fn acquire_row(
    driver: &dyn GpioDriver,
    spec: &LineSpec,
    options: &LineOptions,
) -> GpioResult<Box<dyn GpioOutput>> {
    let mut pin = driver.get_pin_by_spec(spec)?;
    apply_active_level(pin.as_mut(), options.row_active_level)?;
    if let Some(mode) = options.row_drive_mode {
        apply_drive_mode(pin.as_mut(), mode)?;
    }
    // Rows rest active so that any key press shows up on its column.
    pin.into_output(true)
}

fn acquire_col(
    driver: &dyn GpioDriver,
    spec: &LineSpec,
    options: &LineOptions,
) -> GpioResult<Arc<dyn GpioInput>> {
    let mut pin = driver.get_pin_by_spec(spec)?;
    apply_active_level(pin.as_mut(), options.col_active_level)?;
    apply_bias(pin.as_mut(), options.col_bias)?;
    // Both directions are requested; the watcher filters by the configured edge.
    if pin.supports_edge_detect() {
        pin.set_edge_detect(Edge::Both)?;
    }
    Ok(Arc::from(pin.into_input()?))
}

/// The row and column lines of a `ROWS` × `COLS` matrix, plus one edge signal per column.
///
/// Columns are requested with edge detection where the backend has it.
pub struct LineSet<const ROWS: usize, const COLS: usize> {
    rows: [Box<dyn GpioOutput>; ROWS],
    cols: [Arc<dyn GpioInput>; COLS],
    signals: Arc<[EdgeSignal; COLS]>,
}

impl<const ROWS: usize, const COLS: usize> LineSet<ROWS, COLS> {
    /// Claims the given lines, rows as outputs driven active and columns as inputs.
    ///
    /// On failure every line claimed so far is released before returning.
    pub fn acquire(
        driver: &dyn GpioDriver,
        rows: &[LineSpec],
        cols: &[LineSpec],
        options: &LineOptions,
    ) -> Result<Self, AcquisitionError> {
        if rows.len() != ROWS {
            return Err(AcquisitionError::Count {
                role: LineRole::Row,
                expected: ROWS,
                found: rows.len(),
            });
        }
        if cols.len() != COLS {
            return Err(AcquisitionError::Count {
                role: LineRole::Col,
                expected: COLS,
                found: cols.len(),
            });
        }

        let row_lines = rows
            .iter()
            .map(|spec| {
                acquire_row(driver, spec, options).map_err(|source| AcquisitionError::Line {
                    role: LineRole::Row,
                    line: spec.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let col_lines = cols
            .iter()
            .map(|spec| {
                acquire_col(driver, spec, options).map_err(|source| AcquisitionError::Line {
                    role: LineRole::Col,
                    line: spec.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let found_rows = row_lines.len();
        let found_cols = col_lines.len();
        let rows = row_lines.try_into().map_err(|_| AcquisitionError::Count {
            role: LineRole::Row,
            expected: ROWS,
            found: found_rows,
        })?;
        let cols = col_lines.try_into().map_err(|_| AcquisitionError::Count {
            role: LineRole::Col,
            expected: COLS,
            found: found_cols,
        })?;

        let lines = Self::from_lines(rows, cols);
        debug!("Acquired keypad lines: {}", lines.describe());
        Ok(lines)
    }

    /// Builds a line set from lines that are already configured.
    pub fn from_lines(rows: [Box<dyn GpioOutput>; ROWS], cols: [Arc<dyn GpioInput>; COLS]) -> Self {
        Self {
            rows,
            cols,
            signals: Arc::new(std::array::from_fn(|_| EdgeSignal::default())),
        }
    }

    /// Drives one row to the active or inactive level.
    pub fn drive(&self, row: usize, active: bool) -> Result<(), ScanIoError> {
        self.rows
            .get(row)
            .ok_or(GpioError::InvalidArgument)
            .and_then(|line| line.write(active))
            .map_err(|source| ScanIoError::Drive { row, source })
    }

    /// Drives every row, in order, stopping at the first failure.
    pub fn drive_all(&self, active: bool) -> Result<(), ScanIoError> {
        (0..ROWS).try_for_each(|row| self.drive(row, active))
    }

    /// Reads whether a column is active.
    pub fn read(&self, col: usize) -> Result<bool, ScanIoError> {
        self.cols
            .get(col)
            .ok_or(GpioError::InvalidArgument)
            .and_then(|line| line.read())
            .map_err(|source| ScanIoError::Read { col, source })
    }

    /// Enables edge notifications for a column. Arming an armed column does nothing.
    pub fn arm_signal(&self, col: usize) {
        if let Some(signal) = self.signals.get(col) {
            signal.arm();
        }
    }

    /// Suppresses edge notifications for a column.
    pub fn disarm_signal(&self, col: usize) {
        if let Some(signal) = self.signals.get(col) {
            signal.disarm();
        }
    }

    pub fn is_armed(&self, col: usize) -> bool {
        self.signals.get(col).is_some_and(EdgeSignal::is_armed)
    }

    /// Gets the column signals, for the context that receives the edges.
    pub fn signals(&self) -> Arc<[EdgeSignal; COLS]> {
        self.signals.clone()
    }

    /// Gets shared handles to the column inputs, for sampling edges.
    pub fn columns(&self) -> [Arc<dyn GpioInput>; COLS] {
        self.cols.clone()
    }

    /// Describes the line identifiers, for diagnostics.
    pub fn describe(&self) -> String {
        let rows = self.rows.iter().map(|line| line.index()).collect::<Vec<_>>();
        let cols = self.cols.iter().map(|line| line.index()).collect::<Vec<_>>();
        format!("rows {:?}, cols {:?}", rows, cols)
    }
}

impl<const ROWS: usize, const COLS: usize> Debug for LineSet<ROWS, COLS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LineSet({})", self.describe())
    }
}
