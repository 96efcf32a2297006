//! A software keypad matrix, for running the keypad stack without hardware.
//!
//! Lines `0..rows` are the row lines (named `row0`, `row1`, ...), followed by the column lines
//! (`col0`, `col1`, ...). Levels are logical: a column reads active while any pressed key on it
//! sits on a row that is driven active. Faults can be injected per line.
use crate::{
    GpioActiveLevel, GpioBias, GpioDriveMode, GpioDriver, GpioError, GpioInput, GpioOutput, GpioPin, GpioResult,
};
use log::trace;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lets `skip` operations through, then fails the next `times`.
#[derive(Copy, Clone, Default)]
struct Fault {
    skip: usize,
    times: usize,
}

impl Fault {
    fn trips(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            false
        } else if self.times > 0 {
            self.times -= 1;
            true
        } else {
            false
        }
    }
}

struct SimState {
    rows: usize,
    cols: usize,
    claimed: Vec<bool>,
    unavailable: Vec<bool>,
    outputs: Vec<bool>,
    pressed: Vec<bool>,
    write_faults: Vec<Fault>,
    read_faults: Vec<Fault>,
    writes: Vec<(usize, bool)>,
}

impl SimState {
    fn column_level(&self, col: usize) -> bool {
        (0..self.rows).any(|row| self.outputs[row] && self.pressed[row * self.cols + col])
    }
}

/// Simulated `rows` × `cols` membrane keypad.
#[derive(Clone)]
pub struct SimMatrix {
    state: Arc<Mutex<SimState>>,
}

impl SimMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        let lines = rows + cols;
        Self {
            state: Arc::new(Mutex::new(SimState {
                rows,
                cols,
                claimed: vec![false; lines],
                unavailable: vec![false; lines],
                outputs: vec![false; lines],
                pressed: vec![false; rows * cols],
                write_faults: vec![Fault::default(); lines],
                read_faults: vec![Fault::default(); lines],
                writes: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rows(&self) -> usize {
        self.lock().rows
    }

    /// Gets the line index of the given row.
    pub fn row_line(&self, row: usize) -> usize {
        row
    }

    /// Gets the line index of the given column.
    pub fn col_line(&self, col: usize) -> usize {
        self.lock().rows + col
    }

    pub fn press(&self, row: usize, col: usize) {
        self.set_pressed(row, col, true);
    }

    pub fn release(&self, row: usize, col: usize) {
        self.set_pressed(row, col, false);
    }

    fn set_pressed(&self, row: usize, col: usize, pressed: bool) {
        let mut state = self.lock();
        if row < state.rows && col < state.cols {
            let cols = state.cols;
            state.pressed[row * cols + col] = pressed;
        }
    }

    /// Makes the next `times` writes to the line fail.
    pub fn fail_writes(&self, line: usize, times: usize) {
        self.fail_writes_after(line, 0, times);
    }

    /// Lets `skip` writes to the line succeed, then makes the next `times` fail.
    pub fn fail_writes_after(&self, line: usize, skip: usize, times: usize) {
        self.lock().write_faults[line] = Fault { skip, times };
    }

    /// Makes the next `times` reads of the line fail.
    pub fn fail_reads(&self, line: usize, times: usize) {
        self.fail_reads_after(line, 0, times);
    }

    /// Lets `skip` reads of the line succeed, then makes the next `times` fail.
    pub fn fail_reads_after(&self, line: usize, skip: usize, times: usize) {
        self.lock().read_faults[line] = Fault { skip, times };
    }

    /// Refuses to hand out the line, as if another consumer held it.
    pub fn set_unavailable(&self, line: usize, unavailable: bool) {
        self.lock().unavailable[line] = unavailable;
    }

    pub fn is_claimed(&self, line: usize) -> bool {
        self.lock().claimed[line]
    }

    pub fn claimed_count(&self) -> usize {
        self.lock().claimed.iter().filter(|&&claimed| claimed).count()
    }

    /// Gets the logical level a row line is driven to.
    pub fn row_level(&self, row: usize) -> bool {
        self.lock().outputs[row]
    }

    /// Gets the logical level a column line would read right now.
    pub fn column_level(&self, col: usize) -> bool {
        self.lock().column_level(col)
    }

    /// Takes every successful write since the last call, as `(line, value)` pairs.
    pub fn take_writes(&self) -> Vec<(usize, bool)> {
        std::mem::take(&mut self.lock().writes)
    }
}

impl Debug for SimMatrix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        write!(f, "SimMatrix({}x{})", state.rows, state.cols)
    }
}

impl GpioDriver for SimMatrix {
    fn count(&self) -> GpioResult<usize> {
        let state = self.lock();
        Ok(state.rows + state.cols)
    }

    fn line_name(&self, index: usize) -> GpioResult<Option<String>> {
        let state = self.lock();
        if index < state.rows {
            Ok(Some(format!("row{}", index)))
        } else if index < state.rows + state.cols {
            Ok(Some(format!("col{}", index - state.rows)))
        } else {
            Err(GpioError::InvalidArgument)
        }
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin>> {
        let mut state = self.lock();
        if index >= state.claimed.len() {
            return Err(GpioError::InvalidArgument);
        }
        if state.claimed[index] || state.unavailable[index] {
            return Err(GpioError::AlreadyInUse);
        }
        state.claimed[index] = true;
        drop(state);
        trace!("{:?} claimed line {}", self, index);

        Ok(Box::new(SimPin {
            claim: SimClaim {
                matrix: self.clone(),
                index,
            },
        }))
    }
}

struct SimClaim {
    matrix: SimMatrix,
    index: usize,
}

impl Debug for SimClaim {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.matrix, self.index)
    }
}

impl Drop for SimClaim {
    fn drop(&mut self) {
        self.matrix.lock().claimed[self.index] = false;
    }
}

struct SimPin {
    claim: SimClaim,
}

impl Debug for SimPin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.claim)
    }
}

impl GpioPin for SimPin {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn into_input(self: Box<Self>) -> GpioResult<Box<dyn GpioInput>> {
        Ok(Box::new(SimLine { claim: self.claim }))
    }

    fn into_output(self: Box<Self>, initial: bool) -> GpioResult<Box<dyn GpioOutput>> {
        if self.claim.index >= self.claim.matrix.rows() {
            return Err(GpioError::NotSupported);
        }
        let line = SimLine { claim: self.claim };
        line.write(initial)?;
        Ok(Box::new(line))
    }

    fn supports_active_level(&self) -> bool {
        true
    }

    // The matrix works on logical levels, so electrical settings are accepted and ignored.
    fn set_active_level(&mut self, _level: GpioActiveLevel) -> GpioResult<()> {
        Ok(())
    }

    fn supports_bias(&self) -> bool {
        true
    }

    fn set_bias(&mut self, _bias: GpioBias) -> GpioResult<()> {
        Ok(())
    }

    fn supports_drive_mode(&self) -> bool {
        true
    }

    fn set_drive_mode(&mut self, _mode: GpioDriveMode) -> GpioResult<()> {
        Ok(())
    }
}

struct SimLine {
    claim: SimClaim,
}

impl Debug for SimLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.claim)
    }
}

impl GpioInput for SimLine {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn read(&self) -> GpioResult<bool> {
        let index = self.claim.index;
        let mut state = self.claim.matrix.lock();
        if state.read_faults[index].trips() {
            return Err(GpioError::Io(std::io::ErrorKind::Other));
        }
        if index < state.rows {
            Ok(state.outputs[index])
        } else {
            Ok(state.column_level(index - state.rows))
        }
    }
}

impl GpioOutput for SimLine {
    fn index(&self) -> usize {
        self.claim.index
    }

    fn write(&self, value: bool) -> GpioResult<()> {
        let index = self.claim.index;
        let mut state = self.claim.matrix.lock();
        if state.write_faults[index].trips() {
            return Err(GpioError::Io(std::io::ErrorKind::Other));
        }
        state.outputs[index] = value;
        state.writes.push((index, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_follows_pressed_key_on_active_row() {
        let matrix = SimMatrix::new(4, 4);
        let row = matrix.get_pin(matrix.row_line(2)).unwrap().into_output(false).unwrap();
        let col = matrix.get_pin(matrix.col_line(1)).unwrap().into_input().unwrap();

        matrix.press(2, 1);
        assert!(!col.read().unwrap());
        row.write(true).unwrap();
        assert!(col.read().unwrap());
        matrix.release(2, 1);
        assert!(!col.read().unwrap());
    }

    #[test]
    fn claims_are_released_on_drop() {
        let matrix = SimMatrix::new(4, 4);
        let pin = matrix.get_pin(5).unwrap();
        assert_eq!(matrix.get_pin(5).unwrap_err(), GpioError::AlreadyInUse);
        let input = pin.into_input().unwrap();
        assert!(matrix.is_claimed(5));
        drop(input);
        assert!(!matrix.is_claimed(5));
        assert_eq!(matrix.claimed_count(), 0);
    }

    #[test]
    fn injected_faults_are_one_shot() {
        let matrix = SimMatrix::new(4, 4);
        let row = matrix.get_pin(3).unwrap().into_output(true).unwrap();
        matrix.fail_writes(3, 1);
        assert!(row.write(false).is_err());
        assert!(row.write(false).is_ok());
        assert!(!matrix.row_level(3));
    }

    #[test]
    fn lines_are_found_by_name() {
        let matrix = SimMatrix::new(4, 4);
        assert_eq!(matrix.find_line("row3"), Ok(3));
        assert_eq!(matrix.find_line("col0"), Ok(4));
        assert_eq!(matrix.find_line("led"), Err(GpioError::NotFound("led".to_string())));
    }
}
