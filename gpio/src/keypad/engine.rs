use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;
use log::{debug, error, trace, warn};
use thiserror::Error;
use crate::GpioError;
use crate::debounce::DeferredWork;
use crate::edge::{Edge, EdgeSignal};
use crate::keypad::{EventSink, KEY_RESERVED, KeyEvent, KeyMap, LineSet};

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum ScanIoError {
    #[error("failed to drive row {row}: {source}")]
    Drive {
        row: usize,
        #[source]
        source: GpioError,
    },
    #[error("failed to read column {col}: {source}")]
    Read {
        col: usize,
        #[source]
        source: GpioError,
    },
}

/// Where the scan engine is in its cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ScanState {
    /// Rows rest active and every column signal is armed.
    Idle = 0,
    /// An edge was seen; signals are disarmed and a scan is scheduled.
    Debouncing = 1,
    /// A scan pass is driving the rows.
    Scanning = 2,
}

impl ScanState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Debouncing,
            2 => ScanState::Scanning,
            _ => ScanState::Idle,
        }
    }
}

/// Timing and edge configuration of the scan engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScanConfig {
    /// Delay between an edge and the scan pass.
    pub debounce: Duration,
    /// Delay between driving a row and sampling the columns.
    pub settle: Duration,
    /// How often columns without edge detection are sampled.
    pub poll_interval: Duration,
    /// Which column transition starts a scan.
    pub edge: Edge,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(5),
            settle: Duration::from_micros(10),
            poll_interval: Duration::from_millis(1),
            edge: Edge::Rising,
        }
    }
}

impl ScanConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edge = edge;
        self
    }
}

/// State shared between the edge context and the scan worker.
pub struct ScanStatus<const COLS: usize> {
    state: AtomicU8,
    detached: Mutex<bool>,
    signals: Arc<[EdgeSignal; COLS]>,
}

impl<const COLS: usize> ScanStatus<COLS> {
    fn new(signals: Arc<[EdgeSignal; COLS]>) -> Self {
        Self {
            state: AtomicU8::new(ScanState::Idle as u8),
            detached: Mutex::new(false),
            signals,
        }
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ScanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ScanState, to: ScanState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_armed(&self, col: usize) -> bool {
        self.signals.get(col).is_some_and(EdgeSignal::is_armed)
    }

    pub fn signals(&self) -> Arc<[EdgeSignal; COLS]> {
        self.signals.clone()
    }

    pub(crate) fn disarm_all(&self) {
        self.signals.iter().for_each(|signal| {
            signal.disarm();
        });
    }

    pub fn is_detached(&self) -> bool {
        *self.detached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the engine from delivering or re-arming anything.
    ///
    /// Waits for a delivery that is already in progress to finish.
    pub(crate) fn detach(&self) {
        *self.detached.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Runs `f` unless detached, holding off [Self::detach] until it returns.
    /// Returns whether `f` ran.
    fn unless_detached(&self, f: impl FnOnce()) -> bool {
        let detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        if *detached {
            return false;
        }
        f();
        true
    }
}

impl<const COLS: usize> Debug for ScanStatus<COLS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let armed = self.signals.iter().map(EdgeSignal::is_armed).collect::<Vec<_>>();
        write!(f, "ScanStatus({:?}, armed {:?})", self.state(), armed)
    }
}

/// Entry point for column edges.
///
/// Only flips the state, disarms the columns and schedules the scan; it never touches the rows.
pub struct ScanTrigger<const COLS: usize> {
    status: Arc<ScanStatus<COLS>>,
    work: Arc<dyn DeferredWork>,
    debounce: Duration,
}

impl<const COLS: usize> ScanTrigger<COLS> {
    pub fn new(status: Arc<ScanStatus<COLS>>, work: Arc<dyn DeferredWork>, debounce: Duration) -> Self {
        Self { status, work, debounce }
    }

    /// Handles an edge on `col`. Returns whether a scan was scheduled.
    pub fn on_edge(&self, col: usize) -> bool {
        if self.status.is_detached() || !self.status.transition(ScanState::Idle, ScanState::Debouncing) {
            trace!("Ignoring edge on column {} while {:?}", col, self.status.state());
            return false;
        }

        self.status.disarm_all();
        trace!("Edge on column {}, scanning in {:?}", col, self.debounce);
        if !self.work.schedule(self.debounce) {
            warn!("Scan was already scheduled when column {} fired.", col);
        }
        true
    }
}

impl<const COLS: usize> Debug for ScanTrigger<COLS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScanTrigger({:?}, {:?})", self.status, self.work)
    }
}

/// Owns the matrix lines and runs scan passes.
pub struct ScanEngine<const ROWS: usize, const COLS: usize> {
    lines: LineSet<ROWS, COLS>,
    keymap: KeyMap<ROWS, COLS>,
    sink: Box<dyn EventSink>,
    status: Arc<ScanStatus<COLS>>,
    debounce: Duration,
    settle: Duration,
    pending: Vec<KeyEvent>,
}

impl<const ROWS: usize, const COLS: usize> ScanEngine<ROWS, COLS> {
    pub fn new(
        lines: LineSet<ROWS, COLS>,
        keymap: KeyMap<ROWS, COLS>,
        sink: Box<dyn EventSink>,
        config: &ScanConfig,
    ) -> Self {
        let status = Arc::new(ScanStatus::new(lines.signals()));
        Self {
            lines,
            keymap,
            sink,
            status,
            debounce: config.debounce,
            settle: config.settle,
            // At most one click (press and release) per row.
            pending: Vec::with_capacity(ROWS * 2),
        }
    }

    pub fn status(&self) -> Arc<ScanStatus<COLS>> {
        self.status.clone()
    }

    /// Creates the edge entry point, scheduling scans through `work`.
    pub fn trigger(&self, work: Arc<dyn DeferredWork>) -> ScanTrigger<COLS> {
        ScanTrigger::new(self.status.clone(), work, self.debounce)
    }

    /// Puts the matrix at rest and arms every column.
    pub fn start(&mut self) -> Result<(), ScanIoError> {
        self.lines.drive_all(true)?;
        self.status.set_state(ScanState::Idle);
        (0..COLS).for_each(|col| self.lines.arm_signal(col));
        Ok(())
    }

    /// Runs one scan pass and returns to idle.
    ///
    /// Meant to run as the debounce work. A failed pass delivers nothing and still leaves the
    /// matrix at rest with the columns armed.
    pub fn run_pass(&mut self) {
        if self.status.is_detached() {
            return;
        }
        if !self.status.transition(ScanState::Debouncing, ScanState::Scanning) {
            warn!("Scan requested while {:?}, skipping.", self.status.state());
            return;
        }

        match self.scan() {
            Ok(()) if self.pending.is_empty() => debug!("Scan pass found no key."),
            Ok(()) => {}
            Err(e) => {
                warn!("Scan pass aborted: {}", e);
                self.pending.clear();
                self.restore_rest();
            }
        }

        self.status.set_state(ScanState::Idle);
        let lines = &self.lines;
        let sink = &mut self.sink;
        let pending = &self.pending;
        let delivered = self.status.unless_detached(|| {
            if !pending.is_empty() {
                sink.emit(pending);
            }
            (0..COLS).for_each(|col| lines.arm_signal(col));
        });
        if !delivered && !pending.is_empty() {
            debug!("Keypad detached during the pass, dropping {} events.", pending.len());
        }
        self.pending.clear();
    }

    fn scan(&mut self) -> Result<(), ScanIoError> {
        self.pending.clear();
        self.lines.drive_all(false)?;

        for row in 0..ROWS {
            self.lines.drive(row, true)?;
            if !self.settle.is_zero() {
                thread::sleep(self.settle);
            }

            for col in 0..COLS {
                if !self.lines.read(col)? {
                    continue;
                }

                let code = self.keymap.lookup(col, row);
                trace!("Row {} col {} -> {:#06X}", row, col, code);
                if code == KEY_RESERVED {
                    debug!("No key mapped at row {} col {}.", row, col);
                } else {
                    self.pending.push(KeyEvent::press(code));
                    self.pending.push(KeyEvent::release(code));
                }
                // Only the lowest active column of a row is reported.
                break;
            }

            self.lines.drive(row, false)?;
        }

        self.lines.drive_all(true)
    }

    /// Drives every row active, carrying on past failures.
    fn restore_rest(&self) {
        for row in 0..ROWS {
            if let Err(e) = self.lines.drive(row, true) {
                error!("Could not restore the keypad at rest: {}", e);
            }
        }
    }
}

impl<const ROWS: usize, const COLS: usize> Debug for ScanEngine<ROWS, COLS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScanEngine({:?}, {:?})", self.lines, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LineSpec;
    use crate::keypad::{ChannelSink, DeviceIdentity, KeyCode, LineOptions, encode};
    use crate::sim::SimMatrix;
    use std::sync::Mutex;
    use std::sync::mpsc::Receiver;

    #[derive(Debug, Default)]
    struct RecordingWork {
        scheduled: Mutex<Vec<Duration>>,
    }

    impl DeferredWork for RecordingWork {
        fn schedule(&self, delay: Duration) -> bool {
            self.scheduled.lock().unwrap().push(delay);
            true
        }

        fn cancel(&self) {}
    }

    struct Rig {
        matrix: SimMatrix,
        engine: ScanEngine<4, 4>,
        trigger: ScanTrigger<4>,
        work: Arc<RecordingWork>,
        rx: Receiver<Vec<KeyEvent>>,
    }

    impl Rig {
        fn new(entries: &[u32]) -> Self {
            let matrix = SimMatrix::new(4, 4);
            let rows = (0..4).map(LineSpec::Offset).collect::<Vec<_>>();
            let cols = (4..8).map(LineSpec::Offset).collect::<Vec<_>>();
            let lines = LineSet::acquire(&matrix, &rows, &cols, &LineOptions::default()).unwrap();
            let keymap = KeyMap::build(entries).unwrap();
            let (sink, rx) = ChannelSink::new();
            let config = ScanConfig::default().with_settle(Duration::ZERO);

            let mut engine = ScanEngine::new(lines, keymap, Box::new(sink), &config);
            engine.start().unwrap();
            let work = Arc::new(RecordingWork::default());
            let trigger = engine.trigger(work.clone());
            Self { matrix, engine, trigger, work, rx }
        }

        fn state(&self) -> ScanState {
            self.engine.status().state()
        }

        fn armed(&self) -> Vec<bool> {
            (0..4).map(|col| self.engine.status().is_armed(col)).collect()
        }

        fn assert_idle(&self) {
            assert_eq!(self.state(), ScanState::Idle);
            assert_eq!(self.armed(), vec![true; 4]);
            assert!((0..4).all(|row| self.matrix.row_level(row)));
        }

        fn click(&mut self, row: usize, col: usize) -> Vec<KeyEvent> {
            self.matrix.press(row, col);
            assert!(self.trigger.on_edge(col));
            self.engine.run_pass();
            self.matrix.release(row, col);
            self.rx.try_recv().unwrap_or_default()
        }
    }

    fn unique_keymap() -> Vec<u32> {
        (0..4u8)
            .flat_map(|row| (0..4u8).map(move |col| encode(row, col, 0x100 + (row * 4 + col) as u16)))
            .collect()
    }

    #[test]
    fn single_key_press() {
        let mut rig = Rig::new(&[encode(2, 1, 0x1E)]);
        rig.assert_idle();

        rig.matrix.press(2, 1);
        assert!(rig.trigger.on_edge(1));
        assert_eq!(rig.state(), ScanState::Debouncing);
        assert_eq!(rig.armed(), vec![false; 4]);
        assert_eq!(*rig.work.scheduled.lock().unwrap(), vec![Duration::from_millis(5)]);

        rig.engine.run_pass();
        assert_eq!(rig.rx.try_recv(), Ok(vec![KeyEvent::press(0x1E), KeyEvent::release(0x1E)]));
        rig.assert_idle();
    }

    #[test]
    fn edges_are_ignored_outside_idle() {
        let mut rig = Rig::new(&[encode(0, 0, 2)]);
        rig.matrix.press(0, 0);
        assert!(rig.trigger.on_edge(0));
        assert!(!rig.trigger.on_edge(0));
        assert!(!rig.trigger.on_edge(3));
        assert_eq!(rig.work.scheduled.lock().unwrap().len(), 1);

        rig.engine.run_pass();
        assert_eq!(rig.rx.try_recv().map(|batch| batch.len()), Ok(2));
        assert!(rig.rx.try_recv().is_err());
    }

    #[test]
    fn pass_without_edge_is_skipped() {
        let mut rig = Rig::new(&[encode(0, 0, 2)]);
        rig.matrix.press(0, 0);
        rig.matrix.take_writes();
        rig.engine.run_pass();
        assert!(rig.matrix.take_writes().is_empty());
        assert!(rig.rx.try_recv().is_err());
        rig.assert_idle();
    }

    #[test]
    fn same_row_reports_lowest_column_only() {
        let mut rig = Rig::new(&[encode(0, 0, 2), encode(0, 2, 4)]);
        rig.matrix.press(0, 0);
        rig.matrix.press(0, 2);
        assert!(rig.trigger.on_edge(0));
        rig.engine.run_pass();

        assert_eq!(rig.rx.try_recv(), Ok(vec![KeyEvent::press(2), KeyEvent::release(2)]));
        rig.assert_idle();
    }

    #[test]
    fn keys_on_different_rows_share_a_batch() {
        let mut rig = Rig::new(&unique_keymap());
        rig.matrix.press(3, 0);
        rig.matrix.press(1, 2);
        assert!(rig.trigger.on_edge(0));
        rig.engine.run_pass();

        assert_eq!(
            rig.rx.try_recv(),
            Ok(vec![
                KeyEvent::press(0x106),
                KeyEvent::release(0x106),
                KeyEvent::press(0x10C),
                KeyEvent::release(0x10C),
            ])
        );
    }

    #[test]
    fn drive_failure_discards_the_pass() {
        let mut rig = Rig::new(&[encode(0, 0, 2), encode(3, 1, 5)]);
        rig.matrix.press(0, 0);
        // The clearing write goes through, driving row 3 for its turn fails.
        rig.matrix.fail_writes_after(3, 1, 1);
        assert!(rig.trigger.on_edge(0));
        rig.engine.run_pass();

        assert!(rig.rx.try_recv().is_err());
        rig.assert_idle();

        rig.matrix.release(0, 0);
        assert_eq!(rig.click(3, 1), vec![KeyEvent::press(5), KeyEvent::release(5)]);
        rig.assert_idle();
    }

    #[test]
    fn read_failure_discards_the_pass() {
        let mut rig = Rig::new(&[encode(1, 1, 7)]);
        rig.matrix.press(1, 1);
        rig.matrix.fail_reads(rig.matrix.col_line(1), 1);
        assert!(rig.trigger.on_edge(1));
        rig.engine.run_pass();

        assert!(rig.rx.try_recv().is_err());
        rig.assert_idle();

        assert_eq!(rig.click(1, 1), vec![KeyEvent::press(7), KeyEvent::release(7)]);
    }

    #[test]
    fn unmapped_key_stops_its_row_silently() {
        let mut rig = Rig::new(&[encode(0, 3, 9)]);
        rig.matrix.press(0, 1);
        rig.matrix.press(0, 3);
        assert!(rig.trigger.on_edge(1));
        rig.engine.run_pass();

        assert!(rig.rx.try_recv().is_err());
        rig.assert_idle();
    }

    #[test]
    fn scan_drives_rows_one_at_a_time() {
        let mut rig = Rig::new(&[]);
        rig.matrix.take_writes();
        rig.matrix.press(0, 0);
        assert!(rig.trigger.on_edge(0));
        rig.engine.run_pass();

        let mut expected = (0..4).map(|row| (row, false)).collect::<Vec<_>>();
        for row in 0..4 {
            expected.push((row, true));
            expected.push((row, false));
        }
        expected.extend((0..4).map(|row| (row, true)));
        assert_eq!(rig.matrix.take_writes(), expected);
    }

    #[test]
    fn full_sweep_reports_every_key_in_order() {
        let mut rig = Rig::new(&unique_keymap());
        let mut events = Vec::new();
        for row in 0..4 {
            for col in 0..4 {
                let batch = rig.click(row, col);
                assert_eq!(batch.len(), 2);
                events.extend(batch);
                rig.assert_idle();
            }
        }

        assert_eq!(events.len(), 32);
        for (i, pair) in events.chunks(2).enumerate() {
            let code = 0x100 + i as u16;
            assert_eq!(pair, [KeyEvent::press(code), KeyEvent::release(code)]);
        }
    }

    #[test]
    fn detached_engine_flushes_nothing() {
        let mut rig = Rig::new(&[encode(0, 0, 2)]);
        rig.matrix.press(0, 0);
        assert!(rig.trigger.on_edge(0));
        rig.engine.status().detach();
        rig.engine.run_pass();

        assert!(rig.rx.try_recv().is_err());
        assert!(!rig.trigger.on_edge(0));
    }

    #[derive(Clone, Default)]
    struct GatedSink {
        log: Arc<Mutex<Vec<&'static str>>>,
        entered: Arc<(Mutex<bool>, std::sync::Condvar)>,
    }

    impl EventSink for GatedSink {
        fn register(&mut self, _identity: &DeviceIdentity, _capabilities: &[KeyCode]) {}

        fn report(&mut self, _event: KeyEvent) {}

        fn sync(&mut self) {
            let (lock, cvar) = &*self.entered;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
            thread::sleep(Duration::from_millis(50));
            self.log.lock().unwrap().push("flushed");
        }
    }

    #[test]
    fn detach_waits_for_a_flush_in_progress() {
        let matrix = SimMatrix::new(4, 4);
        let rows = (0..4).map(LineSpec::Offset).collect::<Vec<_>>();
        let cols = (4..8).map(LineSpec::Offset).collect::<Vec<_>>();
        let lines: LineSet<4, 4> = LineSet::acquire(&matrix, &rows, &cols, &LineOptions::default()).unwrap();
        let keymap = KeyMap::build(&[encode(0, 0, 2)]).unwrap();
        let sink = GatedSink::default();
        let config = ScanConfig::default().with_settle(Duration::ZERO);

        let mut engine = ScanEngine::new(lines, keymap, Box::new(sink.clone()), &config);
        engine.start().unwrap();
        let status = engine.status();
        let trigger = engine.trigger(Arc::new(RecordingWork::default()));
        matrix.press(0, 0);
        assert!(trigger.on_edge(0));

        let pass = thread::spawn(move || engine.run_pass());
        let (lock, cvar) = &*sink.entered;
        drop(cvar.wait_while(lock.lock().unwrap(), |entered| !*entered).unwrap());
        status.detach();
        sink.log.lock().unwrap().push("detached");
        pass.join().unwrap();

        assert_eq!(*sink.log.lock().unwrap(), vec!["flushed", "detached"]);
        // Re-arming happened before the detach went through.
        assert!(status.is_armed(0));
    }

    #[test]
    fn out_of_range_columns_are_not_armed() {
        let rig = Rig::new(&[]);
        assert!(rig.engine.status().is_armed(3));
        assert!(!rig.engine.status().is_armed(4));
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [ScanState::Idle, ScanState::Debouncing, ScanState::Scanning] {
            assert_eq!(ScanState::from_u8(state as u8), state);
        }
    }
}
