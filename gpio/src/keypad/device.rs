use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use log::{debug, info};
use crate::debounce::DelayedWork;
use crate::edge::EdgeWatcher;
use crate::keypad::{
    AcquisitionError, DeviceIdentity, EventSink, KeyCode, KeyMap, KeypadError, LineOptions,
    LineSet, ScanConfig, ScanEngine, ScanState, ScanStatus, ScanTrigger,
};
use crate::{GpioDriver, LineSpec};

/// A keypad brought up on a set of lines.
///
/// Runs two threads: one samples the columns for edges, the other runs the scan passes.
/// Dropping the device detaches it.
pub struct KeypadDevice<const ROWS: usize, const COLS: usize> {
    status: Arc<ScanStatus<COLS>>,
    watcher: Option<EdgeWatcher>,
    work: Option<DelayedWork>,
    capabilities: Vec<KeyCode>,
    description: String,
}

impl<const ROWS: usize, const COLS: usize> KeypadDevice<ROWS, COLS> {
    /// Builds the key map, claims the lines and attaches, in that order.
    pub fn open(
        driver: &dyn GpioDriver,
        rows: &[LineSpec],
        cols: &[LineSpec],
        options: &LineOptions,
        keymap: &[u32],
        sink: Box<dyn EventSink>,
        config: ScanConfig,
    ) -> Result<Self, KeypadError> {
        let keymap = KeyMap::build(keymap)?;
        debug!("Keymap built with {} keys.", keymap.iter().count());
        let lines = LineSet::acquire(driver, rows, cols, options)?;
        Self::attach(lines, keymap, sink, config)
    }

    /// Registers with the sink, puts the matrix at rest, starts the worker and the edge
    /// watcher, and arms the columns.
    ///
    /// On failure nothing keeps running and the lines are released.
    pub fn attach(
        lines: LineSet<ROWS, COLS>,
        keymap: KeyMap<ROWS, COLS>,
        mut sink: Box<dyn EventSink>,
        config: ScanConfig,
    ) -> Result<Self, KeypadError> {
        let description = lines.describe();
        let columns = lines.columns();

        let capabilities = keymap.codes();
        sink.register(&DeviceIdentity::MEMBRANE, &capabilities);

        let mut engine = ScanEngine::new(lines, keymap, sink, &config);
        let status = engine.status();
        engine.start()?;

        let work = DelayedWork::spawn("keypad-scan", move || engine.run_pass())?;
        let trigger = ScanTrigger::new(status.clone(), Arc::new(work.handle()), config.debounce);

        // If this fails, dropping `work` stops the worker and releases the lines.
        let watcher = EdgeWatcher::spawn(
            "keypad-edge",
            columns,
            status.signals(),
            config.edge,
            config.poll_interval,
            move |col| {
                trigger.on_edge(col);
            },
        )
        .map_err(|e| AcquisitionError::Signal {
            col: e.index,
            source: e.source,
        })?;
        info!("Keypad attached ({}).", description);

        Ok(Self {
            status,
            watcher: Some(watcher),
            work: Some(work),
            capabilities,
            description,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &DeviceIdentity::MEMBRANE
    }

    /// Gets every key code the device can report, in ascending order.
    pub fn capabilities(&self) -> &[KeyCode] {
        &self.capabilities
    }

    pub fn state(&self) -> ScanState {
        self.status.state()
    }

    pub fn is_armed(&self, col: usize) -> bool {
        self.status.is_armed(col)
    }

    /// Stops both threads and releases the lines.
    ///
    /// A pending scan is cancelled; a scan in progress completes but delivers nothing.
    pub fn detach(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.watcher.is_none() && self.work.is_none() {
            return;
        }

        self.status.detach();
        self.status.disarm_all();
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        // Joining the worker drops the engine, and with it the lines.
        if let Some(mut work) = self.work.take() {
            work.shutdown();
        }
        info!("Keypad detached ({}).", self.description);
    }
}

impl<const ROWS: usize, const COLS: usize> Debug for KeypadDevice<ROWS, COLS> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeypadDevice({}, {:?})", self.description, self.status)
    }
}

impl<const ROWS: usize, const COLS: usize> Drop for KeypadDevice<ROWS, COLS> {
    fn drop(&mut self) {
        self.teardown();
    }
}
