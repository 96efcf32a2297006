//! Edge notifications for input lines.
//!
//! Each watched line owns an [EdgeSignal] that can be armed and disarmed independently.
//! An [EdgeWatcher] waits on each line from its own thread and calls a handler when an armed
//! line goes through the configured transition.
use crate::{GpioError, GpioInput};
use log::{debug, warn};
use thiserror::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Which logical transition counts as an edge.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Edge {
    /// Inactive to active.
    #[default] Rising,
    /// Active to inactive.
    Falling,
    Both,
}

impl Edge {
    pub fn matches(&self, previous: bool, current: bool) -> bool {
        match self {
            Edge::Rising => !previous && current,
            Edge::Falling => previous && !current,
            Edge::Both => previous != current,
        }
    }

    /// Whether an edge reported by the line counts.
    pub fn accepts(&self, reported: Edge) -> bool {
        *self == Edge::Both || *self == reported
    }
}

/// Enables or suppresses edge notifications for one line.
#[derive(Debug, Default)]
pub struct EdgeSignal {
    armed: AtomicBool,
}

impl EdgeSignal {
    /// Arms the signal. Returns whether it was disarmed before.
    pub fn arm(&self) -> bool {
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Disarms the signal. Returns whether it was armed before.
    pub fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Shortest sampling interval the watcher runs at.
pub const MIN_INTERVAL: Duration = Duration::from_micros(100);

/// How long a line that reports its own edges is waited on before the stop flag is checked.
pub const EVENT_WAIT: Duration = Duration::from_millis(50);

/// A watched input could not be registered.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
#[error("failed to watch input {index}: {source}")]
pub struct WatchError {
    /// Position of the input in the watched set.
    pub index: usize,
    #[source]
    pub source: GpioError,
}

/// Samples a fixed set of inputs and reports edges on armed ones.
///
/// Every input gets its own thread. Inputs that report edges by themselves wake their thread
/// as soon as an edge arrives; the others are sampled every interval.
#[derive(Debug)]
pub struct EdgeWatcher {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl EdgeWatcher {
    /// Spawns one watcher thread per input, named `{name}-{index}`.
    ///
    /// `signals[i]` gates `inputs[i]`. A line only fires after it has been sampled at least once
    /// while armed, so transitions that happened while it was disarmed are never reported.
    /// The handler runs on the watcher threads and receives the index of the line.
    ///
    /// Every input is read once up front; the first one that cannot be read fails the call.
    /// A thread that cannot be started is reported against its input. `interval` is raised to
    /// [MIN_INTERVAL].
    pub fn spawn<const N: usize, S, F>(
        name: &str,
        inputs: [Arc<dyn GpioInput>; N],
        signals: S,
        edge: Edge,
        interval: Duration,
        handler: F,
    ) -> Result<Self, WatchError>
    where
        S: AsRef<[EdgeSignal; N]> + Send + Sync + 'static,
        F: Fn(usize) + Send + Sync + 'static,
    {
        for (index, input) in inputs.iter().enumerate() {
            input.read().map_err(|source| WatchError { index, source })?;
        }
        let interval = interval.max(MIN_INTERVAL);

        let signals = Arc::new(signals);
        let handler = Arc::new(handler);
        // Dropping a partially started watcher stops the threads it already has.
        let mut watcher = Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(N),
        };

        for (index, input) in inputs.into_iter().enumerate() {
            let line = WatchedLine {
                index,
                wait: if input.reports_edges() { EVENT_WAIT } else { interval },
                input,
                edge,
            };
            let stop = watcher.stop.clone();
            let signals = signals.clone();
            let handler = handler.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    let signals: &[EdgeSignal; N] = (*signals).as_ref();
                    line.run(&signals[line.index], &stop, &*handler);
                })
                .map_err(|e| WatchError {
                    index,
                    source: e.into(),
                })?;
            watcher.handles.push(handle);
        }

        Ok(watcher)
    }

    /// Stops sampling and waits for the threads to exit.
    ///
    /// No handler call is in progress once this returns.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Edge watcher thread panicked.");
            }
        }
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchedLine {
    index: usize,
    input: Arc<dyn GpioInput>,
    edge: Edge,
    wait: Duration,
}

impl WatchedLine {
    fn run(&self, signal: &EdgeSignal, stop: &AtomicBool, handler: &dyn Fn(usize)) {
        // `None` until the line has been sampled while armed.
        let mut last: Option<bool> = None;

        while !stop.load(Ordering::Acquire) {
            let reported = match self.input.wait_edges(self.wait) {
                Ok(edges) => edges,
                Err(e) => {
                    warn!("Failed to wait for edges on {:?}: {}", self.input, e);
                    thread::sleep(self.wait);
                    continue;
                }
            };

            if !signal.is_armed() {
                last = None;
                continue;
            }

            let current = match self.input.read() {
                Ok(value) => value,
                Err(e) => {
                    warn!("Failed to sample {:?}: {}", self.input, e);
                    continue;
                }
            };

            let previous = last.replace(current);
            if let Some(previous) = previous {
                let fired = self.edge.matches(previous, current)
                    || reported.iter().any(|&edge| self.edge.accepts(edge));
                if fired && signal.is_armed() {
                    handler(self.index);
                }
            }
        }

        debug!("Edge watcher for line {} stopped.", self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GpioDriver;
    use crate::sim::SimMatrix;
    use std::sync::mpsc;

    #[test]
    fn edges_match_direction() {
        assert!(Edge::Rising.matches(false, true));
        assert!(!Edge::Rising.matches(true, false));
        assert!(Edge::Falling.matches(true, false));
        assert!(Edge::Both.matches(true, false));
        assert!(!Edge::Both.matches(true, true));

        assert!(Edge::Rising.accepts(Edge::Rising));
        assert!(!Edge::Rising.accepts(Edge::Falling));
        assert!(Edge::Both.accepts(Edge::Falling));
    }

    /// A line that reports queued edges, like a kernel edge request, without changing level.
    #[derive(Debug, Default)]
    struct ReportingLine {
        level: AtomicBool,
        queued: std::sync::Mutex<Vec<Edge>>,
    }

    impl GpioInput for ReportingLine {
        fn index(&self) -> usize {
            0
        }

        fn read(&self) -> crate::GpioResult<bool> {
            Ok(self.level.load(Ordering::Acquire))
        }

        fn reports_edges(&self) -> bool {
            true
        }

        fn wait_edges(&self, timeout: Duration) -> crate::GpioResult<Vec<Edge>> {
            thread::sleep(timeout.min(Duration::from_millis(1)));
            Ok(std::mem::take(&mut *self.queued.lock().unwrap()))
        }
    }

    fn watch_reporting(line: &Arc<ReportingLine>, signals: &Arc<[EdgeSignal; 1]>) -> (EdgeWatcher, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel();
        let input: Arc<dyn GpioInput> = line.clone();
        let watcher = EdgeWatcher::spawn(
            "test-edge",
            [input],
            signals.clone(),
            Edge::Rising,
            Duration::from_millis(1),
            move |i| tx.send(i).unwrap(),
        )
        .unwrap();
        (watcher, rx)
    }

    #[test]
    fn reported_edge_fires_without_a_level_change() {
        let line = Arc::new(ReportingLine::default());
        let signals = Arc::new([EdgeSignal::default()]);
        signals[0].arm();
        let (_watcher, rx) = watch_reporting(&line, &signals);

        thread::sleep(Duration::from_millis(20));
        line.queued.lock().unwrap().extend([Edge::Falling]);
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());

        line.queued.lock().unwrap().extend([Edge::Rising, Edge::Falling]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0));
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn edges_reported_while_disarmed_are_dropped() {
        let line = Arc::new(ReportingLine::default());
        let signals = Arc::new([EdgeSignal::default()]);
        let (_watcher, rx) = watch_reporting(&line, &signals);

        thread::sleep(Duration::from_millis(10));
        line.queued.lock().unwrap().push(Edge::Rising);
        thread::sleep(Duration::from_millis(20));
        signals[0].arm();
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn arming_is_idempotent() {
        let signal = EdgeSignal::default();
        assert!(signal.arm());
        assert!(!signal.arm());
        assert!(signal.is_armed());
        assert!(signal.disarm());
        assert!(!signal.disarm());
        assert!(!signal.is_armed());
    }

    #[test]
    fn unreadable_input_fails_the_spawn() {
        let matrix = SimMatrix::new(1, 2);
        let _row = matrix.get_pin(0).unwrap().into_output(true).unwrap();
        let inputs: [Arc<dyn GpioInput>; 2] =
            [1, 2].map(|line| Arc::from(matrix.get_pin(line).unwrap().into_input().unwrap()));
        matrix.fail_reads(2, 1);

        let err = EdgeWatcher::spawn(
            "test-edge",
            inputs,
            Arc::new([EdgeSignal::default(), EdgeSignal::default()]),
            Edge::Rising,
            Duration::from_millis(1),
            |_| {},
        )
        .unwrap_err();
        assert_eq!(err, WatchError { index: 1, source: GpioError::Io(std::io::ErrorKind::Other) });
    }

    #[test]
    fn zero_interval_still_fires() {
        let matrix = SimMatrix::new(1, 1);
        let _row = matrix.get_pin(0).unwrap().into_output(true).unwrap();
        let col: Arc<dyn GpioInput> = Arc::from(matrix.get_pin(1).unwrap().into_input().unwrap());
        let signals = Arc::new([EdgeSignal::default()]);
        signals[0].arm();

        let (tx, rx) = mpsc::channel();
        let _watcher = EdgeWatcher::spawn(
            "test-edge",
            [col],
            signals,
            Edge::Rising,
            Duration::ZERO,
            move |i| tx.send(i).unwrap(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        matrix.press(0, 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0));
    }

    #[test]
    fn double_armed_line_fires_once_per_edge() {
        let matrix = SimMatrix::new(1, 1);
        let row = matrix.get_pin(0).unwrap().into_output(true).unwrap();
        let col: Arc<dyn GpioInput> = Arc::from(matrix.get_pin(1).unwrap().into_input().unwrap());
        let signals = Arc::new([EdgeSignal::default()]);
        signals[0].arm();
        signals[0].arm();

        let (tx, rx) = mpsc::channel();
        let mut watcher = EdgeWatcher::spawn(
            "test-edge",
            [col],
            signals.clone(),
            Edge::Rising,
            Duration::from_millis(1),
            move |i| tx.send(i).unwrap(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        matrix.press(0, 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(0));
        thread::sleep(Duration::from_millis(20));
        watcher.stop();

        assert!(rx.try_recv().is_err());
        assert!(row.write(false).is_ok());
    }

    #[test]
    fn transitions_while_disarmed_are_dropped() {
        let matrix = SimMatrix::new(1, 1);
        let _row = matrix.get_pin(0).unwrap().into_output(true).unwrap();
        let col: Arc<dyn GpioInput> = Arc::from(matrix.get_pin(1).unwrap().into_input().unwrap());
        let signals = Arc::new([EdgeSignal::default()]);

        let (tx, rx) = mpsc::channel();
        let _watcher = EdgeWatcher::spawn(
            "test-edge",
            [col],
            signals.clone(),
            Edge::Rising,
            Duration::from_millis(1),
            move |i| tx.send(i).unwrap(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(10));
        matrix.press(0, 0);
        thread::sleep(Duration::from_millis(10));
        signals[0].arm();
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }
}
