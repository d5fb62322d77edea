//! Progress bookkeeping.
//!
//! Each node of depth `d` (the number of links before it) tracks a raw value
//! in `[0, d + 1]`. While a link waits on its upstream it mirrors the
//! upstream's raw value, which lies in `[0, d]`; its own callback contributes
//! the last unit. Normalized progress is `raw / (d + 1)`, so every link of a
//! chain of length `n` contributes `1 / n`.
//!
//! Raw values only ever increase. Once a node settles it stops reporting:
//! resolution bumps it to `d + 1` first, rejection and cancelation freeze it
//! where it is.
//!
//! Without the `progress` feature the bookkeeping compiles down to nothing.

#[cfg(feature = "progress")]
use std::sync::Arc;

#[cfg(feature = "progress")]
use parking_lot::Mutex;

/// Receives raw progress values from the node it is subscribed to.
#[cfg(feature = "progress")]
pub(crate) type Listener = Arc<dyn Fn(f64) + Send + Sync>;

/// Converts a raw value of a node at `depth` into `[0, 1]`.
pub(crate) fn normalize(raw: f64, depth: u32) -> f64 {
    (raw / (f64::from(depth) + 1.0)).clamp(0.0, 1.0)
}

// -----------------------------------------------------------------------------
// Per-node progress

pub(crate) struct Progress {
    #[cfg(feature = "progress")]
    inner: Mutex<ProgressInner>,
}

#[cfg(feature = "progress")]
struct ProgressInner {
    raw: f64,
    settled: bool,
    listeners: Vec<Listener>,
}

impl Progress {
    pub(crate) fn new() -> Progress {
        Progress {
            #[cfg(feature = "progress")]
            inner: Mutex::new(ProgressInner {
                raw: 0.0,
                settled: false,
                listeners: Vec::new(),
            }),
        }
    }

    /// The current raw value.
    pub(crate) fn raw(&self) -> f64 {
        #[cfg(feature = "progress")]
        {
            self.inner.lock().raw
        }
        #[cfg(not(feature = "progress"))]
        {
            0.0
        }
    }

    /// Raises the raw value and notifies listeners. Lower values and reports
    /// after settlement are ignored.
    #[cfg(feature = "progress")]
    pub(crate) fn report(&self, raw: f64) {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.settled || raw <= inner.raw {
                return;
            }
            inner.raw = raw;
            inner.listeners.clone()
        };
        for listener in listeners {
            listener(raw);
        }
    }

    /// Adds a listener. It immediately receives the current value if any
    /// progress has been made, even if reporting has already stopped.
    #[cfg(feature = "progress")]
    pub(crate) fn subscribe(&self, listener: Listener) {
        let current = {
            let mut inner = self.inner.lock();
            if !inner.settled {
                inner.listeners.push(Arc::clone(&listener));
            }
            inner.raw
        };
        if current > 0.0 {
            listener(current);
        }
    }

    /// Stops reporting. `Some(raw)` is the final value of a resolved node;
    /// `None` freezes the current value.
    pub(crate) fn complete(&self, final_raw: Option<f64>) {
        #[cfg(feature = "progress")]
        {
            let (listeners, raw) = {
                let mut inner = self.inner.lock();
                if inner.settled {
                    return;
                }
                inner.settled = true;
                let listeners = std::mem::take(&mut inner.listeners);
                match final_raw {
                    Some(raw) if raw > inner.raw => {
                        inner.raw = raw;
                        (listeners, raw)
                    }
                    _ => return,
                }
            };
            for listener in listeners {
                listener(raw);
            }
        }
        #[cfg(not(feature = "progress"))]
        {
            let _ = final_raw;
        }
    }
}

// -----------------------------------------------------------------------------
// Combinator fan-in

/// How a combinator folds its children's progress.
#[cfg(feature = "progress")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FaninMode {
    /// Weighted average, for `all` and `merge`.
    Average,
    /// Maximum, for `race` and `first`.
    Max,
}

/// Tracks the raw progress of each child of a combinator.
#[cfg(feature = "progress")]
pub(crate) struct Fanin {
    mode: FaninMode,
    weights: Vec<f64>,
    raws: Mutex<Vec<f64>>,
}

#[cfg(feature = "progress")]
impl Fanin {
    pub(crate) fn new(mode: FaninMode, depths: &[u32]) -> Fanin {
        Fanin {
            mode,
            weights: depths.iter().map(|&depth| f64::from(depth) + 1.0).collect(),
            raws: Mutex::new(vec![0.0; depths.len()]),
        }
    }

    /// Records a child's raw value and returns the combined normalized value.
    pub(crate) fn update(&self, index: usize, raw: f64) -> f64 {
        let mut raws = self.raws.lock();
        if raw > raws[index] {
            raws[index] = raw;
        }
        match self.mode {
            FaninMode::Average => {
                let total: f64 = self.weights.iter().sum();
                let done: f64 = raws.iter().sum();
                (done / total).clamp(0.0, 1.0)
            }
            FaninMode::Max => raws
                .iter()
                .zip(&self.weights)
                .map(|(raw, weight)| raw / weight)
                .fold(0.0, f64::max)
                .clamp(0.0, 1.0),
        }
    }
}
