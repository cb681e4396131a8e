use std::collections::{HashMap, VecDeque};

use crate::prelude::TelemetryDataPoint;

/// Owned table of bounded, most-recent-first-out sample windows keyed by `stream:type`.
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: HashMap<String, VecDeque<TelemetryDataPoint>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `point` to the window for `key`, trimming the front to `capacity`.
    ///
    /// The window is created lazily on the first sample for a key.
    pub fn push(&mut self, key: &str, point: TelemetryDataPoint, capacity: usize) -> &VecDeque<TelemetryDataPoint> {
        let capacity = capacity.max(1);
        let window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        window.push_back(point);
        while window.len() > capacity {
            window.pop_front();
        }
        window
    }

    pub fn window(&self, key: &str) -> Option<&VecDeque<TelemetryDataPoint>> {
        self.windows.get(key)
    }

    pub fn len(&self, key: &str) -> usize {
        self.windows.get(key).map_or(0, VecDeque::len)
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    pub fn reset(&mut self) {
        self.windows.clear();
    }
}
