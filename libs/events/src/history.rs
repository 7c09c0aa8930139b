//! Bounded, newest-first history of lifecycle events.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::MachineEvent;

/// Number of events retained on a machine's state.
pub const HISTORY_CAPACITY: usize = 10;

/// Most recent lifecycle events of one machine, newest first.
///
/// When full, inserting drops the second-oldest entry: the newest event and
/// the machine's first recorded event are always retained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHistory(VecDeque<MachineEvent>);

impl EventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: MachineEvent) {
        self.0.push_front(event);
        while self.0.len() > HISTORY_CAPACITY {
            let second_oldest = self.0.len() - 2;
            self.0.remove(second_oldest);
        }
    }

    pub fn latest(&self) -> Option<&MachineEvent> {
        self.0.front()
    }

    pub fn oldest(&self) -> Option<&MachineEvent> {
        self.0.back()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates newest to oldest; reverse it for delivery order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MachineEvent> + ExactSizeIterator {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<MachineEvent> {
        self.0.iter().cloned().collect()
    }
}
