// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use crate::sample::{DType, Header, Value};

struct Layout {
    header: Arc<Header>,
    dtypes: Vec<DType>,
    cells: Vec<AtomicU64>,
}

/// The latest tagged sample of one stream.
///
/// A slot has one writer, its stream worker, and is read by the merge worker without ever
/// blocking the writer. Every field lives in its own atomic word, so a reader may see a mix
/// of two consecutive samples but never a torn value.
#[derive(Default)]
pub struct Slot {
    layout: OnceLock<Layout>,
}

impl Slot {
    pub fn new() -> Slot {
        Slot::default()
    }

    /// Populates the slot with the first sample of the run, fixing its header and dtypes.
    /// Returns false if the slot was already populated.
    pub fn init(&self, header: Arc<Header>, values: &[Value]) -> bool {
        let layout = Layout {
            header,
            dtypes: values.iter().map(Value::dtype).collect(),
            cells: values.iter().map(|v| AtomicU64::new(v.to_bits())).collect(),
        };
        self.layout.set(layout).is_ok()
    }

    /// Overwrites the slot with a later sample. Values must keep the dtypes of the first one.
    pub fn store(&self, values: &[Value]) {
        if let Some(layout) = self.layout.get() {
            for (cell, value) in layout.cells.iter().zip(values) {
                cell.store(value.to_bits(), Ordering::Release);
            }
        }
    }

    pub fn is_populated(&self) -> bool {
        self.layout.get().is_some()
    }

    pub fn header(&self) -> Option<&Arc<Header>> {
        self.layout.get().map(|layout| &layout.header)
    }

    /// Appends a copy of the latest values. Returns false if the slot is still empty.
    pub fn snapshot_into(&self, values: &mut Vec<Value>) -> bool {
        match self.layout.get() {
            Some(layout) => {
                values.extend(
                    layout
                        .cells
                        .iter()
                        .zip(layout.dtypes.iter())
                        .map(|(cell, dtype)| Value::from_bits(*dtype, cell.load(Ordering::Acquire))),
                );
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Option<Vec<Value>> {
        let mut values = Vec::new();
        self.snapshot_into(&mut values).then_some(values)
    }
}
