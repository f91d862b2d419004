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
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

type Hook = Box<dyn FnMut() + Send>;

/// An ordered list of callables run at one lifecycle point. A hook's arguments are whatever
/// its closure captures.
///
/// Clones share the same list, so hooks registered through one handle are seen by every
/// worker holding another.
#[derive(Clone, Default)]
pub struct Hooks {
    name: &'static str,
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl Hooks {
    pub fn new(name: &'static str) -> Hooks {
        Hooks {
            name,
            hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a hook. Hooks run in registration order.
    pub fn add<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Runs every hook synchronously on the calling thread.
    pub fn run(&self) {
        let mut hooks = self.hooks.lock();
        debug!(hooks = self.name, count = hooks.len(), "Running hooks");
        for hook in hooks.iter_mut() {
            hook();
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
