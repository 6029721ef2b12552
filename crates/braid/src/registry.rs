//! In-flight requests by id.
//!
//! Every request registers its abort token here for as long as it runs, so a
//! caller holding only the request id can cancel it. Entries are removed when
//! the [`Registration`] handle is dropped, which happens on every teardown
//! path, including a dropped request future.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Entries {
    next_key: u64,
    tokens: HashMap<Arc<str>, (u64, CancellationToken)>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: Mutex<Entries>,
}

impl Registry {
    /// Registers `token` under `request_id` until the handle is dropped.
    ///
    /// A later registration under the same id shadows the earlier one; the
    /// earlier handle then leaves the newer entry in place when dropped.
    pub fn register(
        self: &Arc<Self>,
        request_id: Arc<str>,
        token: CancellationToken,
    ) -> Registration {
        let mut entries = self.entries.lock();
        let key = entries.next_key;
        entries.next_key = entries.next_key.wrapping_add(1);
        entries.tokens.insert(Arc::clone(&request_id), (key, token));

        Registration {
            registry: Arc::clone(self),
            request_id,
            key,
        }
    }

    /// Cancels the request registered under `request_id`, if any.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.entries.lock().tokens.get(request_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().tokens.len()
    }
}

/// Keeps a request registered while alive.
#[derive(Debug)]
pub(crate) struct Registration {
    registry: Arc<Registry>,
    request_id: Arc<str>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock();
        let current = entries
            .tokens
            .get(&*self.request_id)
            .is_some_and(|(key, _)| *key == self.key);
        if current {
            entries.tokens.remove(&*self.request_id);
        }
    }
}
