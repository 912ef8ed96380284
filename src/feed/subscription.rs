use std::fmt;

type Detach = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Handle that detaches one callback.
///
/// Call [`unsubscribe`](Self::unsubscribe) or drop the handle to detach; either
/// way the callback is detached exactly once. Use [`keep`](Self::keep) for a
/// callback that should stay attached for the life of the client.
#[must_use = "dropping the handle detaches the callback immediately"]
pub struct Unsubscribe {
    detach: Option<Detach>,
}

impl Unsubscribe {
    pub(crate) fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Detach the callback now.
    pub fn unsubscribe(mut self) {
        self.run();
    }

    /// Leave the callback attached for the rest of the client's life.
    pub fn keep(mut self) {
        self.detach = None;
    }

    fn run(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting() -> (Arc<AtomicUsize>, Unsubscribe) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (calls, handle)
    }

    #[test]
    fn unsubscribe_runs_once() {
        let (calls, handle) = counting();

        handle.unsubscribe();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_detaches() {
        let (calls, handle) = counting();

        drop(handle);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn keep_never_detaches() {
        let (calls, handle) = counting();

        handle.keep();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
