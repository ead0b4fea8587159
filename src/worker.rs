use std::thread::{self, JoinHandle};

/// Spawn a named OS thread for a blocking audio loop.
pub fn spawn<F>(name: &str, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Runs the wrapped closure when dropped, including during unwinding.
pub struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }

    /// Skip the closure
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_on_drop_runs_on_panic() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = spawn("panicky", move || {
            let _guard = OnDrop::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            panic!("boom");
        })
        .unwrap();
        assert!(handle.join().is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm() {
        let hits = AtomicUsize::new(0);
        OnDrop::new(|| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .disarm();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
