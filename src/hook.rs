//! Scoped substitution of the model's noise-prediction strategy.
//!
//! The surrounding application owns one [`ModelHandle`] per model: the
//! binding point that samplers resolve their forward call through. For the
//! duration of a tiled session the handle's strategy is swapped for the
//! blended entry point, and restored afterwards. Restoration keys off the
//! end-of-session notification rather than successful completion, so
//! cancelled or failed runs still put the original binding back.
//!
//! Both `install` and `uninstall` degrade to no-ops when called in the
//! wrong state; nested and retried sessions make double calls routine.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::adapter::NoiseModel;

/// One-shot end-of-session callback registry.
///
/// Callbacks drain when fired, so a registration never outlives the
/// session that created it.
#[derive(Clone, Default)]
pub struct SessionNotifier {
    pending: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback fired exactly once at the end of the session.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.pending).push(Box::new(callback));
    }

    /// Fire and drop every pending callback.
    pub fn notify_session_end(&self) {
        // Take the batch out before running it: callbacks may register
        // follow-ups for a later session.
        let drained: Vec<_> = lock(&self.pending).drain(..).collect();
        for callback in drained {
            callback();
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// Shared binding point for the active noise-prediction strategy.
#[derive(Clone)]
pub struct ModelHandle {
    state: Arc<Mutex<Binding>>,
}

struct Binding {
    active: Arc<dyn NoiseModel>,
    /// Present only while an override is installed; its presence doubles
    /// as the install marker.
    original: Option<Arc<dyn NoiseModel>>,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn NoiseModel>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Binding {
                active: model,
                original: None,
            })),
        }
    }

    /// The strategy callers should currently invoke.
    pub fn current(&self) -> Arc<dyn NoiseModel> {
        lock(&self.state).active.clone()
    }

    pub fn is_hooked(&self) -> bool {
        lock(&self.state).original.is_some()
    }

    /// Swap in an override built from the current model.
    ///
    /// No-op while already hooked (no duplicate cleanup is registered
    /// either). Otherwise the factory receives the original strategy so
    /// the override can delegate to it, and an uninstall is registered
    /// with the notifier for the end of the session.
    pub fn install<F>(&self, notifier: &SessionNotifier, make_override: F)
    where
        F: FnOnce(Arc<dyn NoiseModel>) -> Arc<dyn NoiseModel>,
    {
        {
            let mut binding = lock(&self.state);
            if binding.original.is_some() {
                return;
            }
            let original = binding.active.clone();
            binding.active = make_override(original.clone());
            binding.original = Some(original);
        }
        let handle = self.clone();
        notifier.register(move || handle.uninstall());
    }

    /// Restore the original strategy; no-op when not hooked.
    pub fn uninstall(&self) {
        let mut binding = lock(&self.state);
        if let Some(original) = binding.original.take() {
            binding.active = original;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
