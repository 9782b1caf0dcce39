//! Persistent render-resource bindings with an owning lifecycle.
//!
//! A key→binding map generic over the binding payload (the GPU backend is a
//! black box here; the renderer instantiates one map for images and one for
//! buffers). Owned entries pair a create/destroy spec with the live binding
//! and guarantee exactly one `destroy` per successful `create`; every
//! recreate bumps the entry's generation.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub type ResourceHandle = u64;

/// Create/destroy pair driving an owned binding.
pub struct BindingSpec<B> {
    pub create: Box<dyn Fn() -> Option<B> + Send>,
    pub destroy: Box<dyn Fn(&B) + Send>,
}

struct OwnedEntry<B> {
    spec: BindingSpec<B>,
    binding: B,
    generation: u64,
}

struct Inner<B> {
    bindings: FxHashMap<ResourceHandle, B>,
    owned: FxHashMap<ResourceHandle, OwnedEntry<B>>,
}

/// Mutex-guarded binding map. External bindings can be upserted directly;
/// owned bindings are created, recreated, and released through their spec.
pub struct OwnedResources<B> {
    inner: Mutex<Inner<B>>,
}

impl<B: Clone> OwnedResources<B> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                bindings: FxHashMap::default(),
                owned: FxHashMap::default(),
            }),
        }
    }

    /// Register an externally managed binding.
    pub fn upsert(&self, handle: ResourceHandle, binding: B) {
        self.inner.lock().bindings.insert(handle, binding);
    }

    /// Remove an externally managed binding (owned entries are untouched).
    pub fn remove(&self, handle: ResourceHandle) {
        self.inner.lock().bindings.remove(&handle);
    }

    pub fn resolve(&self, handle: ResourceHandle) -> Option<B> {
        self.inner.lock().bindings.get(&handle).cloned()
    }

    /// Generation of an owned entry, starting at 1 and bumped per recreate.
    pub fn generation(&self, handle: ResourceHandle) -> Option<u64> {
        self.inner.lock().owned.get(&handle).map(|e| e.generation)
    }

    /// Create an owned binding from `spec`. Returns false (with nothing
    /// registered) when creation fails. Replacing an existing owned entry
    /// destroys the previous binding first.
    pub fn ensure_owned(&self, handle: ResourceHandle, spec: BindingSpec<B>) -> bool {
        // Creation runs outside the lock: specs may be slow or re-entrant.
        let Some(binding) = (spec.create)() else {
            return false;
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.owned.remove(&handle) {
            (previous.spec.destroy)(&previous.binding);
        }

        inner.bindings.insert(handle, binding.clone());
        inner.owned.insert(
            handle,
            OwnedEntry {
                spec,
                binding,
                generation: 1,
            },
        );
        true
    }

    /// Destroy and re-create an owned binding, bumping its generation.
    /// On creation failure the entry loses its resolvable binding and
    /// `recreate_owned` returns false.
    pub fn recreate_owned(&self, handle: ResourceHandle) -> bool {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(entry) = inner.owned.get_mut(&handle) else {
            return false;
        };

        (entry.spec.destroy)(&entry.binding);
        match (entry.spec.create)() {
            Some(binding) => {
                entry.binding = binding.clone();
                entry.generation += 1;
                inner.bindings.insert(handle, binding);
                true
            }
            None => {
                // One destroy already happened; drop the dead entry so a
                // later release cannot destroy twice.
                inner.owned.remove(&handle);
                inner.bindings.remove(&handle);
                false
            }
        }
    }

    /// Destroy an owned binding and forget the entry.
    pub fn release_owned(&self, handle: ResourceHandle) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.owned.remove(&handle) {
            (entry.spec.destroy)(&entry.binding);
        }
        inner.bindings.remove(&handle);
    }

    /// Destroy every owned binding and clear the map.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, entry) in inner.owned.drain() {
            (entry.spec.destroy)(&entry.binding);
        }
        inner.bindings.clear();
    }
}

impl<B: Clone> Default for OwnedResources<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> Drop for OwnedResources<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, entry) in inner.owned.drain() {
            (entry.spec.destroy)(&entry.binding);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Debug, PartialEq)]
    struct FakeBinding(u32);

    struct Counters {
        created: AtomicU32,
        destroyed: AtomicU32,
    }

    fn counting_spec(counters: &Arc<Counters>, fail: bool) -> BindingSpec<FakeBinding> {
        let c1 = counters.clone();
        let c2 = counters.clone();
        BindingSpec {
            create: Box::new(move || {
                if fail {
                    return None;
                }
                let n = c1.created.fetch_add(1, Ordering::SeqCst) + 1;
                Some(FakeBinding(n))
            }),
            destroy: Box::new(move |_| {
                c2.destroyed.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    fn counters() -> Arc<Counters> {
        Arc::new(Counters {
            created: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
        })
    }

    #[test]
    fn ensure_resolve_release_balances_create_destroy() {
        let c = counters();
        let resources = OwnedResources::new();

        assert!(resources.ensure_owned(7, counting_spec(&c, false)));
        assert_eq!(resources.resolve(7), Some(FakeBinding(1)));
        assert_eq!(resources.generation(7), Some(1));

        resources.release_owned(7);
        assert_eq!(resources.resolve(7), None);
        assert_eq!(c.created.load(Ordering::SeqCst), 1);
        assert_eq!(c.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recreate_bumps_generation_and_destroys_prior() {
        let c = counters();
        let resources = OwnedResources::new();
        resources.ensure_owned(1, counting_spec(&c, false));

        assert!(resources.recreate_owned(1));
        assert_eq!(resources.generation(1), Some(2));
        assert_eq!(resources.resolve(1), Some(FakeBinding(2)));
        assert_eq!(c.created.load(Ordering::SeqCst), 2);
        assert_eq!(c.destroyed.load(Ordering::SeqCst), 1);

        resources.release_owned(1);
        assert_eq!(c.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_create_registers_nothing() {
        let c = counters();
        let resources = OwnedResources::new();
        assert!(!resources.ensure_owned(3, counting_spec(&c, true)));
        assert_eq!(resources.resolve(3), None);
        assert_eq!(c.destroyed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_destroys_remaining_owned_bindings() {
        let c = counters();
        {
            let resources = OwnedResources::new();
            resources.ensure_owned(1, counting_spec(&c, false));
            resources.ensure_owned(2, counting_spec(&c, false));
        }
        assert_eq!(c.created.load(Ordering::SeqCst), 2);
        assert_eq!(c.destroyed.load(Ordering::SeqCst), 2);
    }
}
