//! Transport driver lookup context.
//!
//! Broker SDKs commonly discover their transport implementations through
//! state attached to the calling thread. Here that state is a
//! [`LookupContext`]: a named set of [`TransportDriver`]s keyed by URI scheme,
//! installed in a thread-local slot.
//!
//! A host framework may install its own context on a thread. A provider
//! never relies on it: it enters its own context with a [`ContextGuard`]
//! for the duration of factory construction, and the guard puts the previous
//! context back when it is dropped, on every exit path.
//!
//! Guards are `!Send`. They cannot be carried across an `.await` in a spawned
//! task, which would restore the slot on a different worker thread.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::TransportDriver;

thread_local! {
    static SLOT: RefCell<Option<LookupContext>> = const { RefCell::new(None) };
}

/// A named set of transport drivers.
///
/// Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct LookupContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    label: String,
    drivers: BTreeMap<String, Arc<dyn TransportDriver>>,
}

impl LookupContext {
    /// Create a context serving the given drivers.
    ///
    /// A later driver replaces an earlier one with the same scheme.
    pub fn new<I>(label: impl Into<String>, drivers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn TransportDriver>>,
    {
        // ---
        static NEXT: AtomicU64 = AtomicU64::new(1);

        let drivers = drivers
            .into_iter()
            .map(|driver| (driver.scheme().to_string(), driver))
            .collect();

        Self {
            inner: Arc::new(ContextInner {
                id: NEXT.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                drivers,
            }),
        }
    }

    /// A context with no drivers.
    pub fn empty(label: impl Into<String>) -> Self {
        Self::new(label, std::iter::empty())
    }

    /// Process-unique identity of this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Look up the driver serving `scheme`.
    pub fn driver(&self, scheme: &str) -> Option<Arc<dyn TransportDriver>> {
        self.inner.drivers.get(scheme).cloned()
    }

    /// Schemes this context can resolve, in sorted order.
    pub fn schemes(&self) -> Vec<&str> {
        self.inner.drivers.keys().map(String::as_str).collect()
    }
}

impl PartialEq for LookupContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LookupContext {}

impl fmt::Debug for LookupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("LookupContext")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl fmt::Display for LookupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.label, self.inner.id)
    }
}

/// Returns the context installed on the calling thread, if any.
pub(crate) fn current() -> Option<LookupContext> {
    SLOT.with(|slot| slot.borrow().clone())
}

/// Scoped ownership of the calling thread's lookup-context slot.
///
/// Entering installs a context; dropping restores whatever was installed
/// before, including "nothing". Guards nest and must be dropped in reverse
/// order of creation, which normal scoping guarantees.
///
/// # Example
///
/// ```
/// use mom_provider::{current_context, ContextGuard, LookupContext};
///
/// let framework = LookupContext::empty("framework");
/// let provider = LookupContext::empty("provider");
///
/// let _outer = ContextGuard::enter(framework.clone());
/// {
///     let _inner = ContextGuard::enter(provider.clone());
///     assert_eq!(current_context(), Some(provider));
/// }
/// assert_eq!(current_context(), Some(framework));
/// ```
#[must_use = "the context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<LookupContext>,
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    /// Install `context` on the calling thread until the guard is dropped.
    pub fn enter(context: LookupContext) -> Self {
        // ---
        let previous = SLOT.with(|slot| slot.replace(Some(context)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // ---
        let previous = self.previous.take();
        SLOT.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}
