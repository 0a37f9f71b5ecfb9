use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Identity of whoever waits for or owns a resource, e.g. a transaction id.
/// The detector only relies on equality and hashing.
pub trait Holder: Eq + Hash + Clone + Debug + Send + Sync {}

impl<T> Holder for T where T: Eq + Hash + Clone + Debug + Send + Sync {}

/// A lockable unit that can report who currently owns it.
pub trait Resource: Debug + Send + Sync {
    type Holder: Holder;

    /// Current owner, `None` when unheld. Must not block.
    fn current_holder(&self) -> Option<Self::Holder>;
}

impl<T> Resource for Arc<T>
where
    T: Resource + ?Sized,
{
    type Holder = T::Holder;

    fn current_holder(&self) -> Option<Self::Holder> {
        (**self).current_holder()
    }
}
