use std::sync::Arc;

/// An external source of invalidations. A cell is given a trigger when
/// constructed; the kernel arms it the first time the cell is successfully
/// evaluated, and disarms it when the cell is reclaimed or a tracked scope
/// that observed it ends.
pub trait Trigger: Send + Sync {
    /// Start watching. `callback` must be invoked (possibly from any
    /// thread, any number of times) whenever the watched condition changes;
    /// each invocation invalidates the owning cell.
    fn arm(&self, callback: Arc<dyn Fn() + Send + Sync>);

    /// Stop watching. Must be safe to call even if `arm` was never called,
    /// or was already followed by a `disarm`.
    fn disarm(&self);
}

/// A trigger that never fires. Useful for cells that should only ever be
/// invalidated explicitly.
#[derive(Debug, Default)]
pub struct NoopTrigger;

impl Trigger for NoopTrigger {
    fn arm(&self, _callback: Arc<dyn Fn() + Send + Sync>) {}
    fn disarm(&self) {}
}
