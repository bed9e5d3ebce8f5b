//! Reactive memoization kernel.
//!
//! A [`Cell<T>`] remembers the result of a fallible computation and the set
//! of other cells it read while producing it. Reading an empty cell runs its
//! thunk and records dependency edges; reading a non-empty cell returns the
//! memoized result without rerunning anything. Invalidating a cell clears it
//! and transitively invalidates every cell that read it.
//!
//! All of this is safe to call from a single "main task" only: reads are not
//! required to take a lock because the kernel assumes there is exactly one
//! thread driving evaluation at a time. Triggers fire from arbitrary threads,
//! so invalidations that arrive off the main task (or mid-evaluation) are
//! queued and drained the next time the evaluation stack empties out.

mod poll;
mod signal;
mod trigger;
mod watch;

pub use poll::PollingTrigger;
pub use signal::SignalListener;
pub use trigger::{NoopTrigger, Trigger};
pub use watch::PathWatcher;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};

/// Identifies a cell for debugging and cycle detection. Cheap, copyable, and
/// stable for the cell's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        CellId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// A memoized error. Cheap to clone so that repeated reads of a failed cell
/// all observe the same failure without rerunning anything.
#[derive(Clone)]
pub struct CellError(Arc<eyre::Report>);

impl CellError {
    fn new(report: eyre::Report) -> Self {
        CellError(Arc::new(report))
    }

    fn cycle(id: CellId) -> Self {
        CellError(Arc::new(eyre::eyre!(
            "cell {id} was read again while still evaluating (cyclic dependency)"
        )))
    }
}

impl fmt::Debug for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for CellError {}

/// Type-erased operations every cell supports, regardless of its value type.
/// This is what lets the dependency graph hold heterogeneous edges: a
/// `Cell<Branch>` can depend on a `Cell<Vec<String>>` without either knowing
/// the other's concrete type.
trait AnyCell: Send + Sync {
    fn id(&self) -> CellId;
    fn is_empty(&self) -> bool;
    /// Clears this cell's result, disarms its trigger, releases its strong
    /// references to its own dependencies, and returns the cells that were
    /// depending on it (so the caller can recurse into them next).
    fn clear_and_take_dependents(&self) -> Vec<Weak<dyn AnyCell>>;
    /// Like `clear_and_take_dependents`, but used for tracked-scope teardown:
    /// no cascade is needed because every cell touched by the scope is being
    /// torn down together.
    fn force_clear(&self);
    fn register_dependent(&self, dependent: Weak<dyn AnyCell>);
}

struct Frame {
    cell: Arc<dyn AnyCell>,
    deps: Vec<Arc<dyn AnyCell>>,
}

#[derive(Default)]
struct TrackedState {
    armed: Vec<Weak<dyn AnyCell>>,
}

/// The global kernel singleton: the pending-invalidation queue, the
/// evaluation stack (thread-local, so nested or concurrent callers each get
/// their own), and tracked-scope bookkeeping.
struct Kernel {
    pending: Mutex<VecDeque<Arc<dyn AnyCell>>>,
    activity: Condvar,
    main_thread: OnceCell<ThreadId>,
    tracked: Mutex<Option<TrackedState>>,
}

thread_local! {
    static EVAL_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

static KERNEL: Lazy<Kernel> = Lazy::new(|| Kernel {
    pending: Mutex::new(VecDeque::new()),
    activity: Condvar::new(),
    main_thread: OnceCell::new(),
    tracked: Mutex::new(None),
});

impl Kernel {
    fn global() -> &'static Kernel {
        &KERNEL
    }

    fn note_main_thread(&self) {
        let _ = self.main_thread.set(std::thread::current().id());
    }

    fn is_main_thread(&self) -> bool {
        match self.main_thread.get() {
            Some(id) => *id == std::thread::current().id(),
            None => true,
        }
    }

    fn is_on_stack(&self, id: CellId) -> bool {
        EVAL_STACK.with(|stack| stack.borrow().iter().any(|frame| frame.cell.id() == id))
    }

    fn eval_stack_is_empty(&self) -> bool {
        EVAL_STACK.with(|stack| stack.borrow().is_empty())
    }

    fn push_frame(&self, cell: Arc<dyn AnyCell>) {
        EVAL_STACK.with(|stack| stack.borrow_mut().push(Frame {
            cell,
            deps: Vec::new(),
        }));
    }

    fn pop_frame(&self) -> Frame {
        EVAL_STACK.with(|stack| {
            stack
                .borrow_mut()
                .pop()
                .expect("evaluation stack underflow: pop without matching push")
        })
    }

    /// Called whenever a cell is read. If some other cell is currently being
    /// evaluated on this task, records `child` as one of its dependencies and
    /// registers it as a dependent of `child`.
    fn note_read(&self, child: &Arc<dyn AnyCell>) {
        EVAL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(frame) = stack.last_mut() {
                frame.deps.push(Arc::clone(child));
                child.register_dependent(Arc::downgrade(&frame.cell));
            }
        });
    }

    fn note_armed_if_tracked(&self, cell: Arc<dyn AnyCell>) {
        if let Some(state) = self.tracked.lock().unwrap().as_mut() {
            state.armed.push(Arc::downgrade(&cell));
        }
    }

    fn invalidate(&self, cell: Arc<dyn AnyCell>) {
        if cell.is_empty() {
            return;
        }
        let unsafe_context = !self.is_main_thread() || !self.eval_stack_is_empty();
        if unsafe_context {
            self.pending.lock().unwrap().push_back(cell);
            self.activity.notify_all();
            return;
        }
        Self::invalidate_now(cell);
    }

    fn invalidate_now(cell: Arc<dyn AnyCell>) {
        if cell.is_empty() {
            return;
        }
        let dependents = cell.clear_and_take_dependents();
        for dependent in dependents {
            if let Some(dependent) = dependent.upgrade() {
                Self::invalidate_now(dependent);
            }
        }
    }

    fn drain_pending(&self) {
        loop {
            let next = self.pending.lock().unwrap().pop_front();
            match next {
                Some(cell) => Self::invalidate_now(cell),
                None => break,
            }
        }
    }

    fn wait_for_activity(&self, timeout: Option<Duration>) {
        let guard = self.pending.lock().unwrap();
        if !guard.is_empty() {
            return;
        }
        match timeout {
            Some(duration) => {
                let _ = self.activity.wait_timeout(guard, duration).unwrap();
            }
            None => {
                let _ = self.activity.wait(guard).unwrap();
            }
        }
    }
}

enum CellState<T> {
    Empty,
    Value(T),
    Error(CellError),
}

struct CellInner<T> {
    id: CellId,
    thunk: Box<dyn Fn() -> eyre::Result<T> + Send + Sync>,
    trigger: Option<Arc<dyn Trigger>>,
    armed: AtomicBool,
    state: Mutex<CellState<T>>,
    dependencies: Mutex<Vec<Arc<dyn AnyCell>>>,
    dependents: Mutex<Vec<Weak<dyn AnyCell>>>,
}

impl<T: Send + Sync + 'static> AnyCell for CellInner<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn is_empty(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), CellState::Empty)
    }

    fn clear_and_take_dependents(&self) -> Vec<Weak<dyn AnyCell>> {
        *self.state.lock().unwrap() = CellState::Empty;
        self.dependencies.lock().unwrap().clear();
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(trigger) = &self.trigger {
                trigger.disarm();
            }
        }
        std::mem::take(&mut *self.dependents.lock().unwrap())
    }

    fn force_clear(&self) {
        *self.state.lock().unwrap() = CellState::Empty;
        self.dependencies.lock().unwrap().clear();
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(trigger) = &self.trigger {
                trigger.disarm();
            }
        }
        self.dependents.lock().unwrap().clear();
    }

    fn register_dependent(&self, dependent: Weak<dyn AnyCell>) {
        self.dependents.lock().unwrap().push(dependent);
    }
}

impl<T> CellInner<T> {
    /// Arms the trigger the first time this cell finishes a successful
    /// evaluation. Idempotent: once armed, a trigger stays armed for the
    /// cell's lifetime (it is only ever disarmed by a tracked-scope exit or
    /// by the cell itself being dropped).
    fn maybe_arm(self_arc: &Arc<Self>)
    where
        T: Send + Sync + 'static,
    {
        let Some(trigger) = &self_arc.trigger else {
            return;
        };
        if self_arc.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let any_arc: Arc<dyn AnyCell> = Arc::clone(self_arc) as Arc<dyn AnyCell>;
        let weak: Weak<dyn AnyCell> = Arc::downgrade(&any_arc);
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(cell) = weak.upgrade() {
                Kernel::global().invalidate(cell);
            }
        });
        trigger.arm(callback);
        Kernel::global().note_armed_if_tracked(any_arc);
    }
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            if let Some(trigger) = &self.trigger {
                trigger.disarm();
            }
        }
    }
}

/// A memoized, invalidation-aware cell holding a value of type `T`.
///
/// Cloning a `Cell` is cheap (it is a handle around an `Arc`); all clones
/// share the same memoized state.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    /// Creates a cell with no trigger. It will only ever be recomputed after
    /// an explicit [`Cell::invalidate`].
    pub fn new(thunk: impl Fn() -> eyre::Result<T> + Send + Sync + 'static) -> Self {
        Self::with_trigger(thunk, None)
    }

    /// Creates a cell whose result is automatically invalidated by `trigger`.
    pub fn with_trigger(
        thunk: impl Fn() -> eyre::Result<T> + Send + Sync + 'static,
        trigger: Option<Arc<dyn Trigger>>,
    ) -> Self {
        Cell {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                thunk: Box::new(thunk),
                trigger,
                armed: AtomicBool::new(false),
                state: Mutex::new(CellState::Empty),
                dependencies: Mutex::new(Vec::new()),
                dependents: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the memoized result, evaluating the cell's thunk first if it
    /// is currently empty. Must only be called from the main task.
    pub fn read(&self) -> Result<T, CellError> {
        let kernel = Kernel::global();
        kernel.note_main_thread();
        debug_assert!(
            kernel.is_main_thread(),
            "Cell::read() must only be called from the main task"
        );

        let self_any: Arc<dyn AnyCell> = Arc::clone(&self.inner) as Arc<dyn AnyCell>;
        kernel.note_read(&self_any);

        {
            let state = self.inner.state.lock().unwrap();
            match &*state {
                CellState::Value(value) => return Ok(value.clone()),
                CellState::Error(err) => return Err(err.clone()),
                CellState::Empty => {}
            }
        }
        self.evaluate()
    }

    fn evaluate(&self) -> Result<T, CellError> {
        let kernel = Kernel::global();
        if kernel.is_on_stack(self.inner.id) {
            return Err(CellError::cycle(self.inner.id));
        }

        let self_any: Arc<dyn AnyCell> = Arc::clone(&self.inner) as Arc<dyn AnyCell>;
        kernel.push_frame(self_any);
        let thunk_result = (self.inner.thunk)();
        let frame = kernel.pop_frame();

        let result: Result<T, CellError> = thunk_result.map_err(CellError::new);
        {
            let mut state = self.inner.state.lock().unwrap();
            *state = match &result {
                Ok(value) => CellState::Value(value.clone()),
                Err(err) => CellState::Error(err.clone()),
            };
        }
        *self.inner.dependencies.lock().unwrap() = frame.deps;
        CellInner::maybe_arm(&self.inner);

        if kernel.eval_stack_is_empty() {
            kernel.drain_pending();
        }
        result
    }

    /// Clears this cell's result and transitively invalidates every cell
    /// that (directly or indirectly) read it. If called off the main task,
    /// or while some cell is mid-evaluation on the main task, the
    /// invalidation is queued and applied the next time the stack empties.
    pub fn invalidate(&self) {
        let any: Arc<dyn AnyCell> = Arc::clone(&self.inner) as Arc<dyn AnyCell>;
        Kernel::global().invalidate(any);
    }

    /// True if the cell currently holds neither a value nor an error.
    pub fn is_empty(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), CellState::Empty)
    }
}

/// A scope in which every trigger armed while reading cells is forcibly
/// disarmed, and every such cell cleared, when the scope ends. Used by tests
/// and by one-shot (non-watch) invocations that should leave no background
/// watchers running afterward. Scopes do not nest.
pub struct TrackedScope {
    _private: (),
}

impl TrackedScope {
    /// Enters a tracked scope. Panics if one is already active on this
    /// process (tracked scopes are not reentrant).
    pub fn enter() -> Self {
        let mut guard = Kernel::global().tracked.lock().unwrap();
        assert!(guard.is_none(), "tracked scopes do not nest");
        *guard = Some(TrackedState::default());
        TrackedScope { _private: () }
    }
}

impl Drop for TrackedScope {
    fn drop(&mut self) {
        let state = Kernel::global()
            .tracked
            .lock()
            .unwrap()
            .take()
            .expect("tracked scope state missing on exit");
        for weak in state.armed {
            if let Some(cell) = weak.upgrade() {
                cell.force_clear();
            }
        }
    }
}

/// Runs `cell` repeatedly: drain any queued invalidations, read the cell and
/// hand the result to `render`, then block until something invalidates a
/// cell again (or up to 500ms, so `should_stop` gets polled even when
/// nothing external happens). Returns when `should_stop` returns true.
pub fn drive<T, F>(cell: &Cell<T>, mut render: F, mut should_stop: impl FnMut() -> bool)
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(Result<T, CellError>),
{
    loop {
        Kernel::global().drain_pending();
        render(cell.read());
        if should_stop() {
            return;
        }
        Kernel::global().wait_for_activity(Some(Duration::from_millis(500)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn memoizes_successful_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let cell = Cell::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        assert_eq!(cell.read().unwrap(), 42);
        assert_eq!(cell.read().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memoizes_error_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let cell: Cell<i32> = Cell::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(eyre::eyre!("boom"))
        });
        assert!(cell.read().is_err());
        assert!(cell.read().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidation_forces_recompute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let cell = Cell::new(move || {
            Ok(calls2.fetch_add(1, Ordering::SeqCst))
        });
        assert_eq!(cell.read().unwrap(), 0);
        cell.invalidate();
        assert_eq!(cell.read().unwrap(), 1);
    }

    #[test]
    fn invalidating_already_empty_cell_is_a_no_op() {
        let cell: Cell<i32> = Cell::new(|| Ok(1));
        assert!(cell.is_empty());
        cell.invalidate();
        assert!(cell.is_empty());
    }

    #[test]
    fn dependent_invalidates_transitively() {
        let base = Cell::new(|| Ok(1));
        let base2 = base.clone();
        let derived_calls = Arc::new(AtomicUsize::new(0));
        let derived_calls2 = Arc::clone(&derived_calls);
        let derived = Cell::new(move || {
            derived_calls2.fetch_add(1, Ordering::SeqCst);
            Ok(base2.read().unwrap_or(0) * 2)
        });

        assert_eq!(derived.read().unwrap(), 2);
        assert_eq!(derived_calls.load(Ordering::SeqCst), 1);

        base.invalidate();
        assert!(derived.is_empty());

        assert_eq!(derived.read().unwrap(), 2);
        assert_eq!(derived_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cyclic_read_reports_an_error_instead_of_deadlocking() {
        use std::cell::RefCell;

        thread_local! {
            static SELF_CELL: RefCell<Option<Cell<i32>>> = const { RefCell::new(None) };
        }

        let cell = Cell::new(|| {
            SELF_CELL.with(|slot| slot.borrow().as_ref().unwrap().read().map_err(|e| eyre::eyre!(e)))
        });
        SELF_CELL.with(|slot| *slot.borrow_mut() = Some(cell.clone()));

        assert!(cell.read().is_err());
    }

    #[test]
    fn tracked_scope_clears_and_disarms_on_exit() {
        let trigger = Arc::new(NoopTrigger);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let cell = Cell::with_trigger(
            move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            },
            Some(trigger as Arc<dyn Trigger>),
        );

        {
            let _scope = TrackedScope::enter();
            assert_eq!(cell.read().unwrap(), 1);
            assert!(!cell.is_empty());
        }
        assert!(cell.is_empty());

        assert_eq!(cell.read().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
