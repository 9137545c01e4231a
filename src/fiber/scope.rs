//! Hierarchical cancellation domains.
//!
//! Every fiber owns a [`Scope`] in which the fibers it forks are registered.
//! Closing a scope interrupts and awaits every live fiber registered in it,
//! closes its child scopes, and finally runs its finalizers. A fiber closes
//! its own scope when it finishes, so children never outlive an unjoined
//! parent. The [`Scope::global`] scope never closes and does not track its
//! fibers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::effect::instruction::Instruction;
use crate::effect::{Effect, UIO};
use crate::fiber::FiberId;
use crate::fiber::context::{FiberContext, interrupt_and_await};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: LazyLock<Scope> = LazyLock::new(|| Scope::with_kind(true));

/// A cancellation domain for fibers.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: u64,
    global: bool,
    state: Mutex<ScopeState>,
}

struct ScopeState {
    open: bool,
    fibers: BTreeMap<FiberId, Arc<FiberContext>>,
    children: Vec<Weak<ScopeInner>>,
    finalizers: Vec<Instruction>,
}

impl Scope {
    fn with_kind(global: bool) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
                global,
                state: Mutex::new(ScopeState {
                    open: true,
                    fibers: BTreeMap::new(),
                    children: Vec::new(),
                    finalizers: Vec::new(),
                }),
            }),
        }
    }

    pub(crate) fn detached() -> Self {
        Self::with_kind(false)
    }

    /// The scope that never closes.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Creates a new, open, top-level scope.
    pub fn make<R: 'static, E: Send + 'static>() -> Effect<R, E, Self> {
        Effect::total(Self::detached)
    }

    /// Creates a scope that is closed when this scope closes.
    ///
    /// A child of a closed scope starts out closed.
    pub fn child<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, Self> {
        let parent = self.clone();
        Effect::total(move || {
            let child = Self::detached();
            if !parent.inner.global {
                let mut state = parent.inner.state.lock();
                if state.open {
                    state.children.retain(|child| child.strong_count() > 0);
                    state.children.push(Arc::downgrade(&child.inner));
                } else {
                    child.inner.state.lock().open = false;
                }
            }
            child
        })
    }

    /// A process-unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns `true` for the global scope.
    pub fn is_global(&self) -> bool {
        self.inner.global
    }

    /// Returns `true` until the scope is closed.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// The number of live fibers registered in the scope.
    pub fn child_count(&self) -> usize {
        self.inner.state.lock().fibers.len()
    }

    /// Registers a finalizer run when the scope closes.
    ///
    /// Returns `false`, without running the finalizer, when the scope is
    /// already closed or is the global scope.
    pub fn register_finalizer<R, E>(&self, finalizer: UIO<()>) -> Effect<R, E, bool>
    where
        R: 'static,
        E: Send + 'static,
    {
        let scope = self.clone();
        Effect::total(move || {
            if scope.inner.global {
                return false;
            }
            let mut state = scope.inner.state.lock();
            if state.open {
                state.finalizers.push(finalizer.into_instruction());
                true
            } else {
                false
            }
        })
    }

    /// Closes the scope: interrupts and awaits its fibers, closes its child
    /// scopes, then runs its finalizers. Closing twice is a no-op.
    pub fn close<R: 'static, E: Send + 'static>(&self) -> Effect<R, E, ()> {
        let scope = self.clone();
        Effect::from_instruction(Instruction::Descriptor(Box::new(move |descriptor| {
            scope
                .close_instruction(descriptor.id)
                .unwrap_or_else(Instruction::unit)
        })))
    }

    /// Registers `fiber` as a member of the scope.
    ///
    /// Returns `false` when the scope is closed; the caller is expected to
    /// interrupt the fiber.
    pub(crate) fn attach(&self, fiber: &Arc<FiberContext>) -> bool {
        if self.inner.global {
            return true;
        }
        {
            let mut state = self.inner.state.lock();
            if !state.open {
                return false;
            }
            state.fibers.insert(fiber.id(), Arc::clone(fiber));
        }
        let scope = Arc::downgrade(&self.inner);
        let fiber_id = fiber.id();
        fiber.on_done(Box::new(move || {
            if let Some(scope) = scope.upgrade() {
                scope.state.lock().fibers.remove(&fiber_id);
            }
        }));
        true
    }

    /// Marks the scope closed and returns the instruction that interrupts
    /// its members and runs its finalizers, or `None` if there is nothing
    /// to do. The returned instruction never fails.
    pub(crate) fn close_instruction(&self, by: FiberId) -> Option<Instruction> {
        if self.inner.global {
            return None;
        }
        let (fibers, children, finalizers) = {
            let mut state = self.inner.state.lock();
            if !state.open {
                return None;
            }
            state.open = false;
            (
                std::mem::take(&mut state.fibers),
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.finalizers),
            )
        };
        let children: Vec<Self> = children
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Self { inner })
            .collect();
        if fibers.is_empty() && children.is_empty() && finalizers.is_empty() {
            return None;
        }

        tracing::debug!(
            scope = self.inner.id,
            fibers = fibers.len(),
            children = children.len(),
            finalizers = finalizers.len(),
            by = %by,
            "closing scope"
        );

        let mut steps = vec![interrupt_and_await(fibers.into_values().collect(), by)];
        steps.extend(
            children
                .into_iter()
                .filter_map(|child| child.close_instruction(by)),
        );
        steps.extend(
            finalizers
                .into_iter()
                .rev()
                .map(|finalizer| finalizer.with_unit_environment().ignore_failure("scope finalizer")),
        );
        Some(Instruction::sequence(steps))
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("global", &self.inner.global)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}
