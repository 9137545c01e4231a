//! Structured failure causes.
//!
//! A [`Cause`] records *why* a fiber did not succeed. It distinguishes three
//! kinds of failure:
//!
//! - **Typed failures** (`Fail(E)`): expected domain errors, recoverable with
//!   `catch_all`.
//! - **Defects** (`Die(Defect)`): unexpected panics or invariant violations,
//!   only visible to cause-aware handlers such as `catch_all_cause`.
//! - **Interruption** (`Interrupt(FiberId)`): cancellation issued by a fiber.
//!
//! Causes compose sequentially with [`Cause::then`] and in parallel with
//! [`Cause::both`]. Both operations are associative and have [`Cause::Empty`]
//! as their identity, so a `Cause` forms two monoids over the same carrier.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::cause::Cause;
//!
//! let first: Cause<&str> = Cause::fail("first");
//! let second = Cause::fail("second");
//!
//! let combined = Cause::then(first, second);
//! assert_eq!(combined.failures(), vec!["first", "second"]);
//!
//! // Empty is the identity of both monoids
//! assert_eq!(Cause::then(Cause::Empty, Cause::fail(1)), Cause::fail(1));
//! assert_eq!(Cause::both(Cause::fail(1), Cause::Empty), Cause::fail(1));
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

// =============================================================================
// Defect
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DefectMessage(String);

/// An unexpected failure that is not part of an effect's error type.
///
/// Defects are produced by panics inside thunks and continuations, and by
/// [`Effect::die`](crate::effect::Effect::die). Two defects compare equal
/// when their rendered messages are equal.
#[derive(Clone)]
pub struct Defect {
    error: Arc<dyn Error + Send + Sync>,
}

impl Defect {
    /// Wraps an error value as a defect.
    pub fn new<Failure>(error: Failure) -> Self
    where
        Failure: Error + Send + Sync + 'static,
    {
        Self {
            error: Arc::new(error),
        }
    }

    /// Creates a defect carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(DefectMessage(message.into()))
    }

    /// Converts a panic payload captured by `catch_unwind` into a defect.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::message(message)
    }

    /// Returns the underlying error.
    pub fn error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.error
    }

    /// Attempts to view the underlying error as a concrete type.
    pub fn downcast_ref<T: Error + 'static>(&self) -> Option<&T> {
        self.error.downcast_ref::<T>()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("Defect")
            .field(&self.error.to_string())
            .finish()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, formatter)
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.error, &other.error) || self.error.to_string() == other.error.to_string()
    }
}

// =============================================================================
// Cause
// =============================================================================

/// The full story of why an effect failed.
///
/// Use the smart constructors [`Cause::then`] and [`Cause::both`] to combine
/// causes; they collapse [`Cause::Empty`] operands so that `Empty` behaves as
/// the identity element.
///
/// Equality is structural up to the monoid laws: nested `Then` chains are
/// compared as sequences, nested `Both` groups as unordered collections, and
/// `Empty` leaves are ignored.
#[derive(Clone, Debug)]
pub enum Cause<E> {
    /// No failure at all.
    Empty,
    /// A typed, expected failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption issued by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened before the right cause.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// Creates a cause from a typed failure.
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// Creates a cause from a defect.
    pub const fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// Creates an interruption cause attributed to `fiber_id`.
    pub const fn interrupt(fiber_id: FiberId) -> Self {
        Self::Interrupt(fiber_id)
    }

    /// Sequential composition: `left` fully preceded `right`.
    #[must_use]
    pub fn then(left: Self, right: Self) -> Self {
        match (left, right) {
            (Self::Empty, right) => right,
            (left, Self::Empty) => left,
            (left, right) => Self::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition: `left` and `right` happened concurrently.
    #[must_use]
    pub fn both(left: Self, right: Self) -> Self {
        match (left, right) {
            (Self::Empty, right) => right,
            (left, Self::Empty) => left,
            (left, right) => Self::Both(Box::new(left), Box::new(right)),
        }
    }

    /// Returns every leaf in left-to-right order, skipping `Empty`.
    fn leaves(&self) -> Vec<&Self> {
        let mut leaves = Vec::new();
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Self::Then(left, right) | Self::Both(left, right) => {
                    pending.push(right);
                    pending.push(left);
                }
                Self::Empty => {}
                leaf => leaves.push(leaf),
            }
        }
        leaves
    }

    /// Returns `true` if the cause contains no failure of any kind.
    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }

    /// Returns `true` if the cause contains at least one typed failure.
    pub fn is_failure(&self) -> bool {
        self.leaves()
            .iter()
            .any(|leaf| matches!(leaf, Self::Fail(_)))
    }

    /// Returns `true` if the cause contains at least one defect.
    pub fn is_die(&self) -> bool {
        self.leaves().iter().any(|leaf| matches!(leaf, Self::Die(_)))
    }

    /// Returns `true` if the cause contains at least one interruption.
    pub fn is_interrupted(&self) -> bool {
        self.leaves()
            .iter()
            .any(|leaf| matches!(leaf, Self::Interrupt(_)))
    }

    /// Returns `true` if the cause is non-empty and consists only of
    /// interruptions.
    pub fn interrupted_only(&self) -> bool {
        let leaves = self.leaves();
        !leaves.is_empty()
            && leaves
                .iter()
                .all(|leaf| matches!(leaf, Self::Interrupt(_)))
    }

    /// Returns a reference to the first typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.leaves().into_iter().find_map(|leaf| match leaf {
            Self::Fail(error) => Some(error),
            _ => None,
        })
    }

    /// Returns every defect, in order.
    pub fn defects(&self) -> Vec<Defect> {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                Self::Die(defect) => Some(defect.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the set of fibers that interrupted.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                Self::Interrupt(fiber_id) => Some(*fiber_id),
                _ => None,
            })
            .collect()
    }

    /// Returns every typed failure, in order.
    pub fn failures(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.leaves()
            .into_iter()
            .filter_map(|leaf| match leaf {
                Self::Fail(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if `other` occurs somewhere inside this cause.
    pub fn contains(&self, other: &Self) -> bool
    where
        E: PartialEq,
    {
        if other.is_empty() {
            return true;
        }
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            if cause == other {
                return true;
            }
            if let Self::Then(left, right) | Self::Both(left, right) = cause {
                pending.push(right);
                pending.push(left);
            }
        }
        false
    }

    /// Keeps only the defects, or returns `None` when there are none.
    pub fn keep_defects<E2>(self) -> Option<Cause<E2>> {
        match self {
            Self::Empty | Self::Fail(_) | Self::Interrupt(_) => None,
            Self::Die(defect) => Some(Cause::Die(defect)),
            Self::Then(left, right) => match (left.keep_defects(), right.keep_defects()) {
                (Some(left), Some(right)) => Some(Cause::then(left, right)),
                (left, right) => left.or(right),
            },
            Self::Both(left, right) => match (left.keep_defects(), right.keep_defects()) {
                (Some(left), Some(right)) => Some(Cause::both(left, right)),
                (left, right) => left.or(right),
            },
        }
    }

    /// Consumes the cause and returns its typed failures, in order.
    pub fn into_failures(self) -> Vec<E> {
        let mut failures = Vec::new();
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Self::Then(left, right) | Self::Both(left, right) => {
                    pending.push(*right);
                    pending.push(*left);
                }
                Self::Fail(error) => failures.push(error),
                Self::Empty | Self::Die(_) | Self::Interrupt(_) => {}
            }
        }
        failures
    }

    /// Returns the first typed failure, or the whole cause when it contains
    /// only defects and interruptions.
    ///
    /// This is the split `catch_all` relies on: only typed failures are
    /// handed to the handler, everything else is re-raised untouched.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the cause holds no typed failure.
    pub fn failure_or_cause(self) -> Result<E, Self> {
        if self.is_failure() {
            self.into_failures().into_iter().next().ok_or(Self::Empty)
        } else {
            Err(self)
        }
    }

    /// Transforms every typed failure, preserving the structure.
    pub fn map<E2, F>(self, mut function: F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        self.map_with(&mut function)
    }

    fn map_with<E2, F>(self, function: &mut F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(error) => Cause::Fail(function(error)),
            Self::Die(defect) => Cause::Die(defect),
            Self::Interrupt(fiber_id) => Cause::Interrupt(fiber_id),
            Self::Then(left, right) => {
                let left = left.map_with(function);
                Cause::Then(Box::new(left), Box::new(right.map_with(function)))
            }
            Self::Both(left, right) => {
                let left = left.map_with(function);
                Cause::Both(Box::new(left), Box::new(right.map_with(function)))
            }
        }
    }

    /// Like [`Cause::map`] but borrows the cause.
    pub fn map_ref<E2, F>(&self, mut function: F) -> Cause<E2>
    where
        F: FnMut(&E) -> E2,
    {
        self.map_ref_with(&mut function)
    }

    fn map_ref_with<E2, F>(&self, function: &mut F) -> Cause<E2>
    where
        F: FnMut(&E) -> E2,
    {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(error) => Cause::Fail(function(error)),
            Self::Die(defect) => Cause::Die(defect.clone()),
            Self::Interrupt(fiber_id) => Cause::Interrupt(*fiber_id),
            Self::Then(left, right) => {
                let left = left.map_ref_with(function);
                Cause::Then(Box::new(left), Box::new(right.map_ref_with(function)))
            }
            Self::Both(left, right) => {
                let left = left.map_ref_with(function);
                Cause::Both(Box::new(left), Box::new(right.map_ref_with(function)))
            }
        }
    }

    /// Removes every typed failure, keeping defects and interruptions.
    #[must_use]
    pub fn strip_failures<E2>(self) -> Cause<E2> {
        match self {
            Self::Empty | Self::Fail(_) => Cause::Empty,
            Self::Die(defect) => Cause::Die(defect),
            Self::Interrupt(fiber_id) => Cause::Interrupt(fiber_id),
            Self::Then(left, right) => Cause::then(left.strip_failures(), right.strip_failures()),
            Self::Both(left, right) => Cause::both(left.strip_failures(), right.strip_failures()),
        }
    }

    /// Folds the cause into a single value.
    ///
    /// Every leaf is visited exactly once; for `Then` and `Both` the left
    /// operand is folded before the right one.
    pub fn fold<Z>(
        &self,
        empty_case: &impl Fn() -> Z,
        fail_case: &impl Fn(&E) -> Z,
        die_case: &impl Fn(&Defect) -> Z,
        interrupt_case: &impl Fn(FiberId) -> Z,
        then_case: &impl Fn(Z, Z) -> Z,
        both_case: &impl Fn(Z, Z) -> Z,
    ) -> Z {
        match self {
            Self::Empty => empty_case(),
            Self::Fail(error) => fail_case(error),
            Self::Die(defect) => die_case(defect),
            Self::Interrupt(fiber_id) => interrupt_case(*fiber_id),
            Self::Then(left, right) => {
                let left = left.fold(
                    empty_case,
                    fail_case,
                    die_case,
                    interrupt_case,
                    then_case,
                    both_case,
                );
                let right = right.fold(
                    empty_case,
                    fail_case,
                    die_case,
                    interrupt_case,
                    then_case,
                    both_case,
                );
                then_case(left, right)
            }
            Self::Both(left, right) => {
                let left = left.fold(
                    empty_case,
                    fail_case,
                    die_case,
                    interrupt_case,
                    then_case,
                    both_case,
                );
                let right = right.fold(
                    empty_case,
                    fail_case,
                    die_case,
                    interrupt_case,
                    then_case,
                    both_case,
                );
                both_case(left, right)
            }
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// Renders the cause as a multi-line report.
    ///
    /// Sequential sections are listed one after another; parallel sections
    /// are grouped under a `parallel` heading.
    pub fn pretty(&self) -> String {
        let mut output = String::new();
        render(self, 0, &mut output);
        output
    }
}

fn render<E: fmt::Debug>(cause: &Cause<E>, depth: usize, output: &mut String) {
    let indent = "  ".repeat(depth);
    match cause {
        Cause::Empty => {}
        Cause::Fail(error) => {
            output.push_str(&format!("{indent}A checked error was not handled: {error:?}\n"));
        }
        Cause::Die(defect) => {
            output.push_str(&format!("{indent}An unchecked error was produced: {defect}\n"));
        }
        Cause::Interrupt(fiber_id) => {
            output.push_str(&format!("{indent}Fiber was interrupted by {fiber_id}\n"));
        }
        Cause::Then(left, right) => {
            render(left, depth, output);
            render(right, depth, output);
        }
        Cause::Both(left, right) => {
            output.push_str(&format!("{indent}parallel:\n"));
            render(left, depth + 1, output);
            render(right, depth + 1, output);
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(formatter, "Empty"),
            Self::Fail(error) => write!(formatter, "Fail({error:?})"),
            Self::Die(defect) => write!(formatter, "Die({defect})"),
            Self::Interrupt(fiber_id) => write!(formatter, "Interrupt({fiber_id})"),
            Self::Then(left, right) => write!(formatter, "Then({left}, {right})"),
            Self::Both(left, right) => write!(formatter, "Both({left}, {right})"),
        }
    }
}

impl<E> Cause<Cause<E>> {
    /// Replaces every `Fail(cause)` leaf by the cause it carries.
    #[must_use]
    pub fn flatten(self) -> Cause<E> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(inner) => inner,
            Self::Die(defect) => Cause::Die(defect),
            Self::Interrupt(fiber_id) => Cause::Interrupt(fiber_id),
            Self::Then(left, right) => Cause::then(left.flatten(), right.flatten()),
            Self::Both(left, right) => Cause::both(left.flatten(), right.flatten()),
        }
    }
}

impl Cause<Infallible> {
    /// Views a cause that cannot contain typed failures as a cause of any
    /// error type.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

// =============================================================================
// Equality up to the monoid laws
// =============================================================================

enum Shape<'a, E> {
    Leaf(&'a Cause<E>),
    Sequence(Vec<Shape<'a, E>>),
    Parallel(Vec<Shape<'a, E>>),
}

fn shape<E>(cause: &Cause<E>) -> Option<Shape<'_, E>> {
    match cause {
        Cause::Empty => None,
        Cause::Then(..) => {
            let mut parts = Vec::new();
            collect_then(cause, &mut parts);
            collapse(parts, Shape::Sequence)
        }
        Cause::Both(..) => {
            let mut parts = Vec::new();
            collect_both(cause, &mut parts);
            collapse(parts, Shape::Parallel)
        }
        leaf => Some(Shape::Leaf(leaf)),
    }
}

fn collapse<'a, E>(
    mut parts: Vec<Shape<'a, E>>,
    wrap: fn(Vec<Shape<'a, E>>) -> Shape<'a, E>,
) -> Option<Shape<'a, E>> {
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(wrap(parts)),
    }
}

fn collect_then<'a, E>(cause: &'a Cause<E>, parts: &mut Vec<Shape<'a, E>>) {
    if let Cause::Then(left, right) = cause {
        collect_then(left, parts);
        collect_then(right, parts);
    } else if let Some(part) = shape(cause) {
        parts.push(part);
    }
}

fn collect_both<'a, E>(cause: &'a Cause<E>, parts: &mut Vec<Shape<'a, E>>) {
    if let Cause::Both(left, right) = cause {
        collect_both(left, parts);
        collect_both(right, parts);
    } else if let Some(part) = shape(cause) {
        parts.push(part);
    }
}

fn shapes_equal<E: PartialEq>(left: &Shape<'_, E>, right: &Shape<'_, E>) -> bool {
    match (left, right) {
        (Shape::Leaf(left), Shape::Leaf(right)) => leaves_equal(left, right),
        (Shape::Sequence(left), Shape::Sequence(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .zip(right.iter())
                    .all(|(left, right)| shapes_equal(left, right))
        }
        (Shape::Parallel(left), Shape::Parallel(right)) => {
            if left.len() != right.len() {
                return false;
            }
            let mut matched = vec![false; right.len()];
            left.iter().all(|candidate| {
                let position = right.iter().enumerate().position(|(index, other)| {
                    !matched[index] && shapes_equal(candidate, other)
                });
                position.is_some_and(|index| {
                    matched[index] = true;
                    true
                })
            })
        }
        _ => false,
    }
}

fn leaves_equal<E: PartialEq>(left: &Cause<E>, right: &Cause<E>) -> bool {
    match (left, right) {
        (Cause::Fail(left), Cause::Fail(right)) => left == right,
        (Cause::Die(left), Cause::Die(right)) => left == right,
        (Cause::Interrupt(left), Cause::Interrupt(right)) => left == right,
        _ => false,
    }
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        match (shape(self), shape(other)) {
            (None, None) => true,
            (Some(left), Some(right)) => shapes_equal(&left, &right),
            _ => false,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fiber(sequence: u64) -> FiberId {
        FiberId::new(0, sequence)
    }

    #[rstest]
    fn then_with_empty_is_identity() {
        let cause: Cause<i32> = Cause::fail(1);
        assert_eq!(Cause::then(Cause::Empty, cause.clone()), cause);
        assert_eq!(Cause::then(cause.clone(), Cause::Empty), cause);
    }

    #[rstest]
    fn raw_empty_nodes_are_ignored_by_equality() {
        let raw: Cause<i32> = Cause::Then(Box::new(Cause::Empty), Box::new(Cause::fail(1)));
        assert_eq!(raw, Cause::fail(1));
    }

    #[rstest]
    fn both_is_order_insensitive() {
        let left: Cause<i32> = Cause::both(Cause::fail(1), Cause::interrupt(fiber(2)));
        let right = Cause::both(Cause::interrupt(fiber(2)), Cause::fail(1));
        assert_eq!(left, right);
    }

    #[rstest]
    fn then_is_order_sensitive() {
        let left: Cause<i32> = Cause::then(Cause::fail(1), Cause::fail(2));
        let right = Cause::then(Cause::fail(2), Cause::fail(1));
        assert_ne!(left, right);
    }

    #[rstest]
    fn failure_or_cause_prefers_typed_failures() {
        let cause: Cause<&str> = Cause::then(
            Cause::die(Defect::message("boom")),
            Cause::fail("expected"),
        );
        assert_eq!(cause.failure_or_cause(), Ok("expected"));

        let only_defect: Cause<&str> = Cause::die(Defect::message("boom"));
        assert!(only_defect.failure_or_cause().is_err());
    }

    #[rstest]
    fn fold_counts_every_leaf_once() {
        let cause: Cause<i32> = Cause::then(
            Cause::both(Cause::fail(1), Cause::die(Defect::message("x"))),
            Cause::interrupt(fiber(3)),
        );
        let count = cause.fold(
            &|| 0,
            &|_| 1,
            &|_| 1,
            &|_| 1,
            &|left, right| left + right,
            &|left, right| left + right,
        );
        assert_eq!(count, 3);
    }

    #[rstest]
    fn strip_failures_keeps_defects_and_interruptions() {
        let cause: Cause<i32> = Cause::then(Cause::fail(1), Cause::interrupt(fiber(7)));
        let stripped: Cause<()> = cause.strip_failures();
        assert_eq!(stripped, Cause::interrupt(fiber(7)));
    }

    #[rstest]
    fn interrupted_only_requires_interruptions() {
        let interrupted: Cause<i32> =
            Cause::both(Cause::interrupt(fiber(1)), Cause::interrupt(fiber(2)));
        assert!(interrupted.interrupted_only());
        assert_eq!(interrupted.interruptors().len(), 2);

        let mixed = Cause::then(Cause::fail(1), Cause::interrupt(fiber(1)));
        assert!(!mixed.interrupted_only());
        assert!(!Cause::<i32>::Empty.interrupted_only());
    }

    #[rstest]
    fn defect_from_panic_keeps_message() {
        let payload: Box<dyn Any + Send> = Box::new("kaboom");
        assert_eq!(Defect::from_panic(payload).to_string(), "kaboom");
    }

    #[rstest]
    fn pretty_lists_each_leaf() {
        let cause: Cause<&str> = Cause::both(Cause::fail("e"), Cause::die(Defect::message("d")));
        let report = cause.pretty();
        assert!(report.contains("parallel"));
        assert!(report.contains("\"e\""));
        assert!(report.contains("d"));
    }
}
