//! Combinators over several deferreds.

use crate::deferred::{Deferred, Ivar};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Determined once every input is, with the values in input order.
///
/// An empty input yields an already determined empty vector.
pub fn all<T: Clone + 'static>(deferreds: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>> {
    let deferreds: Vec<Deferred<T>> = deferreds.into_iter().collect();
    if deferreds.is_empty() {
        return Deferred::value(Vec::new());
    }

    let result = Ivar::new();
    let out = result.read();
    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; deferreds.len()]));
    let remaining = Rc::new(Cell::new(deferreds.len()));

    for (index, deferred) in deferreds.iter().enumerate() {
        let slots = slots.clone();
        let remaining = remaining.clone();
        let result = result.clone();

        deferred.upon(move |value| {
            slots.borrow_mut()[index] = Some(value);
            remaining.set(remaining.get() - 1);

            if remaining.get() == 0 {
                let values: Vec<T> = slots.borrow_mut().drain(..).flatten().collect();
                result.fill(values);
            }
        });
    }

    out
}

/// Like [`all`] for unit deferreds.
pub fn all_unit(deferreds: impl IntoIterator<Item = Deferred<()>>) -> Deferred<()> {
    all(deferreds).ignore()
}

/// Determined with the value of whichever input is determined first.
pub fn any<T: Clone + 'static>(deferreds: impl IntoIterator<Item = Deferred<T>>) -> Deferred<T> {
    let result = Ivar::new();

    for deferred in deferreds {
        let result = result.clone();
        deferred.upon(move |value| {
            result.fill_if_empty(value);
        });
    }

    result.read()
}

pub fn both<A, B>(first: &Deferred<A>, second: &Deferred<B>) -> Deferred<(A, B)>
where
    A: Clone + 'static,
    B: Clone + 'static,
{
    let second = second.clone();
    first.bind(move |a| second.map(move |b| (a, b)))
}

trait Choosable<T> {
    fn upon_determined(&self, callback: Box<dyn FnOnce()>);
    fn is_determined(&self) -> bool;
    fn apply(self: Box<Self>) -> Option<T>;
}

struct Mapped<A, F> {
    deferred: Deferred<A>,
    function: F,
}

impl<A, T, F> Choosable<T> for Mapped<A, F>
where
    A: Clone + 'static,
    F: FnOnce(A) -> T,
{
    fn upon_determined(&self, callback: Box<dyn FnOnce()>) {
        self.deferred.upon(move |_| callback());
    }

    fn is_determined(&self) -> bool {
        self.deferred.is_determined()
    }

    fn apply(self: Box<Self>) -> Option<T> {
        let Mapped { deferred, function } = *self;
        deferred.peek().map(function)
    }
}

/// One arm of [`choose`]: a deferred and the function applied to its value
/// if this arm wins.
pub struct Choice<T> {
    inner: Box<dyn Choosable<T>>,
}

impl<T> fmt::Debug for Choice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Choice")
            .field("determined", &self.inner.is_determined())
            .finish()
    }
}

pub fn choice<A, T, F>(deferred: Deferred<A>, function: F) -> Choice<T>
where
    A: Clone + 'static,
    T: 'static,
    F: FnOnce(A) -> T + 'static,
{
    Choice {
        inner: Box::new(Mapped { deferred, function }),
    }
}

/// Determined once any choice's deferred is.
///
/// When the first callback runs, the first choice in list order whose
/// deferred is determined wins and only its function is applied. Choices
/// determined in the same cycle therefore resolve by position, not by
/// fill order.
pub fn choose<T: Clone + 'static>(choices: Vec<Choice<T>>) -> Deferred<T> {
    let result = Ivar::new();
    let out = result.read();

    let pending: Rc<RefCell<Option<Vec<Choice<T>>>>> = Rc::new(RefCell::new(None));

    for choice in &choices {
        let pending = pending.clone();
        let result = result.clone();

        choice.inner.upon_determined(Box::new(move || {
            let taken = pending.borrow_mut().take();
            let Some(choices) = taken else {
                return;
            };

            let chosen = choices
                .into_iter()
                .find(|choice| choice.inner.is_determined());

            if let Some(value) = chosen.and_then(|choice| choice.inner.apply()) {
                result.fill(value);
            }
        }));
    }

    *pending.borrow_mut() = Some(choices);

    out
}
