//! Combining several promises of the same type.
//!
//! Children are attached in input order. A child that has already settled
//! reports right away, so among settled children the lowest index wins.
//! Children that lose keep running; a rejection from one of them that
//! arrives after the combined promise settled is reported as uncaught
//! (except for `first`, which expects failures).

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    error::PromiseError,
    node::Node,
    outcome::Outcome,
    promise::Promise,
    reason::Reason,
    util::Slot,
};

#[cfg(feature = "progress")]
use crate::progress::{Fanin, FaninMode, Progress};

/// Consumes the handles and returns their nodes along with the combined
/// depth.
fn nodes_of<T, I>(promises: I) -> (Vec<Arc<Node<T>>>, u32)
where
    T: Send + 'static,
    I: IntoIterator<Item = Promise<T>>,
{
    let nodes: Vec<_> = promises.into_iter().map(Promise::into_node).collect();
    let depth = nodes.iter().map(|node| node.depth()).max().unwrap_or(0);
    (nodes, depth)
}

/// Feeds the children's progress into `target`.
#[cfg(feature = "progress")]
pub(crate) fn fan_in<U>(target: &Arc<Node<U>>, children: &[(&Progress, u32)], mode: FaninMode)
where
    U: Send + 'static,
{
    let depths: Vec<u32> = children.iter().map(|(_, depth)| *depth).collect();
    let fanin = Arc::new(Fanin::new(mode, &depths));
    let scale = f64::from(target.depth()) + 1.0;
    for (index, (progress, _)) in children.iter().enumerate() {
        let fanin = Arc::clone(&fanin);
        target.watch(progress, move |raw| fanin.update(index, raw) * scale);
    }
}

#[cfg(feature = "progress")]
fn fan_in_nodes<T, U>(target: &Arc<Node<U>>, nodes: &[Arc<Node<T>>], mode: FaninMode)
where
    U: Send + 'static,
{
    let children: Vec<_> = nodes
        .iter()
        .map(|node| (&node.progress, node.depth()))
        .collect();
    fan_in(target, &children, mode);
}

/// Where `first` keeps the failures it has seen so far.
#[derive(Default)]
struct Failures {
    rejection: Option<Reason>,
    cancelation: Option<Option<Reason>>,
}

impl<T: Send + 'static> Promise<T> {
    /// Resolves with every value, in input order, once all promises resolve.
    /// Rejects or cancels as soon as any of them does.
    ///
    /// An empty input resolves right away with an empty `Vec`.
    pub fn all<I>(promises: I) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let (nodes, depth) = nodes_of(promises);
        if nodes.is_empty() {
            return Promise::resolved(Vec::new());
        }

        let target = Node::<Vec<T>>::new(depth);
        #[cfg(feature = "progress")]
        fan_in_nodes(&target, &nodes, FaninMode::Average);

        let slots: Arc<Vec<Slot<T>>> = Arc::new(nodes.iter().map(|_| Slot::empty()).collect());
        let remaining = Arc::new(AtomicUsize::new(nodes.len()));
        for (index, node) in nodes.into_iter().enumerate() {
            let target = Arc::clone(&target);
            let slots = Arc::clone(&slots);
            let remaining = Arc::clone(&remaining);
            node.add_waiter(Box::new(move |outcome| match outcome {
                Outcome::Resolved(value) => {
                    let _ = slots[index].put(value);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let values = slots.iter().filter_map(Slot::take).collect();
                        target.settle_or_report(Outcome::Resolved(values));
                    }
                }
                Outcome::Rejected(reason) => target.settle_or_report(Outcome::Rejected(reason)),
                Outcome::Canceled(reason) => target.settle_or_report(Outcome::Canceled(reason)),
            }));
        }
        Promise::from_node(target)
    }

    /// Settles the same way as whichever promise settles first.
    ///
    /// Fails with [`PromiseError::EmptyArgument`] if there are no promises.
    pub fn race<I>(promises: I) -> Result<Promise<T>, PromiseError>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let (nodes, depth) = nodes_of(promises);
        if nodes.is_empty() {
            return Err(PromiseError::EmptyArgument);
        }

        let target = Node::<T>::new(depth);
        #[cfg(feature = "progress")]
        fan_in_nodes(&target, &nodes, FaninMode::Max);

        for node in nodes {
            let target = Arc::clone(&target);
            node.add_waiter(Box::new(move |outcome| target.settle_or_report(outcome)));
        }
        Ok(Promise::from_node(target))
    }

    /// Resolves with the first value to arrive. If no promise resolves, it
    /// rejects with the last rejection seen or, if there was none, cancels
    /// with the last cancelation reason.
    ///
    /// Fails with [`PromiseError::EmptyArgument`] if there are no promises.
    pub fn first<I>(promises: I) -> Result<Promise<T>, PromiseError>
    where
        I: IntoIterator<Item = Promise<T>>,
    {
        let (nodes, depth) = nodes_of(promises);
        if nodes.is_empty() {
            return Err(PromiseError::EmptyArgument);
        }

        let target = Node::<T>::new(depth);
        #[cfg(feature = "progress")]
        fan_in_nodes(&target, &nodes, FaninMode::Max);

        let failures = Arc::new(Mutex::new(Failures::default()));
        let remaining = Arc::new(AtomicUsize::new(nodes.len()));
        for node in nodes {
            let target = Arc::clone(&target);
            let failures = Arc::clone(&failures);
            let remaining = Arc::clone(&remaining);
            node.add_waiter(Box::new(move |outcome| {
                match outcome {
                    Outcome::Resolved(value) => {
                        let _ = target.try_settle(Outcome::Resolved(value));
                    }
                    Outcome::Rejected(reason) => failures.lock().rejection = Some(reason),
                    Outcome::Canceled(reason) => failures.lock().cancelation = Some(reason),
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let failures = std::mem::take(&mut *failures.lock());
                let outcome = match failures {
                    Failures {
                        rejection: Some(reason),
                        ..
                    } => Outcome::Rejected(reason),
                    Failures {
                        cancelation: Some(reason),
                        ..
                    } => Outcome::Canceled(reason),
                    // Everything resolved; the first one already won.
                    _ => return,
                };
                let _ = target.try_settle(outcome);
            }));
        }
        Ok(Promise::from_node(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deferred::Deferred, outcome::State, test_utils::UncaughtRejections};

    #[test]
    fn late_rejections_from_losers_are_reported() {
        let uncaught = UncaughtRejections::capture();
        let (loser, b) = Deferred::<u8>::new();
        let race = Promise::race([Promise::resolved(1), b]).unwrap();
        assert_eq!(race.wait().resolved(), Some(1));
        loser.reject("too late").unwrap();
        assert_eq!(uncaught.take().len(), 1);

        let (loser, b) = Deferred::<u8>::new();
        let first = Promise::first([Promise::resolved(1), b]).unwrap();
        assert_eq!(first.wait().resolved(), Some(1));
        loser.reject("expected").unwrap();
        assert!(uncaught.take().is_empty());
    }

    #[test]
    fn all_collects_in_input_order() {
        let (first, a) = Deferred::<u8>::new();
        let (second, b) = Deferred::<u8>::new();
        let all = Promise::all([a, b, Promise::resolved(3)]);
        second.resolve(2).unwrap();
        assert!(all.is_pending());
        first.resolve(1).unwrap();
        assert_eq!(all.wait().resolved(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn all_of_nothing_resolves_immediately() {
        let all = Promise::<u8>::all(Vec::new());
        assert_eq!(all.state(), State::Resolved);
        assert_eq!(all.wait().resolved(), Some(Vec::new()));
    }

    #[test]
    fn all_short_circuits_on_cancelation() {
        let (_pending, a) = Deferred::<u8>::new();
        let all = Promise::all([a, Promise::canceled()]);
        assert_eq!(all.state(), State::Canceled);
    }

    #[test]
    fn race_prefers_the_lowest_settled_index() {
        let race = Promise::race([Promise::rejected("left"), Promise::resolved(2)]).unwrap();
        assert!(race.wait().is_rejected());
    }

    #[test]
    fn empty_race_and_first_fail() {
        assert_eq!(
            Promise::<u8>::race(Vec::new()).err(),
            Some(PromiseError::EmptyArgument)
        );
        assert_eq!(
            Promise::<u8>::first(Vec::new()).err(),
            Some(PromiseError::EmptyArgument)
        );
    }

    #[test]
    fn first_waits_for_a_resolution() {
        let (late, b) = Deferred::<u8>::new();
        let first = Promise::first([Promise::rejected("nope"), b]).unwrap();
        assert!(first.is_pending());
        late.resolve(7).unwrap();
        assert_eq!(first.wait().resolved(), Some(7));
    }

    #[test]
    fn first_prefers_rejection_over_cancelation() {
        let first = Promise::<u8>::first([
            Promise::rejected("bad"),
            Promise::canceled_with("stop"),
        ])
        .unwrap();
        let reason = first.wait().rejected().unwrap();
        assert_eq!(reason.downcast_ref::<&str>(), Some(&"bad"));

        let first = Promise::<u8>::first([Promise::canceled(), Promise::canceled_with(4u8)]).unwrap();
        assert!(matches!(first.wait(), Outcome::Canceled(Some(r)) if r.is::<u8>()));
    }
}
