//! Combining promises of different types into a tuple.
//!
//! ```
//! # use pledge::prelude::*;
//! let merged = merge((Promise::resolved(1), Promise::resolved("x")));
//! assert_eq!(merged.state(), State::Resolved);
//! assert_eq!(merged.wait().resolved(), Some((1, "x")));
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{node::Node, outcome::Outcome, promise::Promise, util::Slot};

#[cfg(feature = "progress")]
use crate::{combinators::fan_in, progress::FaninMode};

/// A tuple of promises that can be merged into a promise of a tuple.
///
/// Implemented for tuples of two to seven promises. The merged promise
/// resolves once every promise has resolved, and rejects or cancels as soon
/// as any of them does.
pub trait Merge {
    type Output;

    fn merge(self) -> Promise<Self::Output>;
}

/// Merges a tuple of promises. See [`Merge`].
pub fn merge<M: Merge>(promises: M) -> Promise<M::Output> {
    promises.merge()
}

/// A tuple of slots, one per child.
trait Slots: Send + Sync + 'static {
    type Values: Send + 'static;

    /// Takes every value, or nothing if a slot is still empty.
    fn take_all(&self) -> Option<Self::Values>;
}

struct MergeState<S> {
    slots: S,
    remaining: AtomicUsize,
}

/// Waits on one child, storing its value with `store`.
fn attach<V, S, F>(child: &Arc<Node<V>>, target: &Arc<Node<S::Values>>, state: &Arc<MergeState<S>>, store: F)
where
    V: Send + 'static,
    S: Slots,
    F: FnOnce(&S, V) + Send + 'static,
{
    let target = Arc::clone(target);
    let state = Arc::clone(state);
    child.add_waiter(Box::new(move |outcome| match outcome {
        Outcome::Resolved(value) => {
            store(&state.slots, value);
            if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(values) = state.slots.take_all() {
                    target.settle_or_report(Outcome::Resolved(values));
                }
            }
        }
        Outcome::Rejected(reason) => target.settle_or_report(Outcome::Rejected(reason)),
        Outcome::Canceled(reason) => target.settle_or_report(Outcome::Canceled(reason)),
    }));
}

macro_rules! impl_merge {
    ($len:literal => $($T:ident $child:ident $index:tt),+) => {
        impl<$($T: Send + 'static),+> Slots for ($(Slot<$T>,)+) {
            type Values = ($($T,)+);

            fn take_all(&self) -> Option<Self::Values> {
                Some(($(self.$index.take()?,)+))
            }
        }

        impl<$($T: Send + 'static),+> Merge for ($(Promise<$T>,)+) {
            type Output = ($($T,)+);

            fn merge(self) -> Promise<Self::Output> {
                let ($($child,)+) = self;
                $(let $child = $child.into_node();)+
                let depth = [$($child.depth()),+].into_iter().max().unwrap_or(0);

                let target = Node::<Self::Output>::new(depth);
                #[cfg(feature = "progress")]
                fan_in(&target, &[$((&$child.progress, $child.depth())),+], FaninMode::Average);

                let state = Arc::new(MergeState {
                    slots: ($(Slot::<$T>::empty(),)+),
                    remaining: AtomicUsize::new($len),
                });
                $(
                    attach(&$child, &target, &state, |slots, value| {
                        let _ = slots.$index.put(value);
                    });
                )+
                Promise::from_node(target)
            }
        }
    };
}

impl_merge!(2 => A a 0, B b 1);
impl_merge!(3 => A a 0, B b 1, C c 2);
impl_merge!(4 => A a 0, B b 1, C c 2, D d 3);
impl_merge!(5 => A a 0, B b 1, C c 2, D d 3, E e 4);
impl_merge!(6 => A a 0, B b 1, C c 2, D d 3, E e 4, F f 5);
impl_merge!(7 => A a 0, B b 1, C c 2, D d 3, E e 4, F f 5, G g 6);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deferred::Deferred, outcome::State, test_utils::UncaughtRejections};

    #[test]
    fn merge_waits_for_every_child() {
        let (number, a) = Deferred::<u32>::new();
        let (text, b) = Deferred::<String>::new();
        let merged = merge((a, b, Promise::resolved(true)));
        text.resolve("two".to_owned()).unwrap();
        assert!(merged.is_pending());
        number.resolve(1).unwrap();
        assert_eq!(merged.wait().resolved(), Some((1, "two".to_owned(), true)));
    }

    #[test]
    fn merge_rejects_on_the_first_rejection() {
        let uncaught = UncaughtRejections::capture();
        let (pending, a) = Deferred::<u32>::new();
        let merged = (a, Promise::<u8>::rejected("bad")).merge();
        assert_eq!(merged.state(), State::Rejected);
        // The pending child keeps the merged node alive until it goes away.
        merged.forget();
        assert!(uncaught.take().is_empty());
        drop(pending);
        assert_eq!(uncaught.take().len(), 1);
    }

    #[test]
    fn seven_way_merge() {
        let merged = merge((
            Promise::resolved(1u8),
            Promise::resolved(2u16),
            Promise::resolved(3u32),
            Promise::resolved(4u64),
            Promise::resolved('5'),
            Promise::resolved("6"),
            Promise::resolved(7.0f32),
        ));
        assert_eq!(
            merged.wait().resolved(),
            Some((1, 2, 3, 4, '5', "6", 7.0))
        );
    }
}
