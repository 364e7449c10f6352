//! Strictly sequential async iteration.
//!
//! [`drive`] runs one async step per item, in order, never overlapping
//! two steps. State threads through the step function by value, which
//! keeps the closure free of lifetime bounds and makes the
//! one-at-a-time discipline structural: the next step cannot start
//! until the previous one has returned the state.

use std::future::Future;

/// Whether to keep driving after a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop draining; remaining items are never visited.
    Stop,
}

/// Drive `step` over `items` sequentially, threading `state` through.
///
/// Returns the final state and how many steps ran.
pub async fn drive<S, T, I, F, Fut>(mut state: S, items: I, mut step: F) -> (S, usize)
where
    I: IntoIterator<Item = T>,
    F: FnMut(S, T) -> Fut,
    Fut: Future<Output = (S, Flow)>,
{
    let mut ran = 0;
    for item in items {
        let (next, flow) = step(state, item).await;
        state = next;
        ran += 1;
        if flow == Flow::Stop {
            break;
        }
    }
    (state, ran)
}
