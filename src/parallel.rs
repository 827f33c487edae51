//! Work dispatch across a fixed set of worker threads.
//!
//! Both runners spawn one scoped thread per entry of `states` and hand the
//! work function `(index, tid, &mut state)`; the exclusive borrow of each
//! state is what lets workers keep PRNGs and scratch without locks. The
//! runners join every worker before returning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Dispatch indices `begin..end` through a shared atomic counter. Whichever
/// worker is free takes the next index, so load balances well at the price of
/// one contended atomic.
pub fn parallel_for<S, F>(begin: usize, end: usize, states: &mut [S], f: F)
where
    S: Send,
    F: Fn(usize, usize, &mut S) + Sync,
{
    let next = AtomicUsize::new(begin);
    let next = &next;
    let f = &f;
    thread::scope(|scope| {
        for (tid, state) in states.iter_mut().enumerate() {
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= end {
                    break;
                }
                f(i, tid, state);
            });
        }
    });
}

/// Dispatch indices `begin..end` in contiguous per-worker slices; the last
/// worker absorbs the remainder. No shared counter, but a worker that
/// finishes early idles until the join.
pub fn parallel_for_partitioned<S, F>(begin: usize, end: usize, states: &mut [S], f: F)
where
    S: Send,
    F: Fn(usize, usize, &mut S) + Sync,
{
    let workers = states.len();
    let batch = (end - begin) / workers;
    let f = &f;
    thread::scope(|scope| {
        for (tid, state) in states.iter_mut().enumerate() {
            let lo = begin + tid * batch;
            let hi = if tid + 1 < workers {
                begin + (tid + 1) * batch
            } else {
                end
            };
            scope.spawn(move || {
                for i in lo..hi {
                    f(i, tid, state);
                }
            });
        }
    });
}
