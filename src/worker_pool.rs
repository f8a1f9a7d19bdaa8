//! Bounded worker pool (§5): fan work for one phase out across at most
//! `ctx.effective_threads()` threads, each taking a `&self`-style closure
//! rather than owning any shared mutable state directly — the per-group
//! locking discipline (one mutex per AG's block-state map/rmap slab, a
//! reader/writer lock per inode tree) is what actually keeps concurrent
//! access safe, not this primitive.
//!
//! The work queue is fully populated before any thread starts, so no
//! `Condvar` is needed: a thread that finds the queue empty has nothing
//! left to wait for.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::context::RepairContext;

/// Run `f` over every item in `items`, across up to `ctx.effective_threads()`
/// worker threads, preserving the original item order in the result.
///
/// Falls back to a plain sequential iteration when only one thread would
/// be used — avoiding the `thread::scope` setup cost for single-AG runs
/// and `-P`/`single_threaded` configurations.
pub fn map<T, R>(ctx: &RepairContext, items: Vec<T>, f: impl Fn(T) -> R + Sync) -> Vec<R>
where
    T: Send,
    R: Send,
{
    let threads = ctx.effective_threads().min(items.len().max(1));

    if threads <= 1 {
        return items.into_iter().map(f).collect();
    }

    let queue: Mutex<VecDeque<(usize, T)>> =
        Mutex::new(items.into_iter().enumerate().collect());
    let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| loop {
                let next = queue.lock().unwrap().pop_front();
                let Some((idx, item)) = next else { break };
                let result = f(item);
                results.lock().unwrap().push((idx, result));
            });
        }
    });

    let mut out = results.into_inner().unwrap();
    out.sort_unstable_by_key(|(idx, _)| *idx);
    out.into_iter().map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order_across_threads() {
        let ctx = RepairContext::default().thread_count(4);
        let items: Vec<u32> = (0..200).collect();
        let out = map(&ctx, items.clone(), |n| n * 2);
        let expected: Vec<u32> = items.iter().map(|n| n * 2).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn single_threaded_falls_back_to_sequential() {
        let ctx = RepairContext::default().single_threaded(true);
        let out = map(&ctx, vec![1, 2, 3], |n| n + 1);
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn empty_input_returns_empty_output() {
        let ctx = RepairContext::default();
        let out: Vec<u32> = map(&ctx, Vec::new(), |n: u32| n);
        assert!(out.is_empty());
    }
}
