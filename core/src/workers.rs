//! Scoped fan-out used for per-reference matching and review chains.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A closure panicked on one of the items; the whole batch is discarded.
#[derive(Debug, thiserror::Error)]
#[error("worker panicked: {0}")]
pub struct WorkerPanic(pub String);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn run_chunk<T, R, F>(part: &[T], f: &F) -> Result<Vec<R>, WorkerPanic>
where
    F: Fn(&T) -> R,
{
    catch_unwind(AssertUnwindSafe(|| part.iter().map(f).collect::<Vec<R>>()))
        .map_err(|payload| WorkerPanic(panic_message(payload.as_ref())))
}

/// Apply `f` to every item across at most `workers` scoped threads.
/// Output order always matches input order. A panic in `f` is returned
/// as `WorkerPanic` and never re-raised on the calling thread.
pub fn parallel_map<T, R, F>(items: &[T], workers: usize, f: F) -> Result<Vec<R>, WorkerPanic>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.max(1).min(items.len());
    if workers <= 1 {
        return run_chunk(items, &f).inspect_err(|e| log::error!("{e}"));
    }
    let chunk = items.len().div_ceil(workers);
    let f = &f;
    let parts: Vec<Result<Vec<R>, WorkerPanic>> = std::thread::scope(|scope| {
        let handles: Vec<_> = items.chunks(chunk).map(|part| scope.spawn(move || run_chunk(part, f))).collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| Err(WorkerPanic(panic_message(payload.as_ref())))))
            .collect()
    });
    let mut out = Vec::with_capacity(items.len());
    for part in parts {
        match part {
            Ok(values) => out.extend(values),
            Err(e) => {
                log::error!("{e}; discarding {} item(s)", items.len());
                return Err(e);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_order() {
        let items: Vec<u32> = (0..103).collect();
        let out = parallel_map(&items, 4, |x| x * 2).unwrap();
        assert_eq!(out, items.iter().map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn handles_empty_input() {
        let out: Vec<u32> = parallel_map(&[] as &[u32], 8, |x| *x).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn panicking_item_is_reported_not_raised() {
        let items: Vec<u32> = (0..20).collect();
        for workers in [1, 4] {
            let err = parallel_map(&items, workers, |x| {
                if *x == 13 {
                    panic!("bad item {x}");
                }
                *x
            })
            .unwrap_err();
            assert_eq!(err.0, "bad item 13");
        }
    }
}
