//! Count-down barrier over independent async operations.

use std::future::Future;

use tokio::task::JoinSet;

/// Runs every future concurrently and resolves once all of them resolved,
/// returning their outputs in submission order. A slot stays `None` when
/// its task was cancelled. No futures resolves immediately.
pub async fn parallel<F>(calls: Vec<F>) -> Vec<Option<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut remaining = calls.len();
    let mut outputs: Vec<Option<F::Output>> = (0..remaining).map(|_| None).collect();
    if remaining == 0 {
        return Vec::new();
    }

    let mut set = JoinSet::new();
    for (idx, call) in calls.into_iter().enumerate() {
        set.spawn(async move { (idx, call.await) });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, out)) => outputs[idx] = Some(out),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {}
        }
        remaining -= 1;
        if remaining == 0 {
            break;
        }
    }
    outputs
}
