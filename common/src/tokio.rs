// Thin wrapper around `tokio::spawn` that names the task for logging.
//
// Background workers (plan/prepare/post/seed/verify) are all spawned through
// this so a panic or early exit is attributed to a stage in the logs instead
// of showing up as an anonymous task.

use std::future::Future;

pub fn spawn_task<F>(name: &'static str, future: F) -> ::tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    ::tokio::spawn(async move {
        future.await;
    })
}

// Re-exported so callers don't need a direct `tokio` dependency just to name
// a task; mirrors the teacher's `tos_common::tokio` re-export surface.
pub use ::tokio::sync;
