/*!
 * Thin environment-detection wrappers. No policy lives here — callers
 * (chiefly [`crate::options::PoolOptions::build`]) decide what to do with
 * the numbers.
 */
use std::thread::ThreadId;

static MAIN_THREAD_ID: std::sync::OnceLock<ThreadId> = std::sync::OnceLock::new();

/// Call once, as early as possible (e.g. the first line of `main`), to
/// record which thread is "the main thread" for [`is_main_thread`].
pub fn mark_main_thread() {
    let _ = MAIN_THREAD_ID.set(std::thread::current().id());
}

/// Number of logical CPUs available to this process, per
/// `std::thread::available_parallelism`, falling back to 1.
pub fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Whether the calling thread is the one that called [`mark_main_thread`].
/// Returns `true` if `mark_main_thread` was never called (best-effort
/// default: assume the caller is the only thread that matters).
pub fn is_main_thread() -> bool {
    match MAIN_THREAD_ID.get() {
        Some(id) => *id == std::thread::current().id(),
        None => true,
    }
}
