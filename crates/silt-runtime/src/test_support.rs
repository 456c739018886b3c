//! Helpers for driving a pool from tests: a small configuration with signal
//! handlers disabled (so parallel test binaries never fight over process
//! state) and a runner that executes a closure as the initial message.

use crate::config::ThreadPoolConfig;
use crate::thread_pool::ThreadPool;
use crate::worker::WorkerContext;

pub fn test_config(workers: usize) -> ThreadPoolConfig {
    ThreadPoolConfig {
        set_affinity: false,
        blocking_threads: 2,
        install_signal_handlers: false,
        ..ThreadPoolConfig::with_workers(workers)
    }
}

/// Run `scenario` on worker 0 and block until some participant calls
/// `shutdown_thread_pool`. The scenario is responsible for triggering that
/// shutdown, directly or through a chain of messages.
pub fn run_scenario(workers: usize, scenario: impl FnOnce(&mut WorkerContext) + Send + 'static) {
    let pool = ThreadPool::new(test_config(workers)).expect("test pool config");
    pool.run(scenario).expect("test pool run");
}
