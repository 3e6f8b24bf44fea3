#[path = "e2e/concurrent_append.rs"]
mod concurrent_append;

#[path = "e2e/halt_and_clear.rs"]
mod halt_and_clear;

#[path = "e2e/context_stability.rs"]
mod context_stability;

#[path = "e2e/cooling_period.rs"]
mod cooling_period;

#[path = "e2e/restart_and_inspect.rs"]
mod restart_and_inspect;

#[path = "e2e/writer_liveness.rs"]
mod writer_liveness;
