pub mod aggregate;
pub mod backoff;
pub mod conflict;
pub mod engine;
mod engine_apply;
mod engine_reconcile;
pub mod item;
pub mod local;
pub mod local_watcher;
pub mod paths;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
