pub mod app;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod export;
pub mod hypervisor;
pub mod metadata;
pub mod mover;
pub mod retention;
pub mod runner;
pub mod storage;
pub mod task;
pub mod writer;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
