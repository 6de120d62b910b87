// Bundle Pipeline Daemon
// Exposes internal modules for integration testing and the `bundler-daemon` binary.

#[macro_use]
extern crate log;

pub mod config;
pub mod core;
pub mod rpc;

#[cfg(test)]
pub mod test_support;
