//! Mirror of the PLC operation log and of AT protocol account repositories.
//!
//! The pieces:
//!
//! - [`plc`] tails the global identity log into the local [`db`] store.
//! - [`repo`] merges repository exports into per-account archives and
//!   projects their records.
//! - [`backfill`] drives both, plus per-account metadata fetches, as
//!   resumable batch jobs over thousands of hosts.
//! - [`proxy`] gates every outbound request through an adaptive per-host
//!   rate limiter.
//! - [`session`] wires it all together.

pub mod backfill;
pub mod car;
pub mod config;
pub mod db;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod plc;
pub mod proxy;
pub mod repo;
pub mod session;
pub mod xrpc;

#[cfg(test)]
mod test_utils;
