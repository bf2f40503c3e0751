//! # Clearscan Server
//!
//! The long-running orchestrator process. It loads layered configuration,
//! opens the scan store, forwards worker queue events from Redis onto the
//! in-process bus and supervises queue event sync plus the reconciliation
//! sweeper until shutdown.

pub mod infra;
