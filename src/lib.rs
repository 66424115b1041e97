//! Aureli: a lead-management backend with an automation-event dispatcher.
//!
//! Leads, users, and webhook settings live in SQLite behind an async handle.
//! Lead lifecycle changes enqueue automation events; a polling background
//! worker delivers them as webhook POSTs with retry, exponential backoff,
//! and per-event attempt bookkeeping.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod models;
pub mod scoring;
pub mod server;
pub mod webhook;
pub mod worker;
