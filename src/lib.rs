//! wrenmail: an async mail engine core for a terminal IMAP/SMTP client.
//!
//! The crate is organized as one module per component from the design
//! (cache, search, queue, addressbook, imap, smtp, status, sleep,
//! controller), plus the shared `types`/`errors` vocabulary and the ambient
//! concerns (`config`, `sanitize`, `oauth`, `export`).

pub mod addressbook;
pub mod cache;
pub mod cli;
pub mod config;
pub mod controller;
pub mod errors;
pub mod export;
pub mod imap;
pub mod oauth;
pub mod queue;
pub mod sanitize;
pub mod search;
pub mod sleep;
pub mod smtp;
pub mod status;
pub mod types;

pub mod app;
