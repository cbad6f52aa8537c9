//! Client-side credit and gating engine for the CopyForge API.
//!
//! The crate wraps all dashboard HTTP traffic in an [`http::ApiClient`] and
//! lets a [`credits::CreditsMonitor`] observe it: credit balances are kept
//! current from headers, bodies and background refreshes, and exhausted
//! plans raise a paywall gate without any endpoint opting in.

pub mod auth;
pub mod config;
pub mod credits;
pub mod gate;
pub mod http;
pub mod subscription;
pub mod types;
