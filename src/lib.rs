//! Petalguard - Adaptive Rate Limiting for the Storefront API
//!
//! This crate implements an in-memory sliding window rate limiter with
//! per-operation policies, penalty blocks, load-based limit reduction and a
//! declared request size guard. It is exposed as axum middleware plus a small
//! set of health and admin endpoints.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
