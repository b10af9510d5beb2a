//! Ratewarden - Request Admission and Rate Limiting
//!
//! This crate decides whether a client request may proceed under a named
//! policy. Counting happens in fixed windows kept in a shared Redis store,
//! with a per-process memory store taking over whenever Redis is not
//! reachable. Clients that exceed a window are blocked for a penalty period,
//! which grows exponentially for repeat offenders on escalating policies.

pub mod config;
pub mod error;
pub mod ops;
pub mod ratelimit;
pub mod response;
