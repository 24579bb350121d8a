//! HTTP gateway for breakfix training sessions.
//!
//! Wraps the session orchestrator's start, verify, next, connection and
//! status operations as JSON endpoints under `/v1/students/{id}`.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod catalog;
pub mod error;
pub mod routes;
