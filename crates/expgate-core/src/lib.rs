//! expgate-core
//!
//! Domain logic for the expgate access gateway: the access-token lifecycle
//! state machine, the client-binding anti-sharing guard, the proxy HTML
//! rewrite rules, and the hosted-content capture instrumentation. Everything
//! here is pure: time comes in as an explicit `now_ms` (or through the
//! [`clock::Clock`] trait) and all persistence is left to the caller.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod binding;
pub mod capture;
pub mod clock;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod rewrite;
pub mod token;
