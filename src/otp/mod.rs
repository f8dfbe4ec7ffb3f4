//! Email one-time codes used as the second factor.
//!
//! Flow Overview:
//! 1) `issue` draws a six-digit code, stores only its Argon2id hash with an
//!    expiry and a zeroed attempt counter, then emails the code after commit.
//! 2) `verify` locks the user, loads the challenge and checks, in order:
//!    expiry (clears the challenge), the attempt ceiling, then the hash.
//! 3) A success clears the challenge so the same code never verifies twice.
//!
//! Expired challenges nobody verifies are removed by the reconciliation sweep.

pub mod crypto;
pub mod models;
pub mod repo;
pub mod service;

pub use service::{OtpError, OtpService};
