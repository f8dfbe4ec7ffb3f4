//! # Shiftgate (biometric shift presence verification)
//!
//! `shiftgate` confirms that the person starting or ending a shift is the
//! registered employee. It stores one encrypted face template per user,
//! compares fresh captures against it, and falls back to a one-time code
//! delivered out-of-band when the biometric path is unavailable.
//!
//! ## Data at rest
//!
//! - **Templates:** Each profile is sealed with its own 256-bit key using
//!   `ChaCha20-Poly1305`. The per-profile key is wrapped by a key custody
//!   backend (a local KEK or Vault transit) and only the wrapped form is stored.
//! - **Ledgers:** Verification attempts and audit entries are append-only.
//!   Audit rows carry a retention deadline and are purged by a background sweep.
//!
//! ## Abuse protection
//!
//! Verification is gated by a per-user sliding-window rate limit and a
//! consecutive-failure lockout. Devices are fingerprinted and scored; a
//! blocked device can never produce a successful verification.
//!
//! ## Consistency
//!
//! Every state-changing operation serializes on the user row
//! (`SELECT ... FOR UPDATE`) and commits all of its writes in one transaction.
//! Key custody calls happen outside the transaction.

pub mod api;
pub mod biometric;
pub mod cli;
pub mod email;
pub mod notify;
pub mod otp;
pub mod sweep;
pub mod vault;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
