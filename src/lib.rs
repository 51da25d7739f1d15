//! # Tessera (Ticket-Granting & Service Validation Authority)
//!
//! `tessera` is a single sign-on authority speaking the CAS protocol, OAuth2/OIDC and the
//! SAML2 IdP front-channel. Every protocol is a thin adapter over one ticket engine.
//!
//! ## Tickets
//!
//! All tickets share one record shape ([`tickets::Ticket`]) tagged by kind:
//! `TGT-` (SSO session root), `ST-` (single-use service ticket), `PGT-`/`PT-` (proxy chain),
//! and `OC-`/`AT-`/`RT-` (OAuth code, access token, refresh token).
//!
//! - **Ancestry:** every ticket except a root TGT points at the ticket that granted it.
//!   Validation walks the chain, so revoking a TGT invalidates every descendant at once.
//! - **Single use:** consumption is a version compare-and-swap in the ticket store; two
//!   concurrent validators cannot both win.
//! - **Expiration:** evaluated lazily on every read. The reaper only reclaims space.
//!
//! ## SSO policy
//!
//! The concurrent-session policy (`allow`, `unique`, `unique-per-service`) is checked inside
//! the same atomic store commit that writes the new session, so two racing logins for one
//! principal cannot both pass.
//!
//! ## Authentication flow
//!
//! Login is a step-indexed state machine (primary credential, MFA challenge or registration,
//! device trust) whose state travels in a sealed short-lived `execution` token rather than
//! in server memory. User-facing failures use fixed messages that never reveal whether an
//! account exists.

pub mod api;
pub mod authn;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod mfa;
pub mod oidc;
pub mod principal;
pub mod registry;
pub mod saml;
pub mod tickets;
pub mod validation;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
