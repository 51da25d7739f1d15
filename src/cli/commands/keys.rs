//! Key material. Every key is hex encoded; a random key is generated per process when
//! one is missing, which invalidates cookies and tickets across restarts.

use clap::{Arg, Command};

fn hex_key(id: &'static str, env: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .hide_env_values(true)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(hex_key(
            "cookie-key",
            "TESSERA_COOKIE_KEY",
            "32-byte key sealing the TGC cookie",
        ))
        .arg(hex_key(
            "flow-key",
            "TESSERA_FLOW_KEY",
            "32-byte key sealing login flow state and MFA records",
        ))
        .arg(hex_key(
            "ticket-signing-key",
            "TESSERA_TICKET_SIGNING_KEY",
            "Key signing JWT service tickets",
        ))
        .arg(hex_key(
            "ticket-encryption-key",
            "TESSERA_TICKET_ENCRYPTION_KEY",
            "32-byte key encrypting JWT service tickets",
        ))
        .arg(
            Arg::new("ticket-suffix")
                .long("ticket-suffix")
                .help("Node suffix appended to ticket ids")
                .env("TESSERA_TICKET_SUFFIX"),
        )
}
