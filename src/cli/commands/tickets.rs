//! Ticket lifetimes and ticket store tuning.

use clap::{Arg, Command};

fn seconds(id: &'static str, env: &'static str, help: &'static str, default: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .default_value(default)
        .value_parser(clap::value_parser!(i64).range(1..))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(seconds(
            "tgt-max-ttl-seconds",
            "TESSERA_TGT_MAX_TTL_SECONDS",
            "Maximum lifetime of an SSO session",
            "28800",
        ))
        .arg(seconds(
            "tgt-idle-seconds",
            "TESSERA_TGT_IDLE_SECONDS",
            "Idle timeout of an SSO session",
            "7200",
        ))
        .arg(seconds(
            "st-ttl-seconds",
            "TESSERA_ST_TTL_SECONDS",
            "Lifetime of service and proxy tickets",
            "10",
        ))
        .arg(
            Arg::new("st-uses")
                .long("st-uses")
                .help("Number of validations a service or proxy ticket allows")
                .env("TESSERA_ST_USES")
                .default_value("1")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(seconds(
            "pgt-ttl-seconds",
            "TESSERA_PGT_TTL_SECONDS",
            "Maximum lifetime of a proxy-granting ticket",
            "28800",
        ))
        .arg(seconds(
            "oauth-code-ttl-seconds",
            "TESSERA_OAUTH_CODE_TTL_SECONDS",
            "Lifetime of an OAuth authorization code",
            "30",
        ))
        .arg(seconds(
            "access-token-ttl-seconds",
            "TESSERA_ACCESS_TOKEN_TTL_SECONDS",
            "Lifetime of OAuth access tokens and ID tokens",
            "28800",
        ))
        .arg(seconds(
            "refresh-token-ttl-seconds",
            "TESSERA_REFRESH_TOKEN_TTL_SECONDS",
            "Lifetime of OAuth refresh tokens",
            "2592000",
        ))
        .arg(
            Arg::new("store-retry-attempts")
                .long("store-retry-attempts")
                .help("Attempts per ticket store operation before giving up")
                .env("TESSERA_STORE_RETRY_ATTEMPTS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("store-retry-base-ms")
                .long("store-retry-base-ms")
                .help("Initial backoff between ticket store retries")
                .env("TESSERA_STORE_RETRY_BASE_MS")
                .default_value("50")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("store-retry-max-ms")
                .long("store-retry-max-ms")
                .help("Upper bound of the ticket store retry backoff")
                .env("TESSERA_STORE_RETRY_MAX_MS")
                .default_value("500")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("reaper-interval-seconds")
                .long("reaper-interval-seconds")
                .help("How often expired tickets are purged from the store")
                .env("TESSERA_REAPER_INTERVAL_SECONDS")
                .default_value("120")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
