use crate::{
    cli::actions::Action,
    config::ServerConfig,
    engine::ConcurrentSessionPolicy,
    principal::MergeStrategy,
    tickets::{ExpirationPolicies, ExpirationPolicy, retry::RetryPolicy},
};
use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

fn string(matches: &clap::ArgMatches, id: &str) -> Option<String> {
    matches.get_one::<String>(id).cloned()
}

fn secret(matches: &clap::ArgMatches, id: &str) -> Option<SecretString> {
    string(matches, id).map(SecretString::from)
}

fn path(matches: &clap::ArgMatches, id: &str) -> Option<PathBuf> {
    string(matches, id).map(PathBuf::from)
}

fn seconds(matches: &clap::ArgMatches, id: &str) -> Result<i64> {
    matches
        .get_one::<i64>(id)
        .copied()
        .with_context(|| format!("missing argument: --{id}"))
}

fn u64_arg(matches: &clap::ArgMatches, id: &str) -> Result<u64> {
    matches
        .get_one::<u64>(id)
        .copied()
        .with_context(|| format!("missing argument: --{id}"))
}

fn u32_arg(matches: &clap::ArgMatches, id: &str) -> Result<u32> {
    matches
        .get_one::<u32>(id)
        .copied()
        .with_context(|| format!("missing argument: --{id}"))
}

/// Ticket lifetimes. Proxy tickets follow service tickets and a proxy-granting ticket
/// never idles longer than it may live.
fn policies(matches: &clap::ArgMatches) -> Result<ExpirationPolicies> {
    let tgt_idle = seconds(matches, "tgt-idle-seconds")?;
    let st_uses = u32_arg(matches, "st-uses")?;
    let st_ttl = seconds(matches, "st-ttl-seconds")?;
    let pgt_ttl = seconds(matches, "pgt-ttl-seconds")?;

    let one_time = ExpirationPolicy::MultiTimeUseOrTimeout {
        uses: st_uses,
        time_to_live_seconds: st_ttl,
    };

    Ok(ExpirationPolicies::default()
        .with_ticket_granting_ticket(ExpirationPolicy::TicketGranting {
            max_time_to_live_seconds: seconds(matches, "tgt-max-ttl-seconds")?,
            time_to_idle_seconds: tgt_idle,
        })
        .with_service_ticket(one_time)
        .with_proxy_ticket(one_time)
        .with_proxy_granting_ticket(ExpirationPolicy::TicketGranting {
            max_time_to_live_seconds: pgt_ttl,
            time_to_idle_seconds: tgt_idle.min(pgt_ttl),
        })
        .with_oauth_code(ExpirationPolicy::MultiTimeUseOrTimeout {
            uses: 1,
            time_to_live_seconds: seconds(matches, "oauth-code-ttl-seconds")?,
        })
        .with_access_token(ExpirationPolicy::HardTimeout {
            time_to_live_seconds: seconds(matches, "access-token-ttl-seconds")?,
        })
        .with_refresh_token(ExpirationPolicy::HardTimeout {
            time_to_live_seconds: seconds(matches, "refresh-token-ttl-seconds")?,
        }))
}

/// Assemble the server configuration from parsed arguments.
///
/// # Errors
/// Returns an error if an argument is missing or cannot be interpreted.
pub fn config(matches: &clap::ArgMatches) -> Result<ServerConfig> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let concurrent_session_policy: ConcurrentSessionPolicy = string(matches, "concurrent-session-policy")
        .unwrap_or_else(|| "allow".to_string())
        .parse()
        .map_err(|e: String| anyhow!(e))
        .context("invalid TESSERA_CONCURRENT_SESSION_POLICY")?;

    let attribute_merge_strategy: MergeStrategy = string(matches, "attribute-merge-strategy")
        .unwrap_or_else(|| "multivalued".to_string())
        .parse()
        .map_err(|e: String| anyhow!(e))
        .context("invalid TESSERA_ATTRIBUTE_MERGE_STRATEGY")?;

    let sso_excluded_principals = matches
        .get_many::<String>("sso-excluded-principals")
        .map(|values| {
            values
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let retry = RetryPolicy::new()
        .with_attempts(u32_arg(matches, "store-retry-attempts")?)
        .with_base_delay(Duration::from_millis(u64_arg(matches, "store-retry-base-ms")?))
        .with_max_delay(Duration::from_millis(u64_arg(matches, "store-retry-max-ms")?));

    let mut config = ServerConfig::new()
        .with_port(port)
        .with_dsn(secret(matches, "dsn"))
        .with_services_file(path(matches, "services-file"))
        .with_accounts_file(path(matches, "accounts-file"))
        .with_delegated_clients_file(path(matches, "delegated-clients-file"))
        .with_policies(policies(matches)?)
        .with_concurrent_session_policy(concurrent_session_policy)
        .with_sso_excluded_principals(sso_excluded_principals)
        .with_attribute_merge_strategy(attribute_merge_strategy)
        .with_mfa_global_provider(string(matches, "mfa-global-provider"))
        .with_trusted_devices(matches.get_flag("trusted-devices"))
        .with_duo_verify_url(string(matches, "duo-verify-url"))
        .with_external_timeout(Duration::from_secs(u64_arg(
            matches,
            "external-timeout-seconds",
        )?))
        .with_cookie_key(secret(matches, "cookie-key"))
        .with_flow_key(secret(matches, "flow-key"))
        .with_ticket_signing_key(secret(matches, "ticket-signing-key"))
        .with_ticket_encryption_key(secret(matches, "ticket-encryption-key"))
        .with_ticket_suffix(string(matches, "ticket-suffix"))
        .with_oidc_issuer(string(matches, "oidc-issuer"))
        .with_oidc_signing_secret(secret(matches, "oidc-signing-secret"))
        .with_oidc_signing_key_path(path(matches, "oidc-signing-key-path"))
        .with_saml_entity_id(string(matches, "saml-entity-id"))
        .with_saml_signing_key_path(path(matches, "saml-signing-key-path"))
        .with_retry(retry)
        .with_reaper_interval(Duration::from_secs(u64_arg(
            matches,
            "reaper-interval-seconds",
        )?))
        .with_throttle(
            u32_arg(matches, "throttle-failure-threshold")?,
            Duration::from_secs(u64_arg(matches, "throttle-window-seconds")?),
        )
        .with_trust_forwarded_headers(matches.get_flag("trust-forwarded-headers"))
        .with_actuator_token(secret(matches, "actuator-token"));

    if let Some(prefix) = string(matches, "server-prefix") {
        url::Url::parse(&prefix).context("invalid TESSERA_SERVER_PREFIX")?;
        config = config.with_server_prefix(prefix);
    }
    if let Some(issuer) = string(matches, "gauth-issuer") {
        config = config.with_gauth_issuer(issuer);
    }

    Ok(config)
}

/// Every invocation serves; the arguments only shape the configuration.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Serve(config(matches)?))
}
