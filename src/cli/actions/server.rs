use crate::{api, cli::telemetry, config::ServerConfig};
use anyhow::Result;
use secrecy::ExposeSecret;
use tracing::info;
use url::Url;

/// # Errors
/// Returns an error if the ticket store, key material or listener cannot be set up.
pub async fn execute(config: ServerConfig) -> Result<()> {
    log_startup_args(&config);
    let result = api::new(config).await;
    telemetry::shutdown_tracer();
    result
}

fn log_startup_args(config: &ServerConfig) {
    let store = config
        .dsn()
        .map_or_else(|| "memory".to_string(), |dsn| redact_dsn(dsn.expose_secret()));
    let display_path = |path: Option<&std::path::PathBuf>| {
        path.map_or_else(|| "none".to_string(), |p| p.display().to_string())
    };
    let entries = [
        ("listen", format!("tcp:{}", config.port())),
        ("server_prefix", config.server_prefix().to_string()),
        ("ticket_store", store),
        ("services_file", display_path(config.services_file())),
        ("accounts_file", display_path(config.accounts_file())),
        (
            "concurrent_sessions",
            config.concurrent_session_policy().to_string(),
        ),
        (
            "mfa_global_provider",
            config.mfa_global_provider().unwrap_or("none").to_string(),
        ),
        ("trusted_devices", config.trusted_devices().to_string()),
        (
            "trust_forwarded_headers",
            config.trust_forwarded_headers().to_string(),
        ),
        ("oidc_issuer", config.oidc_issuer()),
        ("saml_entity_id", config.saml_entity_id()),
        (
            "actuator_token_set",
            config.actuator_token().is_some().to_string(),
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn banner() -> String {
    BANNER.replace(
        "{VERSION}",
        &format!(
            " - {} - {}",
            env!("CARGO_PKG_VERSION"),
            short_commit(crate::GIT_COMMIT_HASH)
        ),
    )
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

const BANNER: &str = r"
  +---+---+---+
  | T | E | S |
  +---+---+---+
  | S | E | R |   T E S S E R A {VERSION}
  +---+---+---+
  | A |   |   |
  +---+---+---+";
