use clap::{Arg, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("oidc-issuer")
                .long("oidc-issuer")
                .help("OpenID Connect issuer (default: <server-prefix>/oidc)")
                .env("TESSERA_OIDC_ISSUER"),
        )
        .arg(
            Arg::new("oidc-signing-secret")
                .long("oidc-signing-secret")
                .help("HS256 secret for ID tokens")
                .env("TESSERA_OIDC_SIGNING_SECRET")
                .hide_env_values(true)
                .conflicts_with("oidc-signing-key-path"),
        )
        .arg(
            Arg::new("oidc-signing-key-path")
                .long("oidc-signing-key-path")
                .help("PEM RSA private key for RS256 ID tokens")
                .env("TESSERA_OIDC_SIGNING_KEY_PATH"),
        )
        .arg(
            Arg::new("saml-entity-id")
                .long("saml-entity-id")
                .help("SAML2 IdP entity id (default: <server-prefix>/idp)")
                .env("TESSERA_SAML_ENTITY_ID"),
        )
        .arg(
            Arg::new("saml-signing-key-path")
                .long("saml-signing-key-path")
                .help("PEM RSA private key signing SAML assertions")
                .env("TESSERA_SAML_SIGNING_KEY_PATH"),
        )
}
