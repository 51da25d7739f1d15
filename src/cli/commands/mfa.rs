use clap::{Arg, ArgAction, Command, builder::BoolishValueParser};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("mfa-global-provider")
                .long("mfa-global-provider")
                .help("MFA provider required for every login, e.g. mfa-gauth")
                .env("TESSERA_MFA_GLOBAL_PROVIDER"),
        )
        .arg(
            Arg::new("trusted-devices")
                .long("trusted-devices")
                .help("Offer to remember the device after a successful MFA challenge")
                .env("TESSERA_TRUSTED_DEVICES")
                .action(ArgAction::SetTrue)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("gauth-issuer")
                .long("gauth-issuer")
                .help("Issuer label shown by authenticator apps")
                .env("TESSERA_GAUTH_ISSUER")
                .default_value(crate::config::DEFAULT_GAUTH_ISSUER),
        )
        .arg(
            Arg::new("duo-verify-url")
                .long("duo-verify-url")
                .help("Verification endpoint of the Duo-style external provider")
                .long_help(
                    "Verification endpoint of the Duo-style external provider. The mfa-duo provider is only available when set.",
                )
                .env("TESSERA_DUO_VERIFY_URL"),
        )
        .arg(
            Arg::new("external-timeout-seconds")
                .long("external-timeout-seconds")
                .help("Timeout for calls to external providers and proxy callbacks")
                .env("TESSERA_EXTERNAL_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
