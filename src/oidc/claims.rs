//! Scope to claim release.

use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

use crate::{error::CasError, principal::Attributes, registry::OidcSettings};

pub const SCOPE_OPENID: &str = "openid";

const PROFILE_CLAIMS: [&str; 14] = [
    "name",
    "family_name",
    "given_name",
    "middle_name",
    "nickname",
    "preferred_username",
    "profile",
    "picture",
    "website",
    "gender",
    "birthdate",
    "zoneinfo",
    "locale",
    "updated_at",
];
const EMAIL_CLAIMS: [&str; 2] = ["email", "email_verified"];
const ADDRESS_CLAIMS: [&str; 1] = ["address"];
const PHONE_CLAIMS: [&str; 2] = ["phone_number", "phone_number_verified"];

/// Claims of a standard scope; `None` for anything that is not one.
#[must_use]
pub fn standard_scope_claims(scope: &str) -> Option<&'static [&'static str]> {
    match scope {
        "profile" => Some(&PROFILE_CLAIMS),
        "email" => Some(&EMAIL_CLAIMS),
        "address" => Some(&ADDRESS_CLAIMS),
        "phone" => Some(&PHONE_CLAIMS),
        SCOPE_OPENID => Some(&[]),
        _ => None,
    }
}

/// Every claim a standard scope can release, for discovery.
#[must_use]
pub fn supported_claims() -> Vec<&'static str> {
    let mut claims = vec!["sub", "auth_time", "acr", "amr", "client_id"];
    claims.extend(PROFILE_CLAIMS);
    claims.extend(EMAIL_CLAIMS);
    claims.extend(ADDRESS_CLAIMS);
    claims.extend(PHONE_CLAIMS);
    claims
}

/// Requested scopes that are known (standard, custom or `openid`) and allowed for the client.
///
/// # Errors
/// `InvalidScope` when nothing requested can be granted.
pub fn granted_scopes(requested: &str, settings: &OidcSettings) -> Result<BTreeSet<String>, CasError> {
    let granted: BTreeSet<String> = requested
        .split_whitespace()
        .filter(|scope| {
            standard_scope_claims(scope).is_some() || settings.custom_scopes.contains_key(*scope)
        })
        .filter(|scope| *scope == SCOPE_OPENID || settings.scopes.contains(*scope))
        .map(str::to_string)
        .collect();
    if granted.is_empty() {
        return Err(CasError::InvalidScope);
    }
    Ok(granted)
}

/// Space separated, sorted.
#[must_use]
pub fn scope_string(scopes: &BTreeSet<String>) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

/// Claim names released for `scopes`.
#[must_use]
pub fn allowed_claims(scopes: &BTreeSet<String>, settings: &OidcSettings) -> BTreeSet<String> {
    let mut claims = BTreeSet::new();
    for scope in scopes {
        if let Some(standard) = standard_scope_claims(scope) {
            claims.extend(standard.iter().map(|claim| (*claim).to_string()));
        } else if let Some(custom) = settings.custom_scopes.get(scope) {
            claims.extend(custom.iter().cloned());
        }
    }
    claims
}

fn claim_value(claim: &str, values: &[String]) -> Value {
    if claim.ends_with("_verified") {
        if let [single] = values {
            if let Ok(flag) = single.parse::<bool>() {
                return Value::Bool(flag);
            }
        }
    }
    match values {
        [single] => json!(single),
        many => json!(many),
    }
}

/// Claims for `scopes`, read from the principal attributes through the client's claim
/// mappings. Claims without a value are left out.
#[must_use]
pub fn resolve_claims(
    attributes: &Attributes,
    scopes: &BTreeSet<String>,
    settings: &OidcSettings,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for claim in allowed_claims(scopes, settings) {
        let attribute = settings
            .claim_mappings
            .get(&claim)
            .map_or(claim.as_str(), String::as_str);
        if let Some(values) = attributes.get(attribute).filter(|values| !values.is_empty()) {
            resolved.insert(claim.clone(), claim_value(&claim, values));
        }
    }
    resolved
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings() -> OidcSettings {
        OidcSettings {
            client_id: "client".to_string(),
            client_secret: None,
            redirect_uri: "https://app.example.org/cb".to_string(),
            scopes: ["profile", "email", "org"].into_iter().map(String::from).collect(),
            custom_scopes: BTreeMap::from([("org".to_string(), vec!["organization".to_string()])]),
            claim_mappings: BTreeMap::from([("name".to_string(), "cn".to_string())]),
            generate_refresh_token: false,
            bypass_approval: true,
            client_attributes: BTreeMap::new(),
        }
    }

    fn attributes() -> Attributes {
        [
            ("cn", vec!["CAS User"]),
            ("given-name", vec!["Cas"]),
            ("email", vec!["casuser@example.org"]),
            ("email_verified", vec!["true"]),
            ("organization", vec!["Apereo", "Example"]),
            ("phone_number", vec!["555"]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect()
    }

    #[test]
    fn grants_known_allowed_scopes() {
        let granted = granted_scopes("openid profile phone bogus email", &settings()).unwrap();
        assert_eq!(scope_string(&granted), "email openid profile");
        assert_eq!(granted_scopes("bogus", &settings()), Err(CasError::InvalidScope));
    }

    #[test]
    fn resolves_mapped_and_custom_claims() {
        let scopes = granted_scopes("openid profile email org", &settings()).unwrap();
        let claims = resolve_claims(&attributes(), &scopes, &settings());
        assert_eq!(claims["name"], "CAS User");
        assert_eq!(claims["email"], "casuser@example.org");
        assert_eq!(claims["email_verified"], true);
        assert_eq!(claims["organization"], json!(["Apereo", "Example"]));
    }

    #[test]
    fn unmapped_claims_are_absent() {
        let scopes = granted_scopes("openid profile email", &settings()).unwrap();
        let claims = resolve_claims(&attributes(), &scopes, &settings());
        assert!(!claims.contains_key("given-name"));
        assert!(!claims.contains_key("given_name"));
        // phone scope was not granted
        assert!(!claims.contains_key("phone_number"));
    }
}
