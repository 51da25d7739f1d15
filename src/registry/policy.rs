//! Per-service access, attribute release and proxy policies.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::CasError,
    principal::{Attributes, Principal},
};

const fn enabled() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStrategy {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// When false the service never joins an SSO session: every visit asks for credentials
    /// and no `TGC` cookie is issued.
    #[serde(default = "enabled")]
    pub sso_enabled: bool,
    /// Attribute name to accepted value patterns; every listed attribute must match.
    #[serde(default)]
    pub required_attributes: BTreeMap<String, Vec<String>>,
}

impl Default for AccessStrategy {
    fn default() -> Self {
        Self {
            enabled: true,
            sso_enabled: true,
            required_attributes: BTreeMap::new(),
        }
    }
}

impl AccessStrategy {
    /// # Errors
    /// Returns `ServiceUnauthorized` if the service is disabled or the principal lacks a
    /// required attribute value.
    pub fn authorize(&self, principal: &Principal) -> Result<(), CasError> {
        if !self.enabled {
            return Err(CasError::ServiceUnauthorized);
        }
        for (name, accepted) in &self.required_attributes {
            let values = principal
                .attributes
                .get(name)
                .ok_or(CasError::ServiceUnauthorized)?;
            let matched = accepted.iter().any(|pattern| {
                Regex::new(&format!("^(?:{pattern})$"))
                    .is_ok_and(|regex| values.iter().any(|value| regex.is_match(value)))
            });
            if !matched {
                return Err(CasError::ServiceUnauthorized);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeReleasePolicy {
    ReturnAll,
    ReturnAllowed {
        allowed: Vec<String>,
    },
    /// Source attribute name to released name.
    ReturnMapped {
        mapped: BTreeMap<String, String>,
    },
    #[default]
    DenyAll,
}

impl AttributeReleasePolicy {
    #[must_use]
    pub fn release(&self, attributes: &Attributes) -> Attributes {
        match self {
            Self::ReturnAll => attributes.clone(),
            Self::ReturnAllowed { allowed } => attributes
                .iter()
                .filter(|(name, _)| allowed.contains(name))
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
            Self::ReturnMapped { mapped } => mapped
                .iter()
                .filter_map(|(source, target)| {
                    attributes
                        .get(source)
                        .map(|values| (target.clone(), values.clone()))
                })
                .collect(),
            Self::DenyAll => Attributes::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyPolicy {
    #[default]
    Refuse,
    Regex {
        pattern: String,
    },
}

impl ProxyPolicy {
    /// Proxy callbacks must be https and match the configured pattern.
    #[must_use]
    pub fn allows(&self, callback_url: &str) -> bool {
        match self {
            Self::Refuse => false,
            Self::Regex { pattern } => {
                callback_url.starts_with("https://")
                    && Regex::new(&format!("^(?:{pattern})$"))
                        .is_ok_and(|regex| regex.is_match(callback_url))
            }
        }
    }
}
