//! CAS `serviceResponse` rendering in XML and JSON, plus the CAS 1 text format.

use serde_json::{Map, Value, json};
use std::{fmt::Write as _, str::FromStr};

use super::ValidationSuccess;
use crate::{error::CasError, principal::Attributes};

const CAS_NAMESPACE: &str = "http://www.yale.edu/tp/cas";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    #[default]
    Xml,
    Json,
}

impl ResponseFormat {
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Xml => "application/xml;charset=UTF-8",
            Self::Json => "application/json",
        }
    }
}

impl FromStr for ResponseFormat {
    type Err = CasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "XML" => Ok(Self::Xml),
            "JSON" => Ok(Self::Json),
            _ => Err(CasError::InvalidRequest(format!("unsupported format {value}"))),
        }
    }
}

/// Escape text for element content and attribute values.
#[must_use]
pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Attribute names become element names; anything that is not a plain XML name is dropped.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn attributes_json(attributes: &Attributes) -> Value {
    let map: Map<String, Value> = attributes
        .iter()
        .map(|(name, values)| (name.clone(), json!(values)))
        .collect();
    Value::Object(map)
}

fn wrap_xml(body: &str) -> String {
    format!("<cas:serviceResponse xmlns:cas=\"{CAS_NAMESPACE}\">\n{body}</cas:serviceResponse>\n")
}

#[must_use]
pub fn service_success(success: &ValidationSuccess, format: ResponseFormat) -> String {
    match format {
        ResponseFormat::Json => {
            let mut body = Map::new();
            body.insert("user".to_string(), json!(success.user));
            body.insert("attributes".to_string(), attributes_json(&success.attributes));
            if let Some(iou) = &success.proxy_granting_ticket {
                body.insert("proxyGrantingTicket".to_string(), json!(iou));
            }
            if !success.proxies.is_empty() {
                body.insert("proxies".to_string(), json!(success.proxies));
            }
            json!({"serviceResponse": {"authenticationSuccess": body}}).to_string()
        }
        ResponseFormat::Xml => {
            let mut body = String::from("  <cas:authenticationSuccess>\n");
            let _ = writeln!(body, "    <cas:user>{}</cas:user>", xml_escape(&success.user));
            body.push_str("    <cas:attributes>\n");
            for (name, values) in &success.attributes {
                if !is_xml_name(name) {
                    continue;
                }
                for value in values {
                    let _ = writeln!(body, "      <cas:{name}>{}</cas:{name}>", xml_escape(value));
                }
            }
            body.push_str("    </cas:attributes>\n");
            if let Some(iou) = &success.proxy_granting_ticket {
                let _ = writeln!(
                    body,
                    "    <cas:proxyGrantingTicket>{}</cas:proxyGrantingTicket>",
                    xml_escape(iou)
                );
            }
            if !success.proxies.is_empty() {
                body.push_str("    <cas:proxies>\n");
                for proxy in &success.proxies {
                    let _ = writeln!(body, "      <cas:proxy>{}</cas:proxy>", xml_escape(proxy));
                }
                body.push_str("    </cas:proxies>\n");
            }
            body.push_str("  </cas:authenticationSuccess>\n");
            wrap_xml(&body)
        }
    }
}

#[must_use]
pub fn service_failure(err: &CasError, format: ResponseFormat) -> String {
    let description = err.to_string();
    match format {
        ResponseFormat::Json => json!({
            "serviceResponse": {
                "authenticationFailure": {"code": err.cas_code(), "description": description}
            }
        })
        .to_string(),
        ResponseFormat::Xml => wrap_xml(&format!(
            "  <cas:authenticationFailure code=\"{}\">{}</cas:authenticationFailure>\n",
            err.cas_code(),
            xml_escape(&description)
        )),
    }
}

#[must_use]
pub fn proxy_success(proxy_ticket: &str, format: ResponseFormat) -> String {
    match format {
        ResponseFormat::Json => {
            json!({"serviceResponse": {"proxySuccess": {"proxyTicket": proxy_ticket}}}).to_string()
        }
        ResponseFormat::Xml => wrap_xml(&format!(
            "  <cas:proxySuccess>\n    <cas:proxyTicket>{}</cas:proxyTicket>\n  </cas:proxySuccess>\n",
            xml_escape(proxy_ticket)
        )),
    }
}

#[must_use]
pub fn proxy_failure(err: &CasError, format: ResponseFormat) -> String {
    let description = err.to_string();
    match format {
        ResponseFormat::Json => json!({
            "serviceResponse": {
                "proxyFailure": {"code": err.cas_code(), "description": description}
            }
        })
        .to_string(),
        ResponseFormat::Xml => wrap_xml(&format!(
            "  <cas:proxyFailure code=\"{}\">{}</cas:proxyFailure>\n",
            err.cas_code(),
            xml_escape(&description)
        )),
    }
}

/// CAS 1 `/validate` body.
#[must_use]
pub fn cas1(result: Result<&ValidationSuccess, &CasError>) -> String {
    match result {
        Ok(success) => format!("yes\n{}\n", success.user),
        Err(_) => "no\n\n".to_string(),
    }
}
