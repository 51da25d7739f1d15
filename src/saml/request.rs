//! `AuthnRequest` decoding for the HTTP-Redirect and HTTP-POST bindings.

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Read, Write};

use crate::{error::CasError, validation::response::xml_escape};

/// Inflated requests larger than this are refused.
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

static AUTHN_REQUEST: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:[A-Za-z0-9_]+:)?AuthnRequest\b([^>]*)>").ok()
});
static ISSUER: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?s)<(?:[A-Za-z0-9_]+:)?Issuer\b[^>]*>\s*([^<]+?)\s*</(?:[A-Za-z0-9_]+:)?Issuer>")
        .ok()
});
static CONTEXT_CLASS: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?s)<(?:[A-Za-z0-9_]+:)?AuthnContextClassRef\b[^>]*>\s*([^<]+?)\s*</(?:[A-Za-z0-9_]+:)?AuthnContextClassRef>",
    )
    .ok()
});
static ATTRIBUTE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_.:-]*)\s*=\s*"([^"]*)""#).ok()
});

/// The parts of an `AuthnRequest` the IdP acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthnRequest {
    pub id: String,
    pub issuer: String,
    pub acs_url: Option<String>,
    pub force_authn: bool,
    pub requested_contexts: Vec<String>,
}

fn compiled(regex: &'static Lazy<Option<Regex>>) -> Result<&'static Regex, CasError> {
    regex
        .as_ref()
        .ok_or_else(|| CasError::Internal("invalid SAML request pattern".to_string()))
}

fn unescape(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

impl AuthnRequest {
    /// Parse the request XML.
    ///
    /// # Errors
    /// Returns `InvalidRequest` when the document is not an `AuthnRequest` with an `ID`
    /// and an `Issuer`.
    pub fn parse(xml: &str) -> Result<Self, CasError> {
        let invalid = |reason: &str| CasError::InvalidRequest(format!("invalid SAML request: {reason}"));
        let element = compiled(&AUTHN_REQUEST)?
            .captures(xml)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| invalid("no AuthnRequest element"))?;

        let mut id = None;
        let mut acs_url = None;
        let mut force_authn = false;
        for attribute in compiled(&ATTRIBUTE)?.captures_iter(element.as_str()) {
            let value = unescape(&attribute[2]);
            match &attribute[1] {
                "ID" => id = Some(value),
                "AssertionConsumerServiceURL" => acs_url = Some(value),
                "ForceAuthn" => force_authn = value == "true" || value == "1",
                _ => {}
            }
        }

        let issuer = compiled(&ISSUER)?
            .captures(xml)
            .map(|captures| unescape(&captures[1]))
            .ok_or_else(|| invalid("missing Issuer"))?;
        let requested_contexts = compiled(&CONTEXT_CLASS)?
            .captures_iter(xml)
            .map(|captures| unescape(&captures[1]))
            .collect();

        Ok(Self {
            id: id.ok_or_else(|| invalid("missing ID"))?,
            issuer,
            acs_url,
            force_authn,
            requested_contexts,
        })
    }

    /// Minimal, deterministic XML carrying the same fields. Used to round-trip the request
    /// through `/login` as part of the callback URL.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml2="urn:oasis:names:tc:SAML:2.0:assertion" ID="{}" Version="2.0""#,
            xml_escape(&self.id)
        );
        if let Some(acs_url) = &self.acs_url {
            xml.push_str(&format!(
                r#" AssertionConsumerServiceURL="{}""#,
                xml_escape(acs_url)
            ));
        }
        if self.force_authn {
            xml.push_str(r#" ForceAuthn="true""#);
        }
        xml.push_str(&format!(
            "><saml2:Issuer>{}</saml2:Issuer>",
            xml_escape(&self.issuer)
        ));
        if !self.requested_contexts.is_empty() {
            xml.push_str("<samlp:RequestedAuthnContext>");
            for context in &self.requested_contexts {
                xml.push_str(&format!(
                    "<saml2:AuthnContextClassRef>{}</saml2:AuthnContextClassRef>",
                    xml_escape(context)
                ));
            }
            xml.push_str("</samlp:RequestedAuthnContext>");
        }
        xml.push_str("</samlp:AuthnRequest>");
        xml
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, CasError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|_| CasError::InvalidRequest("SAMLRequest is not base64".to_string()))
}

/// HTTP-Redirect binding: base64 of the raw-DEFLATE compressed XML.
///
/// # Errors
/// Returns `InvalidRequest` for undecodable or oversized input.
pub fn decode_redirect(encoded: &str) -> Result<AuthnRequest, CasError> {
    let compressed = decode_base64(encoded)?;
    let mut xml = String::new();
    DeflateDecoder::new(compressed.as_slice())
        .take(MAX_REQUEST_BYTES)
        .read_to_string(&mut xml)
        .map_err(|_| CasError::InvalidRequest("SAMLRequest cannot be inflated".to_string()))?;
    AuthnRequest::parse(&xml)
}

/// HTTP-POST binding: plain base64 of the XML.
///
/// # Errors
/// Returns `InvalidRequest` for undecodable input.
pub fn decode_post(encoded: &str) -> Result<AuthnRequest, CasError> {
    let bytes = decode_base64(encoded)?;
    let xml = String::from_utf8(bytes)
        .map_err(|_| CasError::InvalidRequest("SAMLRequest is not UTF-8".to_string()))?;
    AuthnRequest::parse(&xml)
}

/// Encode `request` for the HTTP-Redirect binding.
///
/// # Errors
/// Returns `Internal` if compression fails.
pub fn encode_redirect(request: &AuthnRequest) -> Result<String, CasError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(request.to_xml().as_bytes())
        .map_err(|err| CasError::Internal(format!("failed to deflate SAML request: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| CasError::Internal(format!("failed to deflate SAML request: {err}")))?;
    Ok(STANDARD.encode(compressed))
}
