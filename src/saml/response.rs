//! Signed `samlp:Response` documents.
//!
//! Elements are written in exclusive canonical form (sorted attributes, explicit end tags,
//! no insignificant whitespace), so the serialized assertion is also the octet stream that
//! is digested.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use super::signing::SamlSigner;
use crate::{
    authn::Authentication,
    crypto::{random_bytes, sha256},
    error::CasError,
    principal::Attributes,
    validation::response::xml_escape,
};

const NS_ASSERTION: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const NS_PROTOCOL: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";
const NAME_ID_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";
const ATTRNAME_URI: &str = "urn:oasis:names:tc:SAML:2.0:attrname-format:uri";
const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";

const SIGNATURE_OPEN: &str = "<ds:Signature";
const SIGNATURE_CLOSE: &str = "</ds:Signature>";
const SIGNED_INFO_OPEN: &str = "<ds:SignedInfo>";
const SIGNED_INFO_CLOSE: &str = "</ds:SignedInfo>";

/// What goes into one assertion.
#[derive(Debug)]
pub struct AssertionParams<'a> {
    /// IdP entity id.
    pub issuer: &'a str,
    /// SP entity id.
    pub audience: &'a str,
    pub acs_url: &'a str,
    pub in_response_to: &'a str,
    pub name_id: &'a str,
    /// Service ticket behind this assertion.
    pub session_index: &'a str,
    pub authentication: &'a Authentication,
    pub attributes: &'a Attributes,
    pub validity: Duration,
}

fn instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn xml_id() -> Result<String, CasError> {
    Ok(format!("_{}", hex::encode(random_bytes::<16>()?)))
}

fn attribute_statement(attributes: &Attributes) -> String {
    if attributes.is_empty() {
        return String::new();
    }
    let mut xml = String::from("<saml2:AttributeStatement>");
    for (name, values) in attributes {
        xml.push_str(&format!(
            r#"<saml2:Attribute Name="{}" NameFormat="{ATTRNAME_URI}">"#,
            xml_escape(name)
        ));
        for value in values {
            xml.push_str(&format!(
                "<saml2:AttributeValue>{}</saml2:AttributeValue>",
                xml_escape(value)
            ));
        }
        xml.push_str("</saml2:Attribute>");
    }
    xml.push_str("</saml2:AttributeStatement>");
    xml
}

fn signed_info(body: &str) -> String {
    format!(r#"<ds:SignedInfo xmlns:ds="{NS_DSIG}">{body}</ds:SignedInfo>"#)
}

fn signed_info_body(reference: &str, digest: &str) -> String {
    format!(
        concat!(
            r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"></ds:CanonicalizationMethod>"#,
            r#"<ds:SignatureMethod Algorithm="http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"></ds:SignatureMethod>"#,
            r##"<ds:Reference URI="#{}"><ds:Transforms>"##,
            r#"<ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"></ds:Transform>"#,
            r#"<ds:Transform Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"></ds:Transform>"#,
            r#"</ds:Transforms><ds:DigestMethod Algorithm="http://www.w3.org/2001/04/xmlenc#sha256"></ds:DigestMethod>"#,
            "<ds:DigestValue>{}</ds:DigestValue></ds:Reference>"
        ),
        reference, digest
    )
}

/// Build the response with an enveloped signature over its assertion.
///
/// # Errors
/// Returns `Internal` if randomness or signing fails.
pub fn build_response(params: &AssertionParams<'_>, signer: &SamlSigner) -> Result<String, CasError> {
    let now = Utc::now();
    let not_after = instant(now + params.validity);
    let assertion_id = xml_id()?;

    let head = format!(
        r#"<saml2:Assertion xmlns:saml2="{NS_ASSERTION}" ID="{assertion_id}" IssueInstant="{}" Version="2.0"><saml2:Issuer>{}</saml2:Issuer>"#,
        instant(now),
        xml_escape(params.issuer)
    );
    let body = format!(
        concat!(
            r#"<saml2:Subject><saml2:NameID Format="{name_id_format}">{name_id}</saml2:NameID>"#,
            r#"<saml2:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
            r#"<saml2:SubjectConfirmationData InResponseTo="{in_response_to}" NotOnOrAfter="{not_after}" Recipient="{acs}"></saml2:SubjectConfirmationData>"#,
            r#"</saml2:SubjectConfirmation></saml2:Subject>"#,
            r#"<saml2:Conditions NotBefore="{now}" NotOnOrAfter="{not_after}"><saml2:AudienceRestriction>"#,
            r#"<saml2:Audience>{audience}</saml2:Audience></saml2:AudienceRestriction></saml2:Conditions>"#,
            r#"<saml2:AuthnStatement AuthnInstant="{auth_instant}" SessionIndex="{session_index}">"#,
            r#"<saml2:AuthnContext><saml2:AuthnContextClassRef>{acr}</saml2:AuthnContextClassRef></saml2:AuthnContext>"#,
            r#"</saml2:AuthnStatement>{attributes}</saml2:Assertion>"#
        ),
        name_id_format = NAME_ID_UNSPECIFIED,
        name_id = xml_escape(params.name_id),
        in_response_to = xml_escape(params.in_response_to),
        not_after = not_after,
        acs = xml_escape(params.acs_url),
        now = instant(now),
        audience = xml_escape(params.audience),
        auth_instant = instant(params.authentication.auth_time),
        session_index = xml_escape(params.session_index),
        acr = xml_escape(&params.authentication.context_class),
        attributes = attribute_statement(params.attributes),
    );

    let digest = STANDARD.encode(sha256(format!("{head}{body}").as_bytes()));
    let info_body = signed_info_body(&assertion_id, &digest);
    let signature_value = signer.sign(signed_info(&info_body).as_bytes())?;
    let signature = format!(
        r#"<ds:Signature xmlns:ds="{NS_DSIG}">{SIGNED_INFO_OPEN}{info_body}{SIGNED_INFO_CLOSE}<ds:SignatureValue>{signature_value}</ds:SignatureValue>{}</ds:Signature>"#,
        signer.key_info()
    );

    Ok(format!(
        concat!(
            r#"<samlp:Response xmlns:samlp="{ns}" Destination="{acs}" ID="{id}" InResponseTo="{in_response_to}" IssueInstant="{now}" Version="2.0">"#,
            r#"<saml2:Issuer xmlns:saml2="{ns_assertion}">{issuer}</saml2:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{status}"></samlp:StatusCode></samlp:Status>"#,
            "{head}{signature}{body}</samlp:Response>"
        ),
        ns = NS_PROTOCOL,
        acs = xml_escape(params.acs_url),
        id = xml_id()?,
        in_response_to = xml_escape(params.in_response_to),
        now = instant(now),
        ns_assertion = NS_ASSERTION,
        issuer = xml_escape(params.issuer),
        status = STATUS_SUCCESS,
        head = head,
        signature = signature,
        body = body,
    ))
}

fn between<'a>(xml: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = xml.find(open)? + open.len();
    let end = start + xml[start..].find(close)?;
    Some(&xml[start..end])
}

/// Check the enveloped assertion signature of a response produced by [`build_response`].
#[must_use]
pub fn verify_response(xml: &str, signer: &SamlSigner) -> bool {
    let Some(start) = xml.find(SIGNATURE_OPEN) else {
        return false;
    };
    let Some(end) = xml[start..].find(SIGNATURE_CLOSE).map(|end| start + end + SIGNATURE_CLOSE.len()) else {
        return false;
    };
    let signature = &xml[start..end];
    let unsigned = format!("{}{}", &xml[..start], &xml[end..]);
    let Some(assertion_start) = unsigned.find("<saml2:Assertion ") else {
        return false;
    };
    let Some(assertion) = between(&unsigned[assertion_start..], "", "</samlp:Response>") else {
        return false;
    };

    let (Some(info_body), Some(digest), Some(value)) = (
        between(signature, SIGNED_INFO_OPEN, SIGNED_INFO_CLOSE),
        between(signature, "<ds:DigestValue>", "</ds:DigestValue>"),
        between(signature, "<ds:SignatureValue>", "</ds:SignatureValue>"),
    ) else {
        return false;
    };
    STANDARD.encode(sha256(assertion.as_bytes())) == digest
        && signer.verify(signed_info(info_body).as_bytes(), value)
}

/// Auto-submitting HTML form for the HTTP-POST binding.
#[must_use]
pub fn post_form(acs_url: &str, saml_response: &str, relay_state: Option<&str>) -> String {
    let relay = relay_state
        .map(|state| {
            format!(
                r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                xml_escape(state)
            )
        })
        .unwrap_or_default();
    format!(
        concat!(
            "<!DOCTYPE html><html><body onload=\"document.forms[0].submit()\">",
            r#"<form method="post" action="{}">"#,
            r#"<input type="hidden" name="SAMLResponse" value="{}"/>{}"#,
            r#"<noscript><button type="submit">Continue</button></noscript>"#,
            "</form></body></html>"
        ),
        xml_escape(acs_url),
        saml_response,
        relay
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{authn::ACR_MFA, principal::Principal};

    const RSA_PEM: &str = include_str!("../../tests/fixtures/signing-key.pem");

    fn response(signer: &SamlSigner) -> String {
        let authentication = Authentication::new(Principal::new("casuser"), "t", "h", "pwd")
            .with_mfa("mfa-gauth", "GoogleAuthenticatorAuthenticationHandler");
        let attributes: Attributes = [("mail".to_string(), vec!["casuser@example.org".to_string()])]
            .into_iter()
            .collect();
        build_response(
            &AssertionParams {
                issuer: "https://sso.example.org/idp",
                audience: "https://sp.example.org/metadata",
                acs_url: "https://sp.example.org/acs",
                in_response_to: "_req1",
                name_id: "casuser",
                session_index: "ST-1-abc",
                authentication: &authentication,
                attributes: &attributes,
                validity: Duration::minutes(5),
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn assertion_carries_context_and_attributes() {
        let signer = SamlSigner::from_pem(RSA_PEM).unwrap();
        let xml = response(&signer);
        assert!(xml.contains(&format!(
            "<saml2:AuthnContextClassRef>{ACR_MFA}</saml2:AuthnContextClassRef>"
        )));
        assert!(xml.contains(r#"SessionIndex="ST-1-abc""#));
        assert!(xml.contains("<saml2:Audience>https://sp.example.org/metadata</saml2:Audience>"));
        assert!(xml.contains("<saml2:AttributeValue>casuser@example.org</saml2:AttributeValue>"));
        assert!(xml.contains(r#"InResponseTo="_req1""#));
    }

    #[test]
    fn signature_covers_the_assertion() {
        let signer = SamlSigner::from_pem(RSA_PEM).unwrap();
        let xml = response(&signer);
        assert!(verify_response(&xml, &signer));
        let tampered = xml.replace("casuser@example.org", "admin@example.org");
        assert!(!verify_response(&tampered, &signer));
    }

    #[test]
    fn form_posts_to_the_acs() {
        let html = post_form("https://sp.example.org/acs", "PHNhbWw+", Some("a&b"));
        assert!(html.contains(r#"action="https://sp.example.org/acs""#));
        assert!(html.contains(r#"value="a&amp;b""#));
    }
}
