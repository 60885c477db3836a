//! Request signing for the CloudStack-style compute API
//!
//! Parameters are sorted by name, values percent-encoded, joined with `&`,
//! lowercased and signed with HMAC-SHA1 using the API secret. The signature
//! is the standard base64 encoding of the digest.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::ProviderError;

type HmacSha1 = Hmac<Sha1>;

/// Percent-encode a query value, spaces as `%20`
#[must_use]
pub fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Query string in signing order, keys sorted and values encoded
#[must_use]
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signature of a canonical query
///
/// # Errors
/// Returns `ProviderError::Config` if the secret cannot key the MAC
pub fn sign(query: &str, secret: &str) -> Result<String, ProviderError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Config(format!("invalid API secret: {e}")))?;
    mac.update(query.to_lowercase().as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_query_sorted() {
        let query = canonical_query(&params(&[
            ("response", "json"),
            ("name", "ch-gva-2"),
            ("command", "listZones"),
            ("apikey", "EXOtest"),
        ]));
        assert_eq!(
            query,
            "apikey=EXOtest&command=listZones&name=ch-gva-2&response=json"
        );
    }

    #[test]
    fn test_known_signature() {
        let query = "apikey=EXOtest&command=listZones&name=ch-gva-2&response=json";
        assert_eq!(sign(query, "secret").unwrap(), "6CtfpZu03R9SYQWoep+rHL6INKs=");
    }

    #[test]
    fn test_signature_ignores_case_of_query() {
        let lower = sign("apikey=exotest&command=listzones", "secret").unwrap();
        let mixed = sign("apikey=EXOtest&command=listZones", "secret").unwrap();
        assert_eq!(lower, mixed);
    }

    #[test]
    fn test_encode_spaces_and_reserved() {
        assert_eq!(encode("Linux Ubuntu 18.04 LTS 64-bit"), "Linux%20Ubuntu%2018.04%20LTS%2064-bit");
        assert_eq!(encode("a/b=c"), "a%2Fb%3Dc");
    }
}
