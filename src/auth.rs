//! Shared Key authentication for the Table service.
//!
//! The Table flavour of Shared Key signs a short string:
//!
//! ```text
//! VERB\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! CanonicalizedResource
//! ```
//!
//! where `Date` is the `x-ms-date` value and `CanonicalizedResource` is
//! `/{account}{path}`, followed by `?comp={value}` when the request carries
//! a `comp` query parameter.  The signature is base64(HMAC-SHA256(key, ...))
//! and travels as `Authorization: SharedKey {account}:{signature}`.
//!
//! Credentials come from an account name plus base64 key, or from a storage
//! connection string.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::{Result, TableError};

type HmacSha256 = Hmac<Sha256>;

/// Account name of the local storage emulator.
pub const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";

/// Published key of the local storage emulator.
pub const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Table endpoint of the local storage emulator.
pub const DEV_TABLE_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";

const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// A storage account name and its decoded key.
#[derive(Clone)]
pub struct SharedKeyCredential {
    account: String,
    key: Vec<u8>,
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SharedKeyCredential {
    /// Build a credential from an account name and base64 account key.
    pub fn new(account: impl Into<String>, key: &str) -> Result<Self> {
        let account = account.into();
        if account.is_empty() {
            return Err(TableError::Credential {
                message: "account name is empty".to_string(),
            });
        }
        let key = BASE64_STANDARD
            .decode(key.trim())
            .map_err(|e| TableError::Credential {
                message: format!("account key is not valid base64: {e}"),
            })?;
        Ok(Self { account, key })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Sign a request and return the `Authorization` header value.
    pub fn sign(
        &self,
        method: &str,
        content_md5: &str,
        content_type: &str,
        date: &str,
        canonical_resource: &str,
    ) -> Result<String> {
        let signature =
            self.signature(method, content_md5, content_type, date, canonical_resource)?;
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Check an `Authorization` header value against the expected signature.
    pub fn verify(
        &self,
        authorization: &str,
        method: &str,
        content_md5: &str,
        content_type: &str,
        date: &str,
        canonical_resource: &str,
    ) -> bool {
        let Some(presented) = authorization.strip_prefix("SharedKey ") else {
            return false;
        };
        let Some((account, signature)) = presented.trim().split_once(':') else {
            return false;
        };
        if account != self.account {
            return false;
        }
        match self.signature(method, content_md5, content_type, date, canonical_resource) {
            Ok(expected) => constant_time_eq(&expected, signature),
            Err(_) => false,
        }
    }

    fn signature(
        &self,
        method: &str,
        content_md5: &str,
        content_type: &str,
        date: &str,
        canonical_resource: &str,
    ) -> Result<String> {
        let string_to_sign = string_to_sign(method, content_md5, content_type, date, canonical_resource);
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|e| TableError::Credential {
            message: format!("HMAC key error: {e}"),
        })?;
        mac.update(string_to_sign.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }
}

/// Build the Table Shared Key string-to-sign.
pub fn string_to_sign(
    method: &str,
    content_md5: &str,
    content_type: &str,
    date: &str,
    canonical_resource: &str,
) -> String {
    format!("{method}\n{content_md5}\n{content_type}\n{date}\n{canonical_resource}")
}

/// Build `CanonicalizedResource` from a request path and query string.
///
/// `path` is used exactly as it appears on the wire (still percent-encoded).
pub fn canonical_resource(account: &str, path: &str, query: Option<&str>) -> String {
    let path = if path.is_empty() { "/" } else { path };
    let mut resource = format!("/{account}{path}");
    let comp = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.eq_ignore_ascii_case("comp"))
            .map(|(_, value)| value.to_string())
    });
    if let Some(comp) = comp {
        resource.push_str("?comp=");
        resource.push_str(&comp);
    }
    resource
}

/// Compare two signature strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// -- Connection strings -------------------------------------------------------

/// What a storage connection string resolves to.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    /// Table service root, without trailing slash.
    pub endpoint: String,
    pub credential: Option<SharedKeyCredential>,
    /// SAS token without a leading `?`.
    pub sas_token: Option<String>,
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value` connection strings.
    pub fn parse(conn_str: &str) -> Result<Self> {
        let mut account = None;
        let mut key = None;
        let mut table_endpoint = None;
        let mut protocol = None;
        let mut suffix = None;
        let mut sas = None;

        for pair in conn_str.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = pair.split_once('=') else {
                return Err(TableError::Credential {
                    message: format!("malformed connection string segment: {pair}"),
                });
            };
            match name {
                "UseDevelopmentStorage" if value.eq_ignore_ascii_case("true") => {
                    return Ok(Self {
                        endpoint: DEV_TABLE_ENDPOINT.to_string(),
                        credential: Some(SharedKeyCredential::new(DEV_ACCOUNT_NAME, DEV_ACCOUNT_KEY)?),
                        sas_token: None,
                    });
                }
                "AccountName" => account = Some(value.to_string()),
                "AccountKey" => key = Some(value.to_string()),
                "TableEndpoint" => table_endpoint = Some(value.trim_end_matches('/').to_string()),
                "DefaultEndpointsProtocol" => protocol = Some(value.to_string()),
                "EndpointSuffix" => suffix = Some(value.to_string()),
                "SharedAccessSignature" => {
                    sas = Some(value.strip_prefix('?').unwrap_or(value).to_string())
                }
                _ => {}
            }
        }

        let endpoint = match (table_endpoint, &account) {
            (Some(endpoint), _) => endpoint,
            (None, Some(account)) => format!(
                "{}://{}.table.{}",
                protocol.as_deref().unwrap_or("https"),
                account,
                suffix.as_deref().unwrap_or(DEFAULT_ENDPOINT_SUFFIX)
            ),
            (None, None) => {
                return Err(TableError::Credential {
                    message: "connection string needs AccountName or TableEndpoint".to_string(),
                })
            }
        };

        let credential = match (account, key) {
            (Some(account), Some(key)) => Some(SharedKeyCredential::new(account, &key)?),
            _ => None,
        };
        if credential.is_none() && sas.is_none() {
            return Err(TableError::Credential {
                message: "connection string has neither AccountKey nor SharedAccessSignature"
                    .to_string(),
            });
        }

        Ok(Self {
            endpoint,
            credential,
            sas_token: sas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> SharedKeyCredential {
        SharedKeyCredential::new(DEV_ACCOUNT_NAME, DEV_ACCOUNT_KEY).unwrap()
    }

    #[test]
    fn test_string_to_sign_layout() {
        assert_eq!(
            string_to_sign(
                "POST",
                "",
                "multipart/mixed; boundary=batch_1",
                "Mon, 19 Oct 2026 10:00:00 GMT",
                "/acct/$batch"
            ),
            "POST\n\nmultipart/mixed; boundary=batch_1\nMon, 19 Oct 2026 10:00:00 GMT\n/acct/$batch"
        );
    }

    #[test]
    fn test_canonical_resource() {
        assert_eq!(canonical_resource("acct", "/people", None), "/acct/people");
        assert_eq!(canonical_resource("acct", "", None), "/acct/");
        assert_eq!(
            canonical_resource("acct", "/", Some("restype=service&comp=properties")),
            "/acct/?comp=properties"
        );
        assert_eq!(
            canonical_resource("acct", "/people()", Some("$top=5")),
            "/acct/people()"
        );
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let cred = credential();
        let date = "Mon, 19 Oct 2026 10:00:00 GMT";
        let resource = "/devstoreaccount1/people";
        let header = cred
            .sign("POST", "", "application/json", date, resource)
            .unwrap();
        assert!(header.starts_with("SharedKey devstoreaccount1:"));
        assert!(cred.verify(&header, "POST", "", "application/json", date, resource));
        assert!(!cred.verify(&header, "PUT", "", "application/json", date, resource));
        assert!(!cred.verify(&header, "POST", "", "application/json", date, "/devstoreaccount1/other"));
    }

    #[test]
    fn test_verify_rejects_other_account_and_scheme() {
        let cred = credential();
        let other = SharedKeyCredential::new("other", DEV_ACCOUNT_KEY).unwrap();
        let header = other.sign("GET", "", "", "d", "/other/t").unwrap();
        assert!(!cred.verify(&header, "GET", "", "", "d", "/other/t"));
        assert!(!cred.verify("Bearer abc", "GET", "", "", "d", "/devstoreaccount1/t"));
        assert!(!cred.verify("SharedKey nocolon", "GET", "", "", "d", "/devstoreaccount1/t"));
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            SharedKeyCredential::new("acct", "not base64!!"),
            Err(TableError::Credential { .. })
        ));
        assert!(SharedKeyCredential::new("", DEV_ACCOUNT_KEY).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let text = format!("{:?}", credential());
        assert!(text.contains("devstoreaccount1"));
        assert!(!text.contains(DEV_ACCOUNT_KEY));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_connection_string_account_key() {
        let cs = ConnectionString::parse(&format!(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey={DEV_ACCOUNT_KEY};EndpointSuffix=core.chinacloudapi.cn"
        ))
        .unwrap();
        assert_eq!(cs.endpoint, "https://acct.table.core.chinacloudapi.cn");
        assert_eq!(cs.credential.unwrap().account(), "acct");
        assert!(cs.sas_token.is_none());
    }

    #[test]
    fn test_connection_string_table_endpoint_and_sas() {
        let cs = ConnectionString::parse(
            "TableEndpoint=https://acct.table.cosmos.azure.com:443/;SharedAccessSignature=?sv=2019-02-02&sig=abc",
        )
        .unwrap();
        assert_eq!(cs.endpoint, "https://acct.table.cosmos.azure.com:443");
        assert!(cs.credential.is_none());
        assert_eq!(cs.sas_token.as_deref(), Some("sv=2019-02-02&sig=abc"));
    }

    #[test]
    fn test_connection_string_development_storage() {
        let cs = ConnectionString::parse("UseDevelopmentStorage=true").unwrap();
        assert_eq!(cs.endpoint, DEV_TABLE_ENDPOINT);
        assert_eq!(cs.credential.unwrap().account(), DEV_ACCOUNT_NAME);
    }

    #[test]
    fn test_connection_string_errors() {
        assert!(ConnectionString::parse("AccountKey=abc").is_err());
        assert!(ConnectionString::parse("AccountName=acct").is_err());
        assert!(ConnectionString::parse("garbage").is_err());
    }
}
