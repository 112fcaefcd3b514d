//! Stored access policies (`?comp=acl`).
//!
//! Unlike the rest of the Table API, table ACLs travel as XML:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <SignedIdentifiers>
//!   <SignedIdentifier>
//!     <Id>read-only</Id>
//!     <AccessPolicy>
//!       <Start>2024-01-01T00:00:00Z</Start>
//!       <Expiry>2024-02-01T00:00:00Z</Expiry>
//!       <Permission>r</Permission>
//!     </AccessPolicy>
//!   </SignedIdentifier>
//! </SignedIdentifiers>
//! ```

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::entity::{format_datetime, parse_datetime};
use crate::errors::{Result, TableError};

/// A table holds at most this many stored access policies.
pub const MAX_SIGNED_IDENTIFIERS: usize = 5;

pub const ACL_CONTENT_TYPE: &str = "application/xml";

/// Time window and permissions of a stored policy.  Every field is optional
/// so a SAS token can supply what the policy leaves out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub start: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    /// Permission letters, e.g. `raud`.
    pub permission: Option<String>,
}

/// A named stored access policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedIdentifier {
    pub id: String,
    pub access_policy: Option<AccessPolicy>,
}

impl SignedIdentifier {
    pub fn new(id: impl Into<String>, access_policy: AccessPolicy) -> Self {
        Self {
            id: id.into(),
            access_policy: Some(access_policy),
        }
    }
}

fn xml_error(e: impl std::fmt::Display) -> TableError {
    TableError::Encoding {
        message: format!("invalid signed identifiers XML: {e}"),
    }
}

fn write_text<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

/// Render a `<SignedIdentifiers>` document.
pub fn encode_signed_identifiers(identifiers: &[SignedIdentifier]) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("SignedIdentifiers")))
        .map_err(xml_error)?;

    for identifier in identifiers {
        writer
            .write_event(Event::Start(BytesStart::new("SignedIdentifier")))
            .map_err(xml_error)?;
        write_text(&mut writer, "Id", &identifier.id)?;
        if let Some(policy) = &identifier.access_policy {
            writer
                .write_event(Event::Start(BytesStart::new("AccessPolicy")))
                .map_err(xml_error)?;
            if let Some(start) = &policy.start {
                write_text(&mut writer, "Start", &format_datetime(start))?;
            }
            if let Some(expiry) = &policy.expiry {
                write_text(&mut writer, "Expiry", &format_datetime(expiry))?;
            }
            if let Some(permission) = &policy.permission {
                write_text(&mut writer, "Permission", permission)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("AccessPolicy")))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("SignedIdentifier")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("SignedIdentifiers")))
        .map_err(xml_error)?;
    Ok(writer.into_inner().into_inner())
}

fn parse_time(field: &str, text: &str) -> Result<DateTime<Utc>> {
    parse_datetime(text).map_err(|e| xml_error(format!("{field} {text:?}: {e}")))
}

/// Parse a `<SignedIdentifiers>` document.  An empty body is an empty list.
pub fn decode_signed_identifiers(body: &[u8]) -> Result<Vec<SignedIdentifier>> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut identifiers = Vec::new();
    let mut current: Option<SignedIdentifier> = None;
    let mut policy: Option<AccessPolicy> = None;
    let mut tag: Vec<u8> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                match e.name().as_ref() {
                    b"SignedIdentifier" => current = Some(SignedIdentifier::default()),
                    b"AccessPolicy" => policy = Some(AccessPolicy::default()),
                    _ => {}
                }
                tag = e.name().as_ref().to_vec();
            }
            Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"AccessPolicy" {
                    if let Some(identifier) = current.as_mut() {
                        identifier.access_policy = Some(AccessPolicy::default());
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                match e.name().as_ref() {
                    b"AccessPolicy" => {
                        if let Some(identifier) = current.as_mut() {
                            identifier.access_policy = policy.take();
                        }
                    }
                    b"SignedIdentifier" => {
                        let identifier = current
                            .take()
                            .ok_or_else(|| xml_error("unbalanced SignedIdentifier"))?;
                        if identifier.id.is_empty() {
                            return Err(xml_error("SignedIdentifier without Id"));
                        }
                        identifiers.push(identifier);
                    }
                    _ => {}
                }
                tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(xml_error)?.into_owned();
                match (tag.as_slice(), current.as_mut(), policy.as_mut()) {
                    (b"Id", Some(identifier), _) => identifier.id = text,
                    (b"Start", _, Some(policy)) => policy.start = Some(parse_time("Start", &text)?),
                    (b"Expiry", _, Some(policy)) => policy.expiry = Some(parse_time("Expiry", &text)?),
                    (b"Permission", _, Some(policy)) => policy.permission = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(identifiers)
}

/// Reject more policies than a table can hold.
pub fn check_identifier_count(identifiers: &[SignedIdentifier]) -> Result<()> {
    if identifiers.len() > MAX_SIGNED_IDENTIFIERS {
        return Err(TableError::InvalidArgument {
            message: format!(
                "a table holds at most {MAX_SIGNED_IDENTIFIERS} access policies, got {}",
                identifiers.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use chrono::TimeZone;

    fn read_only() -> SignedIdentifier {
        SignedIdentifier::new(
            "read-only",
            AccessPolicy {
                start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                expiry: Some(Utc.with_ymd_and_hms(2024, 2, 1, 12, 30, 0).unwrap()),
                permission: Some("r".to_string()),
            },
        )
    }

    #[test]
    fn test_encode_layout() {
        let xml = String::from_utf8(encode_signed_identifiers(&[read_only()]).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains(
            "<SignedIdentifier><Id>read-only</Id><AccessPolicy>\
             <Start>2024-01-01T00:00:00Z</Start><Expiry>2024-02-01T12:30:00Z</Expiry>\
             <Permission>r</Permission></AccessPolicy></SignedIdentifier>"
        ));
    }

    #[test]
    fn test_decode_service_document() {
        let body = br#"<?xml version="1.0" encoding="utf-8"?>
<SignedIdentifiers>
  <SignedIdentifier>
    <Id>full</Id>
    <AccessPolicy>
      <Start>2009-09-28T08:49:37.0000000Z</Start>
      <Expiry>2009-09-29T08:49:37.0000000Z</Expiry>
      <Permission>raud</Permission>
    </AccessPolicy>
  </SignedIdentifier>
  <SignedIdentifier>
    <Id>bare</Id>
    <AccessPolicy />
  </SignedIdentifier>
</SignedIdentifiers>"#;
        let ids = decode_signed_identifiers(body).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].id, "full");
        let policy = ids[0].access_policy.as_ref().unwrap();
        assert_eq!(
            policy.start,
            Some(Utc.with_ymd_and_hms(2009, 9, 28, 8, 49, 37).unwrap())
        );
        assert_eq!(policy.permission.as_deref(), Some("raud"));
        assert_eq!(ids[1].id, "bare");
        assert_eq!(ids[1].access_policy, Some(AccessPolicy::default()));
    }

    #[test]
    fn test_decode_empty_and_escaped() {
        assert!(decode_signed_identifiers(b"").unwrap().is_empty());
        assert!(decode_signed_identifiers(b"<SignedIdentifiers/>").unwrap().is_empty());

        let id = SignedIdentifier {
            id: "a&b<c>".to_string(),
            access_policy: None,
        };
        let xml = encode_signed_identifiers(std::slice::from_ref(&id)).unwrap();
        assert_eq!(decode_signed_identifiers(&xml).unwrap(), vec![id]);
    }

    #[test]
    fn test_decode_rejects_bad_documents() {
        let bad_time = b"<SignedIdentifiers><SignedIdentifier><Id>x</Id><AccessPolicy>\
            <Start>yesterday</Start></AccessPolicy></SignedIdentifier></SignedIdentifiers>";
        let err = decode_signed_identifiers(bad_time).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Encoding);
        assert!(err.to_string().contains("Start"), "{err}");

        let no_id = b"<SignedIdentifiers><SignedIdentifier></SignedIdentifier></SignedIdentifiers>";
        assert_eq!(
            decode_signed_identifiers(no_id).unwrap_err().kind(),
            ErrorKind::Encoding
        );

        let mismatched = b"<SignedIdentifiers><SignedIdentifier></Id></SignedIdentifiers>";
        assert!(decode_signed_identifiers(mismatched).is_err());
    }

    #[test]
    fn test_identifier_count_limit() {
        let five: Vec<_> = (0..5)
            .map(|i| SignedIdentifier::new(format!("p{i}"), AccessPolicy::default()))
            .collect();
        check_identifier_count(&five).unwrap();
        let mut six = five;
        six.push(read_only());
        assert_eq!(
            check_identifier_count(&six).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }
}
