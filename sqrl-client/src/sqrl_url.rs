//! Parsing for the `sqrl://`/`qrl://` URLs a QR code or login link hands the
//! embedder (§6 External Interfaces). The authority is the per-site
//! key-derivation domain `D` from §3's data model; `nut=` is the server's
//! challenge nonce; `sfn=` is the server-friendly name shown to the user and
//! carried on [`crate::site_action::SiteAction`] for display, not derivation.
//!
//! Grounded on the reference implementation's `test/protocol.c` fixture
//! (`sqrl://sqrlid.com/auth.php?sfn=..&nut=..`), which keys derivation off
//! the URL's host (`sqrlid.com`) rather than the friendly name.

use crate::error::{ClientError, Result};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqrlUrl {
    pub domain: String,
    pub nut: Option<String>,
    pub sfn: Option<String>,
    pub qry: Option<String>,
}

impl SqrlUrl {
    /// Parses `raw`, requiring the `sqrl://`/`qrl://` scheme and a host.
    /// Anything else is a protocol violation — a caller handed something
    /// that isn't a SQRL authentication link.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|_| ClientError::ProtocolViolation("not a valid URL"))?;
        if url.scheme() != "sqrl" && url.scheme() != "qrl" {
            return Err(ClientError::ProtocolViolation("URL scheme must be sqrl:// or qrl://"));
        }
        let domain = url.host_str().ok_or(ClientError::ProtocolViolation("URL has no authority"))?.to_string();

        let mut nut = None;
        let mut sfn = None;
        let mut qry = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "nut" => nut = Some(value.into_owned()),
                "sfn" => sfn = Some(value.into_owned()),
                "qry" => qry = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(SqrlUrl { domain, nut, sfn, qry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqrl_scheme_authority_and_query() {
        let parsed = SqrlUrl::parse("sqrl://sqrlid.com/auth.php?sfn=_LIBSQRL_SFN_&nut=_LIBSQRL_NUT_").unwrap();
        assert_eq!(parsed.domain, "sqrlid.com");
        assert_eq!(parsed.nut.as_deref(), Some("_LIBSQRL_NUT_"));
        assert_eq!(parsed.sfn.as_deref(), Some("_LIBSQRL_SFN_"));
    }

    #[test]
    fn accepts_qrl_scheme() {
        let parsed = SqrlUrl::parse("qrl://example.com/auth?nut=abc").unwrap();
        assert_eq!(parsed.domain, "example.com");
    }

    #[test]
    fn rejects_non_sqrl_scheme() {
        assert!(SqrlUrl::parse("https://example.com/auth?nut=abc").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(SqrlUrl::parse("not a url").is_err());
    }

    #[test]
    fn sfn_is_optional() {
        let parsed = SqrlUrl::parse("sqrl://example.com/auth?nut=abc").unwrap();
        assert_eq!(parsed.sfn, None);
    }
}
