//! Per-authentication state that survives across server round-trips within
//! one Action: the alternate-identity selection, the server's session nonce,
//! and anything an ASK callback is waiting on.
//!
//! Grounded on the reference implementation's `SqrlSiteAction`, which frees
//! `altIdentity` both when it's replaced and again when the object is
//! released — a double-free. Here `alt_identity` is a plain owned
//! `Option<String>` field; there's no second place that could free it.

/// Site-friendly-name and per-exchange state for one authentication
/// transaction. Created when an Action targets a URL, discarded with the
/// Action.
#[derive(Debug, Clone, Default)]
pub struct SiteAction {
    alt_identity: Option<String>,
    domain: Option<String>,
    server_friendly_name: Option<String>,
    nut: Option<String>,
    pending_ask: Option<PendingAsk>,
}

#[derive(Debug, Clone)]
pub struct PendingAsk {
    pub message: String,
    pub first_button: String,
    pub second_button: String,
}

impl SiteAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alt_identity(&self) -> Option<&str> {
        self.alt_identity.as_deref()
    }

    /// Replaces the alternate-identity selection. Dropping the previous
    /// `Option<String>` here is the whole story — nothing else holds a
    /// pointer to it.
    pub fn set_alt_identity(&mut self, alt: Option<String>) {
        self.alt_identity = alt;
    }

    /// The authentication URL's authority — the site-specific domain `D`
    /// that per-site keys are derived against by default (§3 Data Model).
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn set_domain(&mut self, domain: Option<String>) {
        self.domain = domain;
    }

    pub fn server_friendly_name(&self) -> Option<&str> {
        self.server_friendly_name.as_deref()
    }

    pub fn set_server_friendly_name(&mut self, sfn: Option<String>) {
        self.server_friendly_name = sfn;
    }

    pub fn nut(&self) -> Option<&str> {
        self.nut.as_deref()
    }

    pub fn set_nut(&mut self, nut: Option<String>) {
        self.nut = nut;
    }

    pub fn set_pending_ask(&mut self, ask: Option<PendingAsk>) {
        self.pending_ask = ask;
    }

    pub fn pending_ask(&self) -> Option<&PendingAsk> {
        self.pending_ask.as_ref()
    }

    pub fn take_pending_ask(&mut self) -> Option<PendingAsk> {
        self.pending_ask.take()
    }

    /// The domain key-derivation uses: the alternate identity if the user
    /// selected one for this site, else the URL's authority.
    pub fn derivation_domain(&self) -> Option<&str> {
        self.alt_identity.as_deref().or(self.domain.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_alt_identity_drops_the_old_one_safely() {
        let mut site = SiteAction::new();
        site.set_alt_identity(Some("first".to_string()));
        site.set_alt_identity(Some("second".to_string()));
        assert_eq!(site.alt_identity(), Some("second"));
    }

    #[test]
    fn derivation_domain_prefers_alt_identity_over_url_domain() {
        let mut site = SiteAction::new();
        site.set_domain(Some("example.com".to_string()));
        assert_eq!(site.derivation_domain(), Some("example.com"));
        site.set_alt_identity(Some("work".to_string()));
        assert_eq!(site.derivation_domain(), Some("work"));
    }
}
