//! Network-origin admission policy.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid allowFrom address: {0:?}")]
    InvalidAddress(String),
}

/// Optional set of remote IPs allowed to open a session.
///
/// No set (or an empty one) admits everyone. Addresses are compared in
/// canonical form, so `::ffff:127.0.0.1` matches `127.0.0.1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowFromPolicy {
    allowed: Option<HashSet<IpAddr>>,
}

impl AllowFromPolicy {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn only(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let allowed: HashSet<IpAddr> = addrs.into_iter().map(|ip| ip.to_canonical()).collect();
        if allowed.is_empty() {
            Self::unrestricted()
        } else {
            Self { allowed: Some(allowed) }
        }
    }

    /// Build from textual IPs, as found in configuration.
    pub fn parse<I, S>(entries: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addrs = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                entry
                    .parse::<IpAddr>()
                    .map_err(|_| PolicyError::InvalidAddress(entry.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::only(addrs))
    }

    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(&ip.to_canonical()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn unrestricted_permits_everyone() {
        let p = AllowFromPolicy::unrestricted();
        assert!(!p.is_restricted());
        assert!(p.permits(ip("8.8.8.8")));
        assert!(p.permits(ip("::1")));
    }

    #[test]
    fn empty_list_is_unrestricted() {
        let p = AllowFromPolicy::parse(Vec::<String>::new()).unwrap();
        assert!(!p.is_restricted());
        assert!(p.permits(ip("1.2.3.4")));
    }

    #[test]
    fn restricted_rejects_others() {
        let p = AllowFromPolicy::parse(["127.0.0.1", "10.0.0.7"]).unwrap();
        assert!(p.is_restricted());
        assert!(p.permits(ip("127.0.0.1")));
        assert!(p.permits(ip("10.0.0.7")));
        assert!(!p.permits(ip("10.0.0.8")));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_entry() {
        let p = AllowFromPolicy::parse(["127.0.0.1"]).unwrap();
        assert!(p.permits(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn entries_are_trimmed() {
        let p = AllowFromPolicy::parse([" 192.168.0.1 "]).unwrap();
        assert!(p.permits(ip("192.168.0.1")));
    }

    #[test]
    fn invalid_entry_is_error() {
        let err = AllowFromPolicy::parse(["localhost"]).unwrap_err();
        assert_eq!(err, PolicyError::InvalidAddress("localhost".into()));
    }
}
