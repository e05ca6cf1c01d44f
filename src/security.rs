use anyhow::{Context, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// Decides whether an inbound peer may be relayed upstream.
///
/// Built once at startup from the optional exclusion CIDR and only read afterwards,
/// so a shared reference can be consulted from every session without locking.
#[derive(Debug, Clone, Default)]
pub struct AdmissionFilter {
    ignore: Option<IpNet>,
}

impl AdmissionFilter {
    /// Parses the exclusion CIDR. `None` (or an empty string) admits every address.
    pub fn new(ignore_cidr: Option<&str>) -> Result<Self> {
        let ignore = match ignore_cidr.map(str::trim) {
            None | Some("") => None,
            Some(cidr) => Some(
                cidr.parse::<IpNet>()
                    .with_context(|| format!("Invalid CIDR for ignore: {cidr}"))?,
            ),
        };
        Ok(Self { ignore })
    }

    #[must_use]
    pub fn ignored_net(&self) -> Option<IpNet> {
        self.ignore
    }

    /// Returns true if the address falls inside the exclusion CIDR.
    /// IPv4-mapped IPv6 addresses are matched as their IPv4 form.
    #[must_use]
    pub fn is_ignored(&self, ip: IpAddr) -> bool {
        self.ignore
            .is_some_and(|net| net.contains(&ip.to_canonical()))
    }

    #[must_use]
    pub fn admits(&self, ip: IpAddr) -> bool {
        !self.is_ignored(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn admits_everything_without_cidr() {
        let filter = AdmissionFilter::new(None).unwrap();
        assert!(filter.admits(ip("10.1.2.3")));
        assert!(filter.admits(ip("::1")));
        assert!(filter.ignored_net().is_none());
    }

    #[test]
    fn empty_cidr_is_treated_as_unset() {
        let filter = AdmissionFilter::new(Some("  ")).unwrap();
        assert!(filter.admits(ip("10.1.2.3")));
    }

    #[test]
    fn excludes_addresses_inside_cidr() {
        let filter = AdmissionFilter::new(Some("10.0.0.0/8")).unwrap();
        assert!(filter.is_ignored(ip("10.1.2.3")));
        assert!(filter.is_ignored(ip("10.255.255.255")));
        assert!(filter.admits(ip("8.8.8.8")));
        assert!(filter.admits(ip("11.0.0.1")));
    }

    #[test]
    fn matches_ipv4_mapped_ipv6_peers() {
        let filter = AdmissionFilter::new(Some("10.0.0.0/8")).unwrap();
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped());
        assert!(filter.is_ignored(mapped));
        assert!(filter.admits(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn supports_ipv6_cidr() {
        let filter = AdmissionFilter::new(Some("fd00::/8")).unwrap();
        assert!(filter.is_ignored(ip("fd12:3456::1")));
        assert!(filter.admits(ip("2001:db8::1")));
        assert!(filter.admits(ip("10.1.2.3")));
    }

    #[test]
    fn rejects_invalid_cidr() {
        let err = AdmissionFilter::new(Some("10.0.0.0/33")).unwrap_err();
        assert!(err.to_string().contains("10.0.0.0/33"));
        assert!(AdmissionFilter::new(Some("not-a-cidr")).is_err());
    }

    #[test]
    fn bare_address_is_not_a_cidr() {
        assert!(AdmissionFilter::new(Some("10.1.2.3")).is_err());
    }
}
