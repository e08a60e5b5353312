//! Hosts-file resolution.
//!
//! Turns an index hit into resolver results:
//! - [`resolve_address`] produces `getaddrinfo`-style [`AddrInfo`] records
//! - [`resolve_legacy_by_name`] produces a `gethostbyname`-style [`HostEntry`]
//!
//! Both borrow a [`HostsSnapshot`] for the duration of one query and never
//! fall back to DNS. [`HostResolver`] bundles the index with these
//! operations and is what the shared resolution lock protects.

use crate::error::{HostsError, Result};
use crate::hosts::{HostsIndex, HostsSnapshot, Refresh};
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use tracing::{debug, trace};

/// Address family of a request or a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// `AF_UNSPEC`: any family.
    #[default]
    Unspec,
    /// `AF_INET`
    Inet,
    /// `AF_INET6`
    Inet6,
    /// Anything else. Never matches a hosts entry.
    Other(i32),
}

impl AddressFamily {
    /// Converts a raw `AF_*` value.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            libc::AF_UNSPEC => Self::Unspec,
            libc::AF_INET => Self::Inet,
            libc::AF_INET6 => Self::Inet6,
            other => Self::Other(other),
        }
    }

    /// The raw `AF_*` value.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Unspec => libc::AF_UNSPEC,
            Self::Inet => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
            Self::Other(raw) => raw,
        }
    }

    /// Family of a parsed address.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Whether a request for this family accepts `ip`.
    pub fn admits(self, ip: &IpAddr) -> bool {
        match self {
            Self::Unspec => true,
            Self::Inet => ip.is_ipv4(),
            Self::Inet6 => ip.is_ipv6(),
            Self::Other(_) => false,
        }
    }

    /// Size of a raw address of this family, if it has one.
    pub fn address_len(self) -> Option<usize> {
        match self {
            Self::Inet => Some(4),
            Self::Inet6 => Some(16),
            _ => None,
        }
    }
}

/// Caller hints, passed through to the produced records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrHints {
    pub flags: i32,
    pub family: AddressFamily,
    pub socktype: i32,
    pub protocol: i32,
}

/// One `getaddrinfo`-style address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: AddressFamily,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SocketAddr,
}

impl AddrInfo {
    /// The socket address in `sockaddr_in` / `sockaddr_in6` layout: family in
    /// host byte order, port and flow info in network byte order.
    pub fn encoded_addr(&self) -> Vec<u8> {
        match self.addr {
            SocketAddr::V4(sa) => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
                buf.extend_from_slice(&sa.port().to_be_bytes());
                buf.extend_from_slice(&sa.ip().octets());
                buf.extend_from_slice(&[0u8; 8]);
                buf
            }
            SocketAddr::V6(sa) => {
                let mut buf = Vec::with_capacity(28);
                buf.extend_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
                buf.extend_from_slice(&sa.port().to_be_bytes());
                buf.extend_from_slice(&sa.flowinfo().to_be_bytes());
                buf.extend_from_slice(&sa.ip().octets());
                buf.extend_from_slice(&sa.scope_id().to_ne_bytes());
                buf
            }
        }
    }
}

/// A legacy host entry. Always exactly one address and no aliases.
///
/// Each call returns a fresh value owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub family: AddressFamily,
    pub addresses: Vec<IpAddr>,
}

/// Parses a token as an IPv4 literal, then as an IPv6 literal.
pub fn parse_literal(token: &[u8]) -> Option<IpAddr> {
    let text = std::str::from_utf8(token).ok()?;
    text.parse::<Ipv4Addr>()
        .map(IpAddr::V4)
        .or_else(|_| text.parse::<Ipv6Addr>().map(IpAddr::V6))
        .ok()
}

/// Protocol name used for service lookups for a socket type.
fn protocol_for(socktype: i32) -> Option<&'static str> {
    match socktype {
        libc::SOCK_DGRAM => Some("udp"),
        libc::SOCK_STREAM => Some("tcp"),
        _ => None,
    }
}

/// Parses a plain decimal port: digits only, at most 65535.
fn parse_decimal_port(service: &str) -> Option<u16> {
    if service.is_empty() || !service.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    service.parse().ok()
}

/// Looks a named service up in the system services database.
///
/// `getservbyname` returns static storage, so this must only run while the
/// shared resolution lock is held.
fn lookup_service(name: &str, proto: Option<&str>) -> Option<u16> {
    let name = CString::new(name).ok()?;
    let proto = proto.map(CString::new).transpose().ok()?;
    let proto_ptr = proto.as_ref().map_or(ptr::null(), |p| p.as_ptr());

    // SAFETY: both pointers are valid NUL-terminated strings for the call,
    // and the returned entry is read before any other resolver call.
    unsafe {
        let ent = libc::getservbyname(name.as_ptr(), proto_ptr);
        if ent.is_null() {
            return None;
        }
        Some(u16::from_be((*ent).s_port as u16))
    }
}

/// Resolves the port for `service`: a decimal number, else a named service
/// for the protocol implied by `socktype`, else 0.
pub fn resolve_port(service: Option<&str>, socktype: i32) -> u16 {
    let Some(service) = service else {
        return 0;
    };
    if let Some(port) = parse_decimal_port(service) {
        return port;
    }
    lookup_service(service, protocol_for(socktype)).unwrap_or_else(|| {
        trace!(service = %service, "Unknown service, using port 0");
        0
    })
}

/// Forward resolution of `host` against `snapshot`.
///
/// Yields exactly one record, or NotFound if the name is absent, its address
/// token is not a literal, or the hinted family does not match.
pub fn resolve_address(
    snapshot: &HostsSnapshot,
    host: &str,
    service: Option<&str>,
    hints: Option<&AddrHints>,
) -> Result<Vec<AddrInfo>> {
    let entry = snapshot.lookup(host).ok_or_else(|| {
        debug!(host = %host, "Not in hosts file");
        HostsError::not_found(host)
    })?;

    let ip = parse_literal(snapshot.address_of(entry)).ok_or_else(|| {
        debug!(host = %host, "Hosts entry address is not a literal");
        HostsError::not_found(host)
    })?;

    let hints = hints.copied().unwrap_or_default();
    if !hints.family.admits(&ip) {
        debug!(host = %host, ip = %ip, family = ?hints.family, "Address family mismatch");
        return Err(HostsError::not_found(host));
    }

    let port = resolve_port(service, hints.socktype);
    debug!(host = %host, ip = %ip, port, "Resolved from hosts file");

    Ok(vec![AddrInfo {
        family: AddressFamily::of(&ip),
        socktype: hints.socktype,
        protocol: hints.protocol,
        addr: SocketAddr::new(ip, port),
    }])
}

/// Legacy by-name lookup.
///
/// The matched *name* token itself is parsed as the address, so only names
/// that are address literals resolve. Existing clients rely on this to look
/// addresses up by their textual form.
pub fn resolve_legacy_by_name(
    snapshot: &HostsSnapshot,
    name: &str,
    family: AddressFamily,
) -> Result<HostEntry> {
    let entry = snapshot.lookup(name).ok_or_else(|| {
        debug!(name = %name, "Not in hosts file");
        HostsError::not_found(name)
    })?;

    let token = snapshot.name_of(entry);
    let ip = parse_literal(token)
        .filter(|ip| family.admits(ip))
        .ok_or_else(|| {
            debug!(name = %name, family = ?family, "Hosts name is not a matching literal");
            HostsError::not_found(name)
        })?;

    Ok(HostEntry {
        name: String::from_utf8_lossy(token).into_owned(),
        family: AddressFamily::of(&ip),
        addresses: vec![ip],
    })
}

/// The hosts index together with the resolution operations over it.
#[derive(Debug)]
pub struct HostResolver {
    index: HostsIndex,
}

impl HostResolver {
    /// Creates a resolver over `index`.
    pub fn new(index: HostsIndex) -> Self {
        Self { index }
    }

    /// The underlying index.
    pub fn index(&self) -> &HostsIndex {
        &self.index
    }

    /// Mutable access, e.g. to retarget the hosts path on reload.
    pub fn index_mut(&mut self) -> &mut HostsIndex {
        &mut self.index
    }

    /// Brings the snapshot up to date with the file.
    pub fn ensure_fresh(&mut self) -> Refresh {
        self.index.ensure_fresh()
    }

    /// Forward resolution against the current snapshot.
    pub fn get_addr_info(
        &self,
        host: Option<&str>,
        service: Option<&str>,
        hints: Option<&AddrHints>,
    ) -> Result<Vec<AddrInfo>> {
        let host = host.ok_or_else(|| HostsError::not_found("(null)"))?;
        let snapshot = self
            .index
            .snapshot()
            .ok_or_else(|| HostsError::not_found(host))?;
        resolve_address(&snapshot, host, service, hints)
    }

    /// Legacy by-name lookup against the current snapshot.
    pub fn get_host_by_name(&self, name: &str, family: AddressFamily) -> Result<HostEntry> {
        let snapshot = self
            .index
            .snapshot()
            .ok_or_else(|| HostsError::not_found(name))?;
        resolve_legacy_by_name(&snapshot, name, family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HOSTS: &str = "\
# test hosts
10.0.0.5  example.local ex
::1       ip6-localhost
fe80::1   ip6-link
not-an-ip broken.local
10.0.0.9  10.0.0.9
::2       ::2
";

    fn create_resolver(content: &str) -> (NamedTempFile, HostResolver) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        let mut resolver = HostResolver::new(HostsIndex::new(file.path()));
        resolver.ensure_fresh();
        (file, resolver)
    }

    fn hints(family: AddressFamily, socktype: i32) -> AddrHints {
        AddrHints {
            family,
            socktype,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_ipv4_no_service() {
        let (_file, resolver) = create_resolver(HOSTS);
        let records = resolver.get_addr_info(Some("example.local"), None, None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].family, AddressFamily::Inet);
        assert_eq!(records[0].addr, "10.0.0.5:0".parse().unwrap());
        assert_eq!(records[0].socktype, 0);
        assert_eq!(records[0].protocol, 0);
    }

    #[test]
    fn test_resolve_numeric_service() {
        let (_file, resolver) = create_resolver(HOSTS);
        let records = resolver
            .get_addr_info(Some("example.local"), Some("80"), None)
            .unwrap();
        assert_eq!(records[0].addr.port(), 80);
    }

    #[test]
    fn test_alias_resolves_to_same_address() {
        let (_file, resolver) = create_resolver(HOSTS);
        let records = resolver.get_addr_info(Some("ex"), None, None).unwrap();
        assert_eq!(records[0].addr.ip().to_string(), "10.0.0.5");
    }

    #[test]
    fn test_family_mismatch_is_not_found() {
        let (_file, resolver) = create_resolver(HOSTS);
        let err = resolver
            .get_addr_info(
                Some("example.local"),
                None,
                Some(&hints(AddressFamily::Inet6, 0)),
            )
            .unwrap_err();
        assert!(err.is_not_found());

        let err = resolver
            .get_addr_info(
                Some("ip6-localhost"),
                None,
                Some(&hints(AddressFamily::Inet, 0)),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_ipv6_entry() {
        let (_file, resolver) = create_resolver(HOSTS);
        let records = resolver
            .get_addr_info(
                Some("ip6-localhost"),
                Some("443"),
                Some(&hints(AddressFamily::Inet6, libc::SOCK_STREAM)),
            )
            .unwrap();
        assert_eq!(records[0].family, AddressFamily::Inet6);
        assert_eq!(records[0].addr, "[::1]:443".parse().unwrap());
        assert_eq!(records[0].socktype, libc::SOCK_STREAM);
    }

    #[test]
    fn test_hints_pass_through() {
        let (_file, resolver) = create_resolver(HOSTS);
        let hints = AddrHints {
            flags: 0,
            family: AddressFamily::Unspec,
            socktype: libc::SOCK_DGRAM,
            protocol: libc::IPPROTO_UDP,
        };
        let records = resolver
            .get_addr_info(Some("example.local"), None, Some(&hints))
            .unwrap();
        assert_eq!(records[0].socktype, libc::SOCK_DGRAM);
        assert_eq!(records[0].protocol, libc::IPPROTO_UDP);
    }

    #[test]
    fn test_missing_and_malformed_are_not_found() {
        let (_file, resolver) = create_resolver(HOSTS);
        for family in [AddressFamily::Unspec, AddressFamily::Inet, AddressFamily::Inet6] {
            let err = resolver
                .get_addr_info(Some("missing.local"), Some("80"), Some(&hints(family, 0)))
                .unwrap_err();
            assert!(err.is_not_found());
        }
        assert!(resolver
            .get_addr_info(Some("broken.local"), None, None)
            .unwrap_err()
            .is_not_found());
        assert!(resolver.get_addr_info(None, None, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unknown_family_never_matches() {
        let (_file, resolver) = create_resolver(HOSTS);
        let err = resolver
            .get_addr_info(
                Some("example.local"),
                None,
                Some(&hints(AddressFamily::from_raw(libc::AF_UNIX), 0)),
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_port_rules() {
        assert_eq!(resolve_port(None, 0), 0);
        assert_eq!(resolve_port(Some("0"), 0), 0);
        assert_eq!(resolve_port(Some("65535"), 0), 65535);
        assert_eq!(resolve_port(Some("8080"), libc::SOCK_STREAM), 8080);
        assert_eq!(resolve_port(Some("65536"), 0), 0);
        assert_eq!(resolve_port(Some("+80"), 0), 0);
        assert_eq!(resolve_port(Some("80abc"), 0), 0);
        assert_eq!(resolve_port(Some("no-such-service-xyz"), libc::SOCK_STREAM), 0);
        assert_eq!(resolve_port(Some("bad\0name"), 0), 0);
    }

    /// True if the local services database lists `name` on `port`/`proto`.
    fn services_lists(name: &str, port_proto: &str) -> bool {
        let Ok(services) = std::fs::read_to_string("/etc/services") else {
            return false;
        };
        services.lines().any(|line| {
            let mut fields = line.split_whitespace();
            fields.next() == Some(name) && fields.next() == Some(port_proto)
        })
    }

    #[test]
    fn test_resolve_named_service() {
        // Minimal images ship without a services database.
        if services_lists("http", "80/tcp") {
            assert_eq!(resolve_port(Some("http"), libc::SOCK_STREAM), 80);
        }
        if services_lists("domain", "53/udp") {
            assert_eq!(resolve_port(Some("domain"), libc::SOCK_DGRAM), 53);
        }
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(parse_literal(b"10.0.0.5"), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(parse_literal(b"::1"), Some("::1".parse().unwrap()));
        assert_eq!(parse_literal(b"example.local"), None);
        assert_eq!(parse_literal(b"\xff\xfe"), None);
    }

    #[test]
    fn test_encoded_addr_layout() {
        let v4 = AddrInfo {
            family: AddressFamily::Inet,
            socktype: 0,
            protocol: 0,
            addr: "10.0.0.5:80".parse().unwrap(),
        };
        let bytes = v4.encoded_addr();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[2..4], &[0, 80]);
        assert_eq!(&bytes[4..8], &[10, 0, 0, 5]);

        let v6 = AddrInfo {
            family: AddressFamily::Inet6,
            socktype: 0,
            protocol: 0,
            addr: "[::1]:443".parse().unwrap(),
        };
        let bytes = v6.encoded_addr();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[2..4], &443u16.to_be_bytes());
        assert_eq!(bytes[23], 1);
    }

    // The legacy path parses the matched name, not the address column.
    #[test]
    fn test_legacy_by_name_parses_name_token() {
        let (_file, resolver) = create_resolver(HOSTS);

        let err = resolver
            .get_host_by_name("example.local", AddressFamily::Unspec)
            .unwrap_err();
        assert!(err.is_not_found());

        let entry = resolver
            .get_host_by_name("10.0.0.9", AddressFamily::Unspec)
            .unwrap();
        assert_eq!(entry.name, "10.0.0.9");
        assert_eq!(entry.family, AddressFamily::Inet);
        assert_eq!(entry.addresses, vec!["10.0.0.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_legacy_family_filter() {
        let (_file, resolver) = create_resolver(HOSTS);
        assert!(resolver
            .get_host_by_name("10.0.0.9", AddressFamily::Inet6)
            .unwrap_err()
            .is_not_found());

        let entry = resolver.get_host_by_name("::2", AddressFamily::Inet6).unwrap();
        assert_eq!(entry.family, AddressFamily::Inet6);
        assert_eq!(entry.addresses.len(), 1);
    }

    #[test]
    fn test_legacy_results_are_independent() {
        let (_file, resolver) = create_resolver(HOSTS);
        let first = resolver.get_host_by_name("10.0.0.9", AddressFamily::Unspec).unwrap();
        let second = resolver.get_host_by_name("::2", AddressFamily::Unspec).unwrap();
        assert_eq!(first.name, "10.0.0.9");
        assert_eq!(second.name, "::2");
    }

    #[test]
    fn test_no_snapshot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = HostResolver::new(HostsIndex::new(dir.path().join("absent")));
        resolver.ensure_fresh();
        assert!(resolver
            .get_addr_info(Some("localhost"), None, None)
            .unwrap_err()
            .is_not_found());
        assert!(resolver
            .get_host_by_name("127.0.0.1", AddressFamily::Unspec)
            .unwrap_err()
            .is_not_found());
    }
}
