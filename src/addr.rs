//! Socket-address wrapper shared by the session API and the CM layer.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

/// Address family filter accepted by [`crate::enumerate`].
pub const AF_UNSPEC_FILTER: i32 = 0x00;
pub const AF_INET_FILTER: i32 = 0x04;
pub const AF_INET6_FILTER: i32 = 0x06;

/// Convert the API-level family filter to the native `AF_*` constant.
pub(crate) fn filter_to_native(filter: i32) -> Result<i32> {
    match filter {
        AF_UNSPEC_FILTER => Ok(libc::AF_UNSPEC),
        AF_INET_FILTER => Ok(libc::AF_INET),
        AF_INET6_FILTER => Ok(libc::AF_INET6),
        _ => Err(Error::new(ErrorKind::InvalidArgument)),
    }
}

/// A wire-ready socket address (IPv4 or IPv6) with a port, backed by a
/// `sockaddr_storage` so it can be handed to the CM verbs directly.
#[derive(Clone, Copy)]
pub struct Address {
    storage: libc::sockaddr_storage,
}

impl Address {
    /// The "any" address: unspecified family, all zero.
    pub fn unspecified() -> Self {
        // SAFETY: all-zero is a valid sockaddr_storage (family AF_UNSPEC).
        Address {
            storage: unsafe { mem::zeroed() },
        }
    }

    /// Parse a numeric textual address plus port. An empty string yields the
    /// unspecified address. IPv6 addresses may carry a numeric scope-id
    /// suffix (`fe80::1%3`).
    pub fn parse(address: &str, port: u16) -> Result<Self> {
        if address.is_empty() {
            return Ok(Self::unspecified());
        }

        let (node, scope) = match address.rsplit_once('%') {
            Some((node, scope_str)) => {
                let scope: u32 = scope_str
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::InvalidAddress))?;
                (node, Some(scope))
            }
            None => (address, None),
        };

        match IpAddr::from_str(node) {
            Ok(IpAddr::V4(v4)) => {
                if scope.is_some() {
                    return Err(Error::new(ErrorKind::InvalidAddress));
                }
                Ok(Self::from_v4(v4, port))
            }
            Ok(IpAddr::V6(v6)) => Ok(Self::from_v6(v6, port, scope.unwrap_or(0))),
            Err(_) => Err(Error::new(ErrorKind::InvalidAddress)),
        }
    }

    fn from_v4(ip: Ipv4Addr, port: u16) -> Self {
        let mut addr = Self::unspecified();
        // SAFETY: sockaddr_in fits inside sockaddr_storage by definition.
        unsafe {
            let sin = &mut *(&mut addr.storage as *mut _ as *mut libc::sockaddr_in);
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(ip.octets());
        }
        addr
    }

    fn from_v6(ip: Ipv6Addr, port: u16, scope_id: u32) -> Self {
        let mut addr = Self::unspecified();
        // SAFETY: sockaddr_in6 fits inside sockaddr_storage by definition.
        unsafe {
            let sin6 = &mut *(&mut addr.storage as *mut _ as *mut libc::sockaddr_in6);
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.s6_addr = ip.octets();
            sin6.sin6_scope_id = scope_id;
        }
        addr
    }

    /// Copy from a raw sockaddr returned by the provider.
    ///
    /// # Safety
    ///
    /// `raw` must point to a valid sockaddr of its declared family.
    pub(crate) unsafe fn from_raw(raw: *const libc::sockaddr) -> Self {
        let mut addr = Self::unspecified();
        if raw.is_null() {
            return addr;
        }
        let len = match (*raw).sa_family as i32 {
            libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
            libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
            _ => 0,
        };
        std::ptr::copy_nonoverlapping(
            raw as *const u8,
            &mut addr.storage as *mut _ as *mut u8,
            len,
        );
        addr
    }

    #[inline]
    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.family() == libc::AF_UNSPEC
    }

    pub fn port(&self) -> u16 {
        match self.family() {
            // SAFETY: family checked; the storage holds the matching struct.
            libc::AF_INET => u16::from_be(unsafe { self.as_v4().sin_port }),
            libc::AF_INET6 => u16::from_be(unsafe { self.as_v6().sin6_port }),
            _ => 0,
        }
    }

    pub fn set_scope_id(&mut self, scope_id: u32) -> Result<()> {
        if self.family() != libc::AF_INET6 {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        // SAFETY: family checked.
        unsafe { self.as_v6_mut().sin6_scope_id = scope_id };
        Ok(())
    }

    pub fn is_ipv6_link_local(&self) -> bool {
        if self.family() != libc::AF_INET6 {
            return false;
        }
        // SAFETY: family checked.
        let octets = unsafe { self.as_v6().sin6_addr.s6_addr };
        Ipv6Addr::from(octets).is_unicast_link_local()
    }

    /// The textual address without the port. IPv6 link-local addresses with a
    /// scope id render it as a `%<n>` suffix; unspecified renders as `*`.
    pub fn addr_string(&self) -> Result<String> {
        match self.family() {
            libc::AF_INET => {
                // SAFETY: family checked.
                let raw = unsafe { self.as_v4().sin_addr.s_addr };
                Ok(Ipv4Addr::from(raw.to_ne_bytes()).to_string())
            }
            libc::AF_INET6 => {
                // SAFETY: family checked.
                let sin6 = unsafe { self.as_v6() };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let mut text = ip.to_string();
                if ip.is_unicast_link_local() && sin6.sin6_scope_id != 0 {
                    text.push('%');
                    text.push_str(&sin6.sin6_scope_id.to_string());
                }
                Ok(text)
            }
            libc::AF_UNSPEC => Ok("*".to_owned()),
            _ => Err(Error::new(ErrorKind::InvalidArgument)),
        }
    }

    #[inline]
    pub(crate) fn as_sockaddr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub(crate) fn as_sockaddr_mut(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    unsafe fn as_v4(&self) -> &libc::sockaddr_in {
        &*(&self.storage as *const _ as *const libc::sockaddr_in)
    }

    unsafe fn as_v6(&self) -> &libc::sockaddr_in6 {
        &*(&self.storage as *const _ as *const libc::sockaddr_in6)
    }

    unsafe fn as_v6_mut(&mut self) -> &mut libc::sockaddr_in6 {
        &mut *(&mut self.storage as *mut _ as *mut libc::sockaddr_in6)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.addr_string().unwrap_or_else(|_| "?".to_owned());
        write!(f, "{}:{}", addr, self.port())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4() {
        let addr = Address::parse("127.0.0.1", 50001).unwrap();
        assert_eq!(addr.family(), libc::AF_INET);
        assert_eq!(addr.port(), 50001);
        assert_eq!(addr.addr_string().unwrap(), "127.0.0.1");
        assert_eq!(addr.to_string(), "127.0.0.1:50001");
    }

    #[test]
    fn parse_v6_with_scope() {
        let addr = Address::parse("fe80::1%3", 7).unwrap();
        assert_eq!(addr.family(), libc::AF_INET6);
        assert_eq!(addr.port(), 7);
        assert!(addr.is_ipv6_link_local());
        assert_eq!(addr.addr_string().unwrap(), "fe80::1%3");
    }

    #[test]
    fn empty_is_unspecified() {
        let addr = Address::parse("", 1234).unwrap();
        assert!(addr.is_unspecified());
        assert_eq!(addr.port(), 0);
        assert_eq!(addr.addr_string().unwrap(), "*");
    }

    #[test]
    fn bad_addresses_rejected() {
        assert_eq!(
            Address::parse("not-an-ip", 0).unwrap_err().kind(),
            ErrorKind::InvalidAddress
        );
        // Scope ids only apply to IPv6.
        assert_eq!(
            Address::parse("10.0.0.1%2", 0).unwrap_err().kind(),
            ErrorKind::InvalidAddress
        );
    }

    #[test]
    fn scope_id_is_v6_only() {
        let mut addr = Address::parse("::1", 99).unwrap();
        assert_eq!(addr.port(), 99);
        addr.set_scope_id(5).unwrap();

        let mut v4 = Address::parse("1.2.3.4", 80).unwrap();
        assert!(v4.set_scope_id(5).is_err());
        assert_eq!(v4.to_string(), "1.2.3.4:80");
    }

    #[test]
    fn raw_roundtrip() {
        let addr = Address::parse("192.168.0.7", 4242).unwrap();
        // SAFETY: pointer comes from a valid Address.
        let copied = unsafe { Address::from_raw(addr.as_sockaddr()) };
        assert_eq!(copied.to_string(), "192.168.0.7:4242");
    }
}
