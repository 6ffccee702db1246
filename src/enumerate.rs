//! Enumeration of local RDMA-capable interface addresses.

use std::ffi::CString;
use std::net::IpAddr;

use local_ip_address::list_afinet_netifas;

use crate::addr::{filter_to_native, Address};
use crate::cm::CmId;
use crate::error::{Error, ErrorKind, Result};

/// List the textual addresses of local interfaces matching
/// `filter_address_family` (0 = any, 4 = IPv4 only, 6 = IPv6 only).
///
/// Loopback interfaces are skipped, IPv6 link-local addresses get their
/// interface's scope id attached so they are directly usable, and each
/// candidate is kept only if an RDMA CM identifier actually binds to it,
/// which is what separates an RDMA-capable interface from a plain one.
pub fn enumerate(filter_address_family: i32) -> Result<Vec<String>> {
    let native_family = filter_to_native(filter_address_family)?;

    let interfaces =
        list_afinet_netifas().map_err(|_| Error::new(ErrorKind::OperatingSystemError))?;

    let mut addresses = Vec::new();
    for (if_name, ip) in interfaces {
        if ip.is_loopback() {
            continue;
        }
        let family = match ip {
            IpAddr::V4(_) => libc::AF_INET,
            IpAddr::V6(_) => libc::AF_INET6,
        };
        if native_family != libc::AF_UNSPEC && family != native_family {
            continue;
        }

        let mut address = Address::parse(&ip.to_string(), 0)?;
        if address.is_ipv6_link_local() {
            if let Some(index) = interface_index(&if_name) {
                address.set_scope_id(index)?;
            }
        }

        if is_rdma_capable(&address) {
            addresses.push(address.addr_string()?);
        }
    }
    Ok(addresses)
}

fn interface_index(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: FFI with a valid C string.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    (index != 0).then_some(index)
}

/// If a CM identifier binds to the address, the interface speaks RDMA.
/// Creating the event channel fails outright when no devices are present.
fn is_rdma_capable(address: &Address) -> bool {
    CmId::create_bound(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_filter() {
        assert_eq!(
            enumerate(3).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn family_filters_accepted() {
        // With or without RDMA hardware these must not error; without
        // devices the bind probe simply filters everything out.
        for filter in [0, 4, 6] {
            let _ = enumerate(filter);
        }
    }
}
