//! Local network interface enumeration.

use std::net::Ipv4Addr;

/// The IPv4 addresses of every network interface that is currently up.
///
/// Loopback is included; interfaces that are down or have no IPv4 address
/// contribute nothing. Multicast-receive endpoints join their group on each
/// of these addresses.
pub fn interface_addresses() -> Vec<Ipv4Addr> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|interface| interface.is_up())
        .flat_map(|interface| {
            interface
                .ipv4
                .iter()
                .map(|net| net.addr())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_loopback_when_present() {
        let addresses = interface_addresses();
        // Machines running the tests have at least a loopback interface up.
        assert!(!addresses.is_empty());
    }
}
