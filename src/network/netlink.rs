use crate::network::error::{NetworkError, NetworkResult};
use crate::utils::console::ConsoleLogger;
use futures::TryStreamExt;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use std::net::IpAddr;

/// Netlink handle wrapping rtnetlink for link, address and route work.
/// Opened per operation scope; the connection task dies with the handle.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

/// Valid macvlan modes and their kernel bit values.
const MACVLAN_MODES: &[(&str, u32)] = &[
    ("private", 1),
    ("vepa", 2),
    ("bridge", 4),
    ("passthru", 8),
];

/// Valid ipvlan modes.
const IPVLAN_MODES: &[(&str, u16)] = &[("l2", 0), ("l3", 1)];

pub fn valid_macvlan_type(mode: &str) -> bool {
    MACVLAN_MODES.iter().any(|(name, _)| *name == mode)
}

pub fn valid_ipvlan_mode(mode: &str) -> bool {
    IPVLAN_MODES.iter().any(|(name, _)| *name == mode)
}

pub fn valid_mac_addr(hw: &str) -> bool {
    parse_mac_addr(hw).is_ok()
}

/// Parse "aa:bb:cc:dd:ee:ff" into the six hardware address bytes.
pub fn parse_mac_addr(hw: &str) -> NetworkResult<[u8; 6]> {
    let parts: Vec<&str> = hw.split(':').collect();
    if parts.len() != 6 {
        return Err(NetworkError::Validation(format!("bad hwaddr {}", hw)));
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| NetworkError::Validation(format!("bad hwaddr {}", hw)))?;
    }
    Ok(mac)
}

#[allow(dead_code)] // Link-operation surface; the daemon wires a subset
impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(_) => Err(NetworkError::NotFound(format!("link {}", name))),
        }
    }

    /// Resolve the container-facing device. An empty request returns the
    /// single non-loopback link that is up; a named request validates
    /// existence and returns the name unchanged.
    pub async fn find_dev(&self, device: &str) -> NetworkResult<String> {
        if !device.is_empty() {
            self.get_link_index(device).await?;
            return Ok(device.to_string());
        }

        let mut candidates = Vec::new();
        let mut links = self.handle.link().get().execute();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| NetworkError::netlink("find_dev()", e))?
        {
            let flags = link.header.flags;
            if flags & libc::IFF_LOOPBACK as u32 != 0 || flags & libc::IFF_UP as u32 == 0 {
                continue;
            }
            for nla in link.nlas {
                if let LinkNla::IfName(name) = nla {
                    candidates.push(name);
                    break;
                }
            }
        }

        match candidates.len() {
            0 => Err(NetworkError::NotFound("find_dev(): no usable link".to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(NetworkError::Ambiguous(format!(
                "find_dev(): {} candidate links: {}",
                candidates.len(),
                candidates.join(", ")
            ))),
        }
    }

    /// Create a veth pair; the main end is optionally given a hardware
    /// address and MTU, the peer stays untouched until it is moved.
    pub async fn add_veth(
        &self,
        name: &str,
        peer: &str,
        hw: Option<&str>,
        mtu: Option<u32>,
    ) -> NetworkResult<()> {
        let mut request = self
            .handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string());
        Self::push_link_attrs(request.message_mut(), hw, mtu)?;
        request
            .execute()
            .await
            .map_err(|e| Self::map_add_error(format!("add_veth({}, {})", name, peer), e))?;
        ConsoleLogger::debug(&format!("Created veth pair {} <-> {}", name, peer));
        Ok(())
    }

    pub async fn add_macvlan(
        &self,
        name: &str,
        master: &str,
        mode: &str,
        hw: Option<&str>,
        mtu: Option<u32>,
    ) -> NetworkResult<()> {
        let mode_bits = MACVLAN_MODES
            .iter()
            .find(|(n, _)| *n == mode)
            .map(|(_, bits)| *bits)
            .ok_or_else(|| NetworkError::Validation(format!("bad macvlan type {}", mode)))?;
        let master_index = self.get_link_index(master).await?;

        let mut request = self
            .handle
            .link()
            .add()
            .macvlan(name.to_string(), master_index, mode_bits);
        Self::push_link_attrs(request.message_mut(), hw, mtu)?;
        request
            .execute()
            .await
            .map_err(|e| Self::map_add_error(format!("add_macvlan({}, {})", name, master), e))?;
        ConsoleLogger::debug(&format!("Created macvlan {} on {} ({})", name, master, mode));
        Ok(())
    }

    pub async fn add_ipvlan(
        &self,
        name: &str,
        master: &str,
        mode: &str,
        mtu: Option<u32>,
    ) -> NetworkResult<()> {
        let mode_bits = IPVLAN_MODES
            .iter()
            .find(|(n, _)| *n == mode)
            .map(|(_, bits)| *bits)
            .ok_or_else(|| NetworkError::Validation(format!("bad ipvlan mode {}", mode)))?;
        let master_index = self.get_link_index(master).await?;

        let mut request = self
            .handle
            .link()
            .add()
            .ipvlan(name.to_string(), master_index, mode_bits);
        Self::push_link_attrs(request.message_mut(), None, mtu)?;
        request
            .execute()
            .await
            .map_err(|e| Self::map_add_error(format!("add_ipvlan({}, {})", name, master), e))?;
        ConsoleLogger::debug(&format!("Created ipvlan {} on {} ({})", name, master, mode));
        Ok(())
    }

    fn push_link_attrs(
        message: &mut netlink_packet_route::LinkMessage,
        hw: Option<&str>,
        mtu: Option<u32>,
    ) -> NetworkResult<()> {
        if let Some(hw) = hw {
            let mac = parse_mac_addr(hw)?;
            message.nlas.push(LinkNla::Address(mac.to_vec()));
        }
        if let Some(mtu) = mtu {
            message.nlas.push(LinkNla::Mtu(mtu));
        }
        Ok(())
    }

    fn map_add_error(operation: String, e: rtnetlink::Error) -> NetworkError {
        if let rtnetlink::Error::NetlinkError(ref err) = e {
            if err.code == -libc::EEXIST {
                return NetworkError::AlreadyExists(operation);
            }
        }
        NetworkError::netlink(operation, e)
    }

    /// Enslave a link to a bridge.
    pub async fn set_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        let master_index = self.get_link_index(master).await?;
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("set_master({}, {})", name, master), e))
    }

    pub async fn link_up(&self, name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("link_up({})", name), e))
    }

    pub async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("set_mtu({}, {})", name, mtu), e))
    }

    pub async fn rename_link(&self, name: &str, new_name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .name(new_name.to_string())
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("rename_link({}, {})", name, new_name), e))
    }

    pub async fn remove_link(&self, name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| NetworkError::netlink(format!("remove_link({})", name), e))
    }

    /// Move a link into the network namespace of `pid`, renaming it in the
    /// same message so the target namespace never sees the transient name.
    pub async fn change_link_ns(&self, name: &str, new_name: &str, pid: i32) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .name(new_name.to_string())
            .setns_by_pid(pid as u32)
            .execute()
            .await
            .map_err(|e| {
                NetworkError::netlink(format!("change_link_ns({}, {}, {})", name, new_name, pid), e)
            })
    }

    pub async fn add_address(&self, name: &str, addr: IpAddr, prefix: u8) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        match self.handle.address().add(index, addr, prefix).execute().await {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref err)) if err.code == -libc::EEXIST => Ok(()),
            Err(e) => Err(NetworkError::netlink(
                format!("add_address({}, {}/{})", name, addr, prefix),
                e,
            )),
        }
    }

    pub async fn add_default_route(&self, name: &str, gateway: IpAddr) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        let result = match gateway {
            IpAddr::V4(gw) => {
                self.handle
                    .route()
                    .add()
                    .v4()
                    .gateway(gw)
                    .output_interface(index)
                    .execute()
                    .await
            }
            IpAddr::V6(gw) => {
                self.handle
                    .route()
                    .add()
                    .v6()
                    .gateway(gw)
                    .output_interface(index)
                    .execute()
                    .await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(ref err)) if err.code == -libc::EEXIST => Ok(()),
            Err(e) => Err(NetworkError::netlink(
                format!("add_default_route({}, {})", name, gateway),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac_addr("aa:bb:cc:00:11:22").unwrap(),
            [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]
        );
        assert!(valid_mac_addr("02:00:00:00:00:01"));
        assert!(!valid_mac_addr("02:00:00:00:00"));
        assert!(!valid_mac_addr("02:00:00:00:00:zz"));
        assert!(!valid_mac_addr("not-a-mac"));
    }

    #[test]
    fn mode_validation() {
        assert!(valid_macvlan_type("bridge"));
        assert!(valid_macvlan_type("passthru"));
        assert!(!valid_macvlan_type("l3"));
        assert!(valid_ipvlan_mode("l2"));
        assert!(valid_ipvlan_mode("l3"));
        assert!(!valid_ipvlan_mode("bridge"));
    }
}
