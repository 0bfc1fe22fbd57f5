// Network isolation engine: link creation in the parent namespace, moves
// into the container netns, in-namespace address/route setup and HTB
// bandwidth control.

pub mod error;
pub mod netlink;
pub mod shaping;

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::NetlinkHandle;
use crate::utils::console::ConsoleLogger;
use std::net::IpAddr;

/// A host interface moved into the container as-is.
#[derive(Debug, Clone)]
pub struct HostIfaceCfg {
    pub dev: String,
}

#[derive(Debug, Clone)]
pub struct MacVlanCfg {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub hw: Option<String>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct IpVlanCfg {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub mtu: Option<u32>,
}

/// Veth pair: the peer end stays on the host, enslaved to a bridge; the
/// named end lands in the container.
#[derive(Debug, Clone)]
pub struct VethCfg {
    pub bridge: String,
    pub name: String,
    pub hw: Option<String>,
    pub peer: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct IfaceAddr {
    pub iface: String,
    pub addr: IpAddr,
    pub prefix: u8,
}

#[derive(Debug, Clone)]
pub struct IfaceGw {
    pub iface: String,
    pub gateway: IpAddr,
}

/// Links and addressing inside a fresh network namespace.
#[derive(Debug, Clone, Default)]
pub struct NewNetNsCfg {
    pub host_ifaces: Vec<HostIfaceCfg>,
    pub macvlan: Vec<MacVlanCfg>,
    pub ipvlan: Vec<IpVlanCfg>,
    pub veth: Vec<VethCfg>,
    pub addresses: Vec<IfaceAddr>,
    pub gateways: Vec<IfaceGw>,
}

/// Network configuration of a container: inherit the parent namespace, run
/// directly in the host namespace, or build a new namespace with the
/// requested links.
#[derive(Debug, Clone)]
pub enum NetCfg {
    Inherited,
    Host,
    NewNetNs(NewNetNsCfg),
}

impl Default for NetCfg {
    fn default() -> Self {
        // default - create a new empty netns
        NetCfg::NewNetNs(NewNetNsCfg::default())
    }
}

impl NetCfg {
    pub fn is_new_netns(&self) -> bool {
        matches!(self, NetCfg::NewNetNs(_))
    }

    pub fn validate(&self) -> NetworkResult<()> {
        let cfg = match self {
            NetCfg::NewNetNs(cfg) => cfg,
            _ => return Ok(()),
        };
        for mv in &cfg.macvlan {
            if !netlink::valid_macvlan_type(&mv.mode) {
                return Err(NetworkError::Validation(format!(
                    "macvlan {}: bad type {}",
                    mv.name, mv.mode
                )));
            }
            if let Some(hw) = &mv.hw {
                if !netlink::valid_mac_addr(hw) {
                    return Err(NetworkError::Validation(format!(
                        "macvlan {}: bad hwaddr {}",
                        mv.name, hw
                    )));
                }
            }
        }
        for iv in &cfg.ipvlan {
            if !netlink::valid_ipvlan_mode(&iv.mode) {
                return Err(NetworkError::Validation(format!(
                    "ipvlan {}: bad mode {}",
                    iv.name, iv.mode
                )));
            }
        }
        for veth in &cfg.veth {
            if veth.bridge.is_empty() {
                return Err(NetworkError::Validation(format!(
                    "veth {}: no bridge",
                    veth.name
                )));
            }
            if let Some(hw) = &veth.hw {
                if !netlink::valid_mac_addr(hw) {
                    return Err(NetworkError::Validation(format!(
                        "veth {}: bad hwaddr {}",
                        veth.name, hw
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Transient name for a link that will be renamed on its way into the
/// container namespace. Kept under IFNAMSIZ.
fn transit_name(child_pid: i32, index: usize) -> String {
    let mut name = format!("wn{}c{}", child_pid, index);
    name.truncate(15);
    name
}

/// Parent half of the setup sequence: create every requested link in the
/// daemon's namespace and push it into the child netns by pid. The rename
/// to the desired name happens in the same netlink message as the move.
pub async fn setup_parent_side(cfg: &NetCfg, child_pid: i32) -> NetworkResult<()> {
    let cfg = match cfg {
        NetCfg::NewNetNs(cfg) => cfg,
        _ => return Ok(()),
    };
    let handle = NetlinkHandle::new()?;
    let mut index = 0usize;

    for host in &cfg.host_ifaces {
        let dev = handle.find_dev(&host.dev).await?;
        handle.change_link_ns(&dev, &dev, child_pid).await?;
        ConsoleLogger::debug(&format!("Moved host iface {} into pid {}", dev, child_pid));
    }

    for mv in &cfg.macvlan {
        let transit = transit_name(child_pid, index);
        index += 1;
        let master = handle.find_dev(&mv.master).await?;
        handle
            .add_macvlan(&transit, &master, &mv.mode, mv.hw.as_deref(), mv.mtu)
            .await?;
        handle.change_link_ns(&transit, &mv.name, child_pid).await?;
    }

    for iv in &cfg.ipvlan {
        let transit = transit_name(child_pid, index);
        index += 1;
        let master = handle.find_dev(&iv.master).await?;
        handle.add_ipvlan(&transit, &master, &iv.mode, iv.mtu).await?;
        handle.change_link_ns(&transit, &iv.name, child_pid).await?;
    }

    for veth in &cfg.veth {
        let transit = transit_name(child_pid, index);
        index += 1;
        handle
            .add_veth(&transit, &veth.peer, veth.hw.as_deref(), veth.mtu)
            .await?;
        handle.set_master(&veth.peer, &veth.bridge).await?;
        handle.link_up(&veth.peer).await?;
        handle.change_link_ns(&transit, &veth.name, child_pid).await?;
        ConsoleLogger::debug(&format!(
            "Veth {} (peer {} on {}) handed to pid {}",
            veth.name, veth.peer, veth.bridge, child_pid
        ));
    }

    Ok(())
}

/// Child half, run inside the new network namespace after the parent
/// reports the links moved: loopback up, configured links up, addresses
/// and default routes applied.
async fn configure_links(cfg: &NewNetNsCfg) -> NetworkResult<()> {
    let handle = NetlinkHandle::new()?;
    handle.link_up("lo").await?;

    for name in cfg
        .host_ifaces
        .iter()
        .map(|h| h.dev.as_str())
        .chain(cfg.macvlan.iter().map(|m| m.name.as_str()))
        .chain(cfg.ipvlan.iter().map(|i| i.name.as_str()))
        .chain(cfg.veth.iter().map(|v| v.name.as_str()))
    {
        if !name.is_empty() {
            handle.link_up(name).await?;
        }
    }

    for addr in &cfg.addresses {
        handle.add_address(&addr.iface, addr.addr, addr.prefix).await?;
    }
    for gw in &cfg.gateways {
        handle.add_default_route(&gw.iface, gw.gateway).await?;
    }
    Ok(())
}

/// Synchronous entry for the launcher child: it owns a fresh single-thread
/// process after fork, so a private current-thread runtime drives the
/// in-namespace netlink work.
pub fn configure_inside_netns(cfg: &NetCfg) -> NetworkResult<()> {
    let cfg = match cfg {
        NetCfg::NewNetNs(cfg) => cfg,
        _ => return Ok(()),
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(NetworkError::Io)?;
    runtime.block_on(configure_links(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn veth(name: &str, bridge: &str, hw: Option<&str>) -> VethCfg {
        VethCfg {
            bridge: bridge.to_string(),
            name: name.to_string(),
            hw: hw.map(str::to_string),
            peer: format!("{}p", name),
            mtu: None,
        }
    }

    #[test]
    fn default_is_empty_new_netns() {
        let cfg = NetCfg::default();
        assert!(cfg.is_new_netns());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn veth_requires_bridge() {
        let cfg = NetCfg::NewNetNs(NewNetNsCfg {
            veth: vec![veth("eth0", "", None)],
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_hwaddr_is_rejected() {
        let cfg = NetCfg::NewNetNs(NewNetNsCfg {
            veth: vec![veth("eth0", "warren0", Some("xx:yy"))],
            ..Default::default()
        });
        assert!(cfg.validate().is_err());

        let cfg = NetCfg::NewNetNs(NewNetNsCfg {
            veth: vec![veth("eth0", "warren0", Some("02:00:00:00:00:01"))],
            ..Default::default()
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn macvlan_mode_is_checked() {
        let cfg = NetCfg::NewNetNs(NewNetNsCfg {
            macvlan: vec![MacVlanCfg {
                master: "eth0".to_string(),
                name: "m0".to_string(),
                mode: "sideways".to_string(),
                hw: None,
                mtu: None,
            }],
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inherited_and_host_need_no_validation() {
        assert!(NetCfg::Inherited.validate().is_ok());
        assert!(NetCfg::Host.validate().is_ok());
        assert!(!NetCfg::Host.is_new_netns());
    }

    #[test]
    fn transit_names_fit_ifnamsiz() {
        let name = transit_name(4_000_000, 12);
        assert!(name.len() <= 15);
        assert!(name.starts_with("wn"));
    }
}
