use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::process::{Command, Output};

use tracing::{debug, info};

use crate::address::{AddressAllocator, LinkSubnet};
use crate::command::{self, privileged, render, NodeExec};
use crate::error::{CommandError, Result};

/// A Linux network namespace with RAII cleanup.
///
/// Creates the namespace on construction, brings up loopback, and deletes
/// it on drop. All commands inside the namespace run via `ip netns exec`.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self, CommandError> {
        // Clean up stale namespace with same name (idempotent)
        let _ = command::root("ip", &["netns", "del", name]);

        command::root_checked("ip", &["netns", "add", name])?;
        debug!(ns = name, "created network namespace");

        let ns = Self {
            name: name.to_string(),
        };
        ns.exec_checked("ip", &["link", "set", "lo", "up"])?;
        Ok(ns)
    }

    /// A privileged `Command` that runs `program` inside this namespace in
    /// its own process group, so the whole tree can be signalled at once.
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = privileged("ip");
        cmd.args(["netns", "exec", &self.name, program]);
        cmd.process_group(0);
        cmd
    }

    /// Create a veth pair with one end in this namespace and the other in
    /// `peer`, and bring both ends up. Interface names must be <= 15 chars.
    pub fn add_veth_link(
        &self,
        peer: &Namespace,
        local_iface: &str,
        peer_iface: &str,
    ) -> Result<(), CommandError> {
        command::root_checked(
            "ip",
            &[
                "link", "add", local_iface, "netns", &self.name, "type", "veth", "peer", "name",
                peer_iface, "netns", &peer.name,
            ],
        )?;
        self.exec_checked("ip", &["link", "set", local_iface, "up"])?;
        peer.exec_checked("ip", &["link", "set", peer_iface, "up"])?;

        debug!(
            ns_local = %self.name,
            ns_peer = %peer.name,
            local_iface,
            peer_iface,
            "veth link created"
        );
        Ok(())
    }
}

impl NodeExec for Namespace {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn exec(&self, cmd: &str, args: &[&str]) -> Result<Output, CommandError> {
        debug!(ns = %self.name, cmd = %render(cmd, args), "exec");
        privileged("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output()
            .map_err(|e| CommandError::launch(format!("[{}] {}", self.name, render(cmd, args)), e))
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = %self.name, "deleting network namespace");
        let _ = command::root("ip", &["netns", "del", &self.name]);
    }
}

// -- per-node configuration steps --

/// Disable TCP segmentation and UDP fragmentation offloads on `iface`.
///
/// The central link reshapes packet timing; with offloads on, captured
/// super-packets no longer match what crossed the wire.
pub fn disable_offloads(node: &impl NodeExec, iface: &str) -> Result<(), CommandError> {
    node.exec_checked(
        "ethtool",
        &["-K", iface, "tx", "off", "sg", "off", "tso", "off", "ufo", "off"],
    )?;
    Ok(())
}

pub fn disable_ipv6(node: &impl NodeExec) -> Result<(), CommandError> {
    for key in [
        "net.ipv6.conf.all.disable_ipv6=1",
        "net.ipv6.conf.default.disable_ipv6=1",
        "net.ipv6.conf.lo.disable_ipv6=1",
    ] {
        node.exec_checked("sysctl", &["-w", key])?;
    }
    Ok(())
}

pub fn mac_address(node: &impl NodeExec, iface: &str) -> Result<String, CommandError> {
    let path = format!("/sys/class/net/{iface}/address");
    let output = node.exec_checked("cat", &[&path])?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Pin `ip -> mac` on `iface` so no ARP traffic is needed mid-run.
pub fn add_static_neighbor(
    node: &impl NodeExec,
    ip: Ipv4Addr,
    mac: &str,
    iface: &str,
) -> Result<(), CommandError> {
    let ip = ip.to_string();
    node.exec_checked(
        "ip",
        &["neigh", "replace", &ip, "lladdr", mac, "dev", iface, "nud", "permanent"],
    )?;
    Ok(())
}

/// Attach `veth` to a fresh bridge that carries the host address and the
/// default route towards `gateway`.
pub fn setup_host_bridge(
    node: &impl NodeExec,
    veth: &str,
    bridge: &str,
    host_cidr: &str,
    gateway: Ipv4Addr,
) -> Result<(), CommandError> {
    let gateway = gateway.to_string();
    node.exec_checked("ip", &["link", "add", "name", bridge, "type", "bridge"])?;
    node.exec_checked("ip", &["link", "set", veth, "master", bridge])?;
    node.exec_checked("ip", &["link", "set", "dev", bridge, "up"])?;
    node.exec_checked("ip", &["addr", "add", host_cidr, "dev", bridge])?;
    node.exec_checked(
        "ip",
        &["route", "add", "default", "via", &gateway, "dev", bridge],
    )?;
    disable_offloads(node, bridge)
}

// -- dumbbell --

/// One end host of the dumbbell.
#[derive(Debug)]
pub struct Host {
    pub ns: Namespace,
    /// veth towards the router (shaped).
    pub veth: String,
    /// Bridge enslaving `veth`; carries the address and is where captures run.
    pub bridge: String,
    pub addr: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// One side of the dumbbell: N hosts behind one router.
#[derive(Debug)]
pub struct Half {
    pub hosts: Vec<Host>,
    pub router: Namespace,
    /// Router interfaces, index i faces host i; the last one is the central link.
    pub router_ifaces: Vec<String>,
}

impl Half {
    pub fn central_iface(&self) -> &str {
        self.router_ifaces
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Two halves joined by the central link. Dropping it deletes every namespace.
#[derive(Debug)]
pub struct Dumbbell {
    pub left: Half,
    pub right: Half,
    pub central: LinkSubnet,
}

impl Dumbbell {
    pub fn flow_count(&self) -> usize {
        self.left.hosts.len()
    }
}

/// Builds a [`Dumbbell`] out of namespaces and veth pairs.
#[derive(Debug, Clone)]
pub struct DumbbellBuilder {
    prefix: String,
    allocator: AddressAllocator,
}

impl DumbbellBuilder {
    /// `prefix` is prepended to every namespace name (`<prefix>-a1`, `<prefix>-r1`, ...).
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            allocator: AddressAllocator::default(),
        }
    }

    pub fn with_allocator(mut self, allocator: AddressAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// Build the topology for `flows` flows.
    ///
    /// The address space is checked before any namespace is created.
    pub fn build(mut self, flows: usize) -> Result<Dumbbell> {
        self.allocator.check_capacity(flows)?;

        info!(flows, prefix = %self.prefix, "building dumbbell topology");
        let mut left = self.build_half("a", "r1", flows)?;
        let mut right = self.build_half("b", "r2", flows)?;

        let central = self.allocator.next_subnet()?;
        let left_iface = format!("r1-eth{flows}");
        let right_iface = format!("r2-eth{flows}");
        left.router
            .add_veth_link(&right.router, &left_iface, &right_iface)?;
        left.router
            .exec_checked("ip", &["addr", "add", &central.first_cidr(), "dev", &left_iface])?;
        right.router
            .exec_checked("ip", &["addr", "add", &central.second_cidr(), "dev", &right_iface])?;
        disable_offloads(&left.router, &left_iface)?;
        disable_offloads(&right.router, &right_iface)?;

        let left_mac = mac_address(&left.router, &left_iface)?;
        let right_mac = mac_address(&right.router, &right_iface)?;
        add_static_neighbor(&left.router, central.second(), &right_mac, &left_iface)?;
        add_static_neighbor(&right.router, central.first(), &left_mac, &right_iface)?;

        let to_right = central.second().to_string();
        let to_left = central.first().to_string();
        left.router
            .exec_checked("ip", &["route", "add", "default", "via", &to_right])?;
        right.router
            .exec_checked("ip", &["route", "add", "default", "via", &to_left])?;

        left.router_ifaces.push(left_iface);
        right.router_ifaces.push(right_iface);

        info!(%central, "central link up");
        Ok(Dumbbell {
            left,
            right,
            central,
        })
    }

    fn build_half(&mut self, literal: &str, router_name: &str, flows: usize) -> Result<Half> {
        let router = Namespace::new(&format!("{}-{router_name}", self.prefix))?;
        router.exec_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
        disable_ipv6(&router)?;

        let mut hosts = Vec::with_capacity(flows);
        let mut router_ifaces = Vec::with_capacity(flows + 1);

        for i in 0..flows {
            let host_name = format!("{literal}{}", i + 1);
            let ns = Namespace::new(&format!("{}-{host_name}", self.prefix))?;
            disable_ipv6(&ns)?;

            let veth = format!("{host_name}-eth0");
            let bridge = format!("{host_name}-br0");
            let router_iface = format!("{router_name}-eth{i}");
            ns.add_veth_link(&router, &veth, &router_iface)?;

            let subnet = self.allocator.next_subnet()?;
            router.exec_checked(
                "ip",
                &["addr", "add", &subnet.second_cidr(), "dev", &router_iface],
            )?;

            disable_offloads(&router, &router_iface)?;
            disable_offloads(&ns, &veth)?;
            setup_host_bridge(&ns, &veth, &bridge, &subnet.first_cidr(), subnet.second())?;

            // Neighbour entries only once the bridge owns the host address.
            let host_mac = mac_address(&ns, &bridge)?;
            let router_mac = mac_address(&router, &router_iface)?;
            add_static_neighbor(&router, subnet.first(), &host_mac, &router_iface)?;
            add_static_neighbor(&ns, subnet.second(), &router_mac, &bridge)?;

            debug!(host = %host_name, %subnet, "host attached");
            hosts.push(Host {
                ns,
                veth,
                bridge,
                addr: subnet.first(),
                gateway: subnet.second(),
            });
            router_ifaces.push(router_iface);
        }

        Ok(Half {
            hosts,
            router,
            router_ifaces,
        })
    }
}
