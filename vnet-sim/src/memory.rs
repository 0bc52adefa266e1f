//! An in-memory [`Backend`].
//!
//! [`MemoryBackend`] models the kernel objects the engine manipulates (namespaces, devices,
//! addresses, routes, sysctls and ingress filters) without touching the host. It enforces the
//! same existence rules the kernel does, so ordering bugs surface as errors, and it keeps per
//! operation call counters.
//!
//! Failures can be injected with [`MemoryBackend::fail_on`]: the N-th call of an operation returns
//! [`Error::Injected`] without modifying any state.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    net::IpAddr,
    time::Duration,
};

use ipnet::IpNet;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{command::Output, Backend, Endpoint, Error, KernelRoute, PortFilter, Result};

/// The kernel operations exposed by [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    AddNamespace,
    DelNamespace,
    AddVeth,
    DelLink,
    AddBridge,
    AttachToBridge,
    SetLinkUp,
    ReplaceAddress,
    AddRoute,
    WriteSysctl,
    ClearFilters,
    AddFilter,
    Exec,
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddNamespace => "add_namespace",
            Self::DelNamespace => "del_namespace",
            Self::AddVeth => "add_veth",
            Self::DelLink => "del_link",
            Self::AddBridge => "add_bridge",
            Self::AttachToBridge => "attach_to_bridge",
            Self::SetLinkUp => "set_link_up",
            Self::ReplaceAddress => "replace_address",
            Self::AddRoute => "add_route",
            Self::WriteSysctl => "write_sysctl",
            Self::ClearFilters => "clear_filters",
            Self::AddFilter => "add_filter",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Loopback,
    Veth { peer_namespace: String, peer_device: String },
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub kind: DeviceKind,
    pub up: bool,
    pub master: Option<String>,
    pub addresses: Vec<IpNet>,
    pub filters: Vec<PortFilter>,
}

impl Device {
    fn new(kind: DeviceKind, up: bool) -> Self {
        Self { kind, up, master: None, addresses: Vec::new(), filters: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
}

/// Snapshot of a namespace's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceState {
    pub devices: BTreeMap<String, Device>,
    pub routes: Vec<RouteRecord>,
    pub sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Kernel {
    namespaces: BTreeMap<String, NamespaceState>,
    calls: FxHashMap<Op, usize>,
    failures: FxHashMap<Op, usize>,
    executed: Vec<(String, String)>,
}

impl Kernel {
    /// Count a call to `op`, failing it if an injection is armed for this call number.
    fn record(&mut self, op: Op) -> Result<()> {
        let counter = self.calls.entry(op).or_default();
        *counter += 1;
        let call = *counter;

        if self.failures.get(&op) == Some(&call) {
            tracing::debug!(%op, call, "injecting failure");
            return Err(Error::Injected { op, call });
        }
        Ok(())
    }

    fn namespace_mut(&mut self, name: &str) -> Result<&mut NamespaceState> {
        self.namespaces.get_mut(name).ok_or_else(|| Error::NamespaceNotFound(name.to_string()))
    }

    fn device_mut(&mut self, end: Endpoint<'_>) -> Result<&mut Device> {
        self.namespace_mut(end.namespace)?.devices.get_mut(end.device).ok_or_else(|| {
            Error::DeviceNotFound {
                namespace: end.namespace.to_string(),
                device: end.device.to_string(),
            }
        })
    }

    fn ensure_free(&self, end: Endpoint<'_>) -> Result<()> {
        let namespace = self
            .namespaces
            .get(end.namespace)
            .ok_or_else(|| Error::NamespaceNotFound(end.namespace.to_string()))?;
        if namespace.devices.contains_key(end.device) {
            return Err(Error::DeviceExists {
                namespace: end.namespace.to_string(),
                device: end.device.to_string(),
            });
        }
        Ok(())
    }
}

type Responder = dyn Fn(&str, &str) -> Output + Send + Sync;

/// An in-memory kernel. See the [module documentation](self).
#[derive(Default)]
pub struct MemoryBackend {
    kernel: Mutex<Kernel>,
    responder: Option<Box<Responder>>,
}

impl Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("kernel", &*self.kernel.lock())
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer [`Backend::exec`] calls with `responder(namespace, command_line)`. Without a
    /// responder, every command succeeds silently.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&str, &str) -> Output + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Make the `nth` (1-based) call of `op` fail with [`Error::Injected`].
    pub fn fail_on(&self, op: Op, nth: usize) {
        self.kernel.lock().failures.insert(op, nth);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: Op) -> usize {
        self.kernel.lock().calls.get(&op).copied().unwrap_or_default()
    }

    /// Names of the namespaces currently alive.
    pub fn namespaces(&self) -> Vec<String> {
        self.kernel.lock().namespaces.keys().cloned().collect()
    }

    /// A snapshot of the namespace `name`, if it exists.
    pub fn namespace(&self, name: &str) -> Option<NamespaceState> {
        self.kernel.lock().namespaces.get(name).cloned()
    }

    /// Number of veth pairs currently alive.
    pub fn veth_pairs(&self) -> usize {
        let kernel = self.kernel.lock();
        let ends = kernel
            .namespaces
            .values()
            .flat_map(|ns| ns.devices.values())
            .filter(|dev| matches!(dev.kind, DeviceKind::Veth { .. }))
            .count();
        ends / 2
    }

    /// Every `(namespace, command_line)` passed to [`Backend::exec`], in call order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.kernel.lock().executed.clone()
    }
}

impl Backend for MemoryBackend {
    fn add_namespace(&self, name: &str) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AddNamespace)?;
        if kernel.namespaces.contains_key(name) {
            return Err(Error::NamespaceExists(name.to_string()));
        }

        let mut namespace = NamespaceState::default();
        namespace.devices.insert("lo".to_string(), Device::new(DeviceKind::Loopback, false));
        kernel.namespaces.insert(name.to_string(), namespace);
        Ok(())
    }

    fn del_namespace(&self, name: &str) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::DelNamespace)?;
        if kernel.namespaces.remove(name).is_none() {
            return Err(Error::NamespaceNotFound(name.to_string()));
        }

        // The kernel destroys the peers of veth devices that lived in the namespace.
        for namespace in kernel.namespaces.values_mut() {
            namespace.devices.retain(|_, dev| match &dev.kind {
                DeviceKind::Veth { peer_namespace, .. } => peer_namespace != name,
                _ => true,
            });
        }
        Ok(())
    }

    fn add_veth(&self, a: Endpoint<'_>, b: Endpoint<'_>) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AddVeth)?;
        kernel.ensure_free(a)?;
        kernel.ensure_free(b)?;
        if a == b {
            return Err(Error::DeviceExists {
                namespace: a.namespace.to_string(),
                device: a.device.to_string(),
            });
        }

        let veth = |peer: Endpoint<'_>| {
            Device::new(
                DeviceKind::Veth {
                    peer_namespace: peer.namespace.to_string(),
                    peer_device: peer.device.to_string(),
                },
                true,
            )
        };
        kernel.namespace_mut(a.namespace)?.devices.insert(a.device.to_string(), veth(b));
        kernel.namespace_mut(b.namespace)?.devices.insert(b.device.to_string(), veth(a));
        Ok(())
    }

    fn del_link(&self, end: Endpoint<'_>) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::DelLink)?;
        let kind = kernel.device_mut(end)?.kind.clone();
        kernel.namespace_mut(end.namespace)?.devices.remove(end.device);

        if let DeviceKind::Veth { peer_namespace, peer_device } = kind {
            if let Some(namespace) = kernel.namespaces.get_mut(&peer_namespace) {
                namespace.devices.remove(&peer_device);
            }
        }
        Ok(())
    }

    fn add_bridge(&self, namespace: &str, bridge: &str) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AddBridge)?;
        let end = Endpoint::new(namespace, bridge);
        kernel.ensure_free(end)?;
        kernel
            .namespace_mut(namespace)?
            .devices
            .insert(bridge.to_string(), Device::new(DeviceKind::Bridge, true));
        Ok(())
    }

    fn attach_to_bridge(&self, port: Endpoint<'_>, bridge: &str) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AttachToBridge)?;
        let is_bridge = kernel.device_mut(Endpoint::new(port.namespace, bridge))?.kind
            == DeviceKind::Bridge;
        if !is_bridge {
            return Err(Error::DeviceNotFound {
                namespace: port.namespace.to_string(),
                device: bridge.to_string(),
            });
        }
        kernel.device_mut(port)?.master = Some(bridge.to_string());
        Ok(())
    }

    fn set_link_up(&self, end: Endpoint<'_>) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::SetLinkUp)?;
        kernel.device_mut(end)?.up = true;
        Ok(())
    }

    fn replace_address(&self, end: Endpoint<'_>, address: IpNet) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::ReplaceAddress)?;
        kernel.device_mut(end)?.addresses = vec![address];
        Ok(())
    }

    fn add_route(&self, namespace: &str, route: KernelRoute<'_>) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AddRoute)?;
        if let Some(device) = route.device {
            kernel.device_mut(Endpoint::new(namespace, device))?;
        }

        let destination = route.destination.trunc();
        let state = kernel.namespace_mut(namespace)?;
        if state.routes.iter().any(|r| r.destination == destination) {
            return Err(Error::RouteExists { namespace: namespace.to_string(), destination });
        }
        state.routes.push(RouteRecord {
            destination,
            gateway: route.gateway,
            device: route.device.map(str::to_string),
        });
        Ok(())
    }

    fn write_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::WriteSysctl)?;
        kernel.namespace_mut(namespace)?.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear_filters(&self, port: Endpoint<'_>) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::ClearFilters)?;
        kernel.device_mut(port)?.filters.clear();
        Ok(())
    }

    fn add_filter(&self, port: Endpoint<'_>, filter: &PortFilter) -> Result<()> {
        let mut kernel = self.kernel.lock();
        kernel.record(Op::AddFilter)?;
        kernel.device_mut(port)?.filters.push(filter.clone());
        Ok(())
    }

    fn exec(&self, namespace: &str, command_line: &str, _timeout: Duration) -> Result<Output> {
        {
            let mut kernel = self.kernel.lock();
            kernel.record(Op::Exec)?;
            kernel.namespace_mut(namespace)?;
            kernel.executed.push((namespace.to_string(), command_line.to_string()));
        }

        Ok(match &self.responder {
            Some(responder) => responder(namespace, command_line),
            None => Output::empty(),
        })
    }
}
