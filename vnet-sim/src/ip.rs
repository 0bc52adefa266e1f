//! A [`Backend`] driving the host kernel through `iproute2`.
//!
//! Every call shells out to `ip`, `tc` or `sysctl`, optionally prefixed with `sudo`. Commands that
//! must run inside a namespace use `ip netns exec <namespace>`; veth pairs are created with both
//! ends placed directly in their target namespaces, so device names never clash with devices in
//! the host namespace.

use std::time::Duration;

use ipnet::IpNet;

use crate::{
    command::{Output, Runner, TERM_GRACE},
    Backend, Endpoint, KernelRoute, PortFilter, Result,
};

/// Options for the [`IpBackend`].
#[derive(Debug, Clone)]
pub struct IpOptions {
    /// Prefix every command with `sudo`.
    pub sudo: bool,
}

impl Default for IpOptions {
    fn default() -> Self {
        Self { sudo: !nix::unistd::geteuid().is_root() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpBackend {
    options: IpOptions,
}

impl IpBackend {
    pub fn new(options: IpOptions) -> Self {
        Self { options }
    }

    fn prefixed<'a>(&self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 1);
        if self.options.sudo {
            full.push("sudo");
        }
        full.extend_from_slice(args);
        full
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Ok(Runner::checked(&self.prefixed(args))?)
    }

    /// Arguments running `command_line` in `namespace` under `timeout(1)`.
    ///
    /// `timeout` runs with the privileges of the command: it passes the `SIGTERM` sent at the
    /// deadline on to every process the command started, and stops them on its own `backstop`
    /// seconds in, should the caller have gone away.
    fn exec_args<'a>(
        &self,
        namespace: &'a str,
        command_line: &'a str,
        backstop: &'a str,
    ) -> Vec<&'a str> {
        let timeout = ["timeout", "-k", "1", backstop];
        let mut args = vec!["ip", "netns", "exec", namespace];
        args.extend(timeout);
        args.extend(["sh", "-c", command_line]);
        self.prefixed(&args)
    }

    /// Pids of the processes running inside `namespace`.
    pub fn namespace_pids(&self, namespace: &str) -> Result<Vec<u32>> {
        let output = self.run(&["ip", "netns", "pids", namespace])?;
        Ok(output.stdout.split_whitespace().filter_map(|pid| pid.parse().ok()).collect())
    }

    /// Take the arguments to run a command and add the prefix to run it in the namespace.
    fn run_in(&self, namespace: &str, args: &[&str]) -> Result<Output> {
        let mut full = vec!["ip", "netns", "exec", namespace];
        full.extend_from_slice(args);
        self.run(&full)
    }
}

impl Backend for IpBackend {
    fn add_namespace(&self, name: &str) -> Result<()> {
        tracing::debug!(namespace = name, "creating namespace");
        self.run(&["ip", "netns", "add", name])?;
        Ok(())
    }

    fn del_namespace(&self, name: &str) -> Result<()> {
        tracing::debug!(namespace = name, "deleting namespace");
        self.run(&["ip", "netns", "del", name])?;
        Ok(())
    }

    /// Note: device name length can be max 15 chars long.
    fn add_veth(&self, a: Endpoint<'_>, b: Endpoint<'_>) -> Result<()> {
        self.run(&[
            "ip",
            "link",
            "add",
            a.device,
            "netns",
            a.namespace,
            "type",
            "veth",
            "peer",
            "name",
            b.device,
            "netns",
            b.namespace,
        ])?;

        let up = self.set_link_up(a).and_then(|()| self.set_link_up(b));
        if let Err(e) = up {
            // Keep the pair atomic: a half-configured pair is removed again.
            if let Err(cleanup) = self.del_link(a) {
                tracing::warn!(?cleanup, device = a.device, "failed to remove veth after error");
            }
            return Err(e);
        }

        tracing::debug!(?a, ?b, "veth pair configured");
        Ok(())
    }

    fn del_link(&self, end: Endpoint<'_>) -> Result<()> {
        self.run(&["ip", "-n", end.namespace, "link", "del", "dev", end.device])?;
        Ok(())
    }

    fn add_bridge(&self, namespace: &str, bridge: &str) -> Result<()> {
        self.run(&["ip", "-n", namespace, "link", "add", "name", bridge, "type", "bridge"])?;
        self.set_link_up(Endpoint::new(namespace, bridge))
    }

    fn attach_to_bridge(&self, port: Endpoint<'_>, bridge: &str) -> Result<()> {
        let Endpoint { namespace, device } = port;
        self.run(&["ip", "-n", namespace, "link", "set", "dev", device, "master", bridge])?;
        Ok(())
    }

    fn set_link_up(&self, end: Endpoint<'_>) -> Result<()> {
        self.run(&["ip", "-n", end.namespace, "link", "set", "dev", end.device, "up"])?;
        Ok(())
    }

    fn replace_address(&self, end: Endpoint<'_>, address: IpNet) -> Result<()> {
        let address = address.to_string();
        self.run(&["ip", "-n", end.namespace, "addr", "flush", "dev", end.device])?;
        self.run(&["ip", "-n", end.namespace, "addr", "add", &address, "dev", end.device])?;
        Ok(())
    }

    fn add_route(&self, namespace: &str, route: KernelRoute<'_>) -> Result<()> {
        let destination = if route.destination.prefix_len() == 0 {
            "default".to_string()
        } else {
            route.destination.trunc().to_string()
        };
        let gateway = route.gateway.map(|gw| gw.to_string());

        let mut args = vec!["ip", "-n", namespace, "route", "add", destination.as_str()];
        if let Some(gateway) = gateway.as_deref() {
            args.extend(["via", gateway]);
        }
        if let Some(device) = route.device {
            args.extend(["dev", device]);
        }

        self.run(&args)?;
        Ok(())
    }

    fn write_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{key}={value}");
        self.run_in(namespace, &["sysctl", "-q", "-w", &assignment])?;
        Ok(())
    }

    fn clear_filters(&self, port: Endpoint<'_>) -> Result<()> {
        let Endpoint { namespace, device } = port;
        // The qdisc may not exist yet; only the re-creation below must succeed.
        if let Err(e) = self.run_in(namespace, &["tc", "qdisc", "del", "dev", device, "clsact"]) {
            tracing::debug!(?e, device, "no clsact qdisc to remove");
        }
        self.run_in(namespace, &["tc", "qdisc", "add", "dev", device, "clsact"])?;
        Ok(())
    }

    fn add_filter(&self, port: Endpoint<'_>, filter: &PortFilter) -> Result<()> {
        let args = filter.to_args(port.device);
        let mut full = vec!["tc"];
        full.extend(args.iter().map(String::as_str));
        self.run_in(port.namespace, &full)?;
        Ok(())
    }

    fn exec(&self, namespace: &str, command_line: &str, timeout: Duration) -> Result<Output> {
        let backstop = backstop_secs(timeout);
        let args = self.exec_args(namespace, command_line, &backstop);
        Ok(Runner::with_timeout(&args, timeout)?)
    }
}

/// Deadline of the in-namespace `timeout`, in seconds. It only fires once the caller's own
/// deadline and grace period are over.
fn backstop_secs(timeout: Duration) -> String {
    format!("{:.3}", (timeout + TERM_GRACE + Duration::from_secs(1)).as_secs_f64())
}
