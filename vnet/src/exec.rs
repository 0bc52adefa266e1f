use std::{net::IpAddr, time::Duration};

use tracing::{debug, debug_span};
use vnet_sim::{ExitCode, Output};

use crate::{Error, Network, NodeId, NodeState, Result};

/// A command to run inside a node, usually a reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    source: String,
    command: String,
    target: Option<IpAddr>,
    timeout: Option<Duration>,
}

impl Probe {
    /// A single ICMP echo from `source` to `target`, waiting at most one second for the reply.
    pub fn ping(source: impl Into<String>, target: IpAddr) -> Self {
        Self {
            source: source.into(),
            command: format!("ping -c 1 -W 1 {target}"),
            target: Some(target),
            timeout: None,
        }
    }

    /// An arbitrary shell command line.
    pub fn command(source: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self { source: source.into(), command: command_line.into(), target: None, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn command_line(&self) -> &str {
        &self.command
    }

    pub fn target(&self) -> Option<IpAddr> {
        self.target
    }
}

/// The outcome of running a command inside a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    source: String,
    command: String,
    target: Option<IpAddr>,
    output: Output,
}

impl ProbeResult {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn command_line(&self) -> &str {
        &self.command
    }

    pub fn target(&self) -> Option<IpAddr> {
        self.target
    }

    pub fn exit(&self) -> ExitCode {
        self.output.exit
    }

    pub fn stdout(&self) -> &str {
        &self.output.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.output.stderr
    }

    /// Whether the command exited with status 0 before the timeout.
    pub fn success(&self) -> bool {
        self.output.success()
    }
}

impl Network {
    /// Runs `command_line` through `sh -c` inside the node's namespace and waits for it.
    ///
    /// A non-zero exit or an elapsed timeout is reported in the result, not as an error. On
    /// timeout every process the command started is stopped and the output captured so far is
    /// kept. Fails with [`Error::InvalidNextHop`] if the node still has a pending route whose
    /// gateway nobody configured.
    pub fn run(
        &self,
        node: NodeId,
        command_line: &str,
        timeout: Option<Duration>,
    ) -> Result<ProbeResult> {
        self.execute(node, command_line, None, timeout)
    }

    /// Runs a probe, resolving its source node by name.
    pub fn probe(&self, probe: &Probe) -> Result<ProbeResult> {
        let node = self.node_id(&probe.source)?;
        self.execute(node, &probe.command, probe.target, probe.timeout)
    }

    /// Runs probes one after the other, in order.
    pub fn probe_all(&self, probes: &[Probe]) -> Result<Vec<ProbeResult>> {
        probes.iter().map(|probe| self.probe(probe)).collect()
    }

    fn execute(
        &self,
        node: NodeId,
        command_line: &str,
        target: Option<IpAddr>,
        timeout: Option<Duration>,
    ) -> Result<ProbeResult> {
        let n = self.node(node)?;
        if n.state != NodeState::Started {
            return Err(Error::NodeNotRunning(n.name.clone()));
        }
        self.verify_node_routes(n)?;

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let _span = debug_span!("run", node = %n.name, command_line, ?timeout).entered();

        let output = self.backend.exec(&n.namespace, command_line, timeout)?;
        debug!(exit = %output.exit, "command finished");

        Ok(ProbeResult {
            source: n.name.clone(),
            command: command_line.to_string(),
            target,
            output,
        })
    }
}
