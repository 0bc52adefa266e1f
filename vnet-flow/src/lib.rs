#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! OpenFlow-style match-action tables for emulated switches.
//!
//! A [`FlowTable`] holds explicit [`FlowRule`]s layered over an implicit learning switch:
//!
//! 1. Explicit rules are evaluated in descending priority; the first match wins.
//! 2. If no explicit rule matches, the packet takes the *normal* path: it goes to the port
//!    learned for its destination MAC, or is flooded to every port but the ingress one.
//!
//! Priority 0 is reserved for the normal path, so an explicit rule always takes precedence over
//! learned or flooding behaviour, whatever its priority.
//!
//! Rules can be written in the `ovs-ofctl` text form:
//!
//! ```
//! use vnet_flow::{Decision, FlowRule, FlowTable, PacketFields};
//!
//! let mut table = FlowTable::with_ports([1, 2, 3]);
//! table.install("priority=100,in_port=2,actions=drop".parse::<FlowRule>()?)?;
//!
//! assert_eq!(table.evaluate(2, &PacketFields::default()), Decision::Drop);
//! assert_eq!(table.evaluate(1, &PacketFields::default()), Decision::Flood(vec![2, 3]));
//! # Ok::<(), vnet_flow::Error>(())
//! ```

mod parse;
mod rule;
mod table;

pub use rule::{Action, FlowMatch, FlowRule, PacketFields, PortNo, Priority, DEFAULT_PRIORITY};
pub use table::{Decision, FlowTable};

/// Re-exported so callers can build [`PacketFields`] without depending on `pnet` directly.
pub use pnet::util::MacAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("priority 0 is reserved for the implicit normal action")]
    ReservedPriority,
    #[error("port numbers start at 1")]
    InvalidPort,
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("field `{0}` given more than once")]
    DuplicateField(String),
    #[error("invalid value `{value}` for `{field}`")]
    InvalidValue { field: String, value: String },
    #[error("rule has no actions")]
    MissingActions,
    #[error("unsupported action `{0}`")]
    UnsupportedAction(String),
}

pub type Result<T> = std::result::Result<T, Error>;
