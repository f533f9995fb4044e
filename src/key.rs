//! Identity keys for in-progress and completed reassemblies.
//!
//! Callers describe a logical message with a [`KeyInput`]: the flow it
//! travels on, a protocol-specific [`MessageId`] and optional discriminator
//! bytes. [`KeyFactory`] turns that input into one of two key flavours:
//!
//! - [`TempKey`] indexes the fragment table. It stores an interned
//!   [`FlowId`] instead of the full addresses, so many messages on one flow
//!   share a single owned copy of the flow.
//! - [`PersistentKey`] indexes the reassembled-result table. It owns the full
//!   flow and does not depend on interning order, so it stays stable across
//!   repeated analysis passes over the same capture.

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use bytes::Bytes;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Protocol-specific identifier shared by the fragments of one message.
///
/// # Examples
///
/// ```
/// use reassembly::key::MessageId;
/// let id = MessageId::new(0x1234);
/// assert_eq!(id.get(), 0x1234);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("{_0}")]
pub struct MessageId(u32);

impl MessageId {
    /// Create a new identifier.
    #[must_use]
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Return the inner numeric identifier.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }
}

/// Number of the captured packet currently being processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
#[display("{_0}")]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// Create a new frame number.
    #[must_use]
    pub const fn new(value: u32) -> Self { Self(value) }

    /// Return the inner frame number.
    #[must_use]
    pub const fn get(self) -> u32 { self.0 }
}

/// Endpoint address as seen by the dissector that owns the fragment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    /// No address is available at this layer.
    None,
    /// IPv4 address.
    Ipv4([u8; 4]),
    /// IPv6 address.
    Ipv6([u8; 16]),
    /// IEEE 802 MAC address.
    Ether([u8; 6]),
    /// Any other protocol-defined address.
    Other(Bytes),
}

impl From<Ipv4Addr> for Address {
    fn from(value: Ipv4Addr) -> Self { Self::Ipv4(value.octets()) }
}

impl From<Ipv6Addr> for Address {
    fn from(value: Ipv6Addr) -> Self { Self::Ipv6(value.octets()) }
}

impl From<IpAddr> for Address {
    fn from(value: IpAddr) -> Self {
        match value {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("-"),
            Self::Ipv4(octets) => write!(f, "{}", Ipv4Addr::from(*octets)),
            Self::Ipv6(octets) => write!(f, "{}", Ipv6Addr::from(*octets)),
            Self::Ether(octets) => {
                let [a, b, c, d, e, g] = octets;
                write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
            }
            Self::Other(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Directed flow a fragment travels on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source endpoint address.
    pub src: Address,
    /// Destination endpoint address.
    pub dst: Address,
    /// Source port, or zero when the layer has none.
    pub src_port: u32,
    /// Destination port, or zero when the layer has none.
    pub dst_port: u32,
    /// Protocol discriminator chosen by the dissector.
    pub protocol: u32,
}

impl FlowKey {
    /// Create a flow between two addresses with no ports or protocol.
    #[must_use]
    pub fn new(src: impl Into<Address>, dst: impl Into<Address>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
        }
    }

    /// Attach source and destination ports.
    #[must_use]
    pub fn with_ports(mut self, src_port: u32, dst_port: u32) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    /// Attach a protocol discriminator.
    #[must_use]
    pub fn with_protocol(mut self, protocol: u32) -> Self {
        self.protocol = protocol;
        self
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}/{}",
            self.src, self.src_port, self.dst, self.dst_port, self.protocol
        )
    }
}

/// Which flow fields take part in a table's identity keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScheme {
    /// Addresses and protocol only; ports are ignored.
    Addresses,
    /// Addresses, ports and protocol.
    #[default]
    AddressesPorts,
}

impl KeyScheme {
    fn project(self, flow: &FlowKey) -> Cow<'_, FlowKey> {
        match self {
            Self::AddressesPorts => Cow::Borrowed(flow),
            Self::Addresses if flow.src_port == 0 && flow.dst_port == 0 => Cow::Borrowed(flow),
            Self::Addresses => Cow::Owned(flow.clone().with_ports(0, 0)),
        }
    }
}

/// Caller-supplied description of a message identity.
#[derive(Clone, Copy, Debug)]
pub struct KeyInput<'a> {
    /// Flow the message travels on.
    pub flow: &'a FlowKey,
    /// Protocol-specific message identifier.
    pub id: MessageId,
    /// Extra bytes separating messages that reuse an identifier.
    pub discriminator: Option<&'a [u8]>,
}

impl<'a> KeyInput<'a> {
    /// Describe message `id` on `flow`.
    #[must_use]
    pub const fn new(flow: &'a FlowKey, id: MessageId) -> Self {
        Self {
            flow,
            id,
            discriminator: None,
        }
    }

    /// Add discriminator bytes to the identity.
    #[must_use]
    pub const fn with_discriminator(mut self, discriminator: &'a [u8]) -> Self {
        self.discriminator = Some(discriminator);
        self
    }
}

/// Compact handle for a flow interned by a [`KeyFactory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[display("flow#{_0}")]
pub struct FlowId(usize);

/// Fragment-table key. Only valid for the factory that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TempKey {
    flow: FlowId,
    id: MessageId,
    discriminator: Option<Bytes>,
}

impl TempKey {
    /// Interned flow of the key.
    #[must_use]
    pub const fn flow(&self) -> FlowId { self.flow }

    /// Message identifier of the key.
    #[must_use]
    pub const fn id(&self) -> MessageId { self.id }
}

/// Result-table key, stable across analysis passes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PersistentKey {
    flow: FlowKey,
    id: MessageId,
    discriminator: Option<Bytes>,
}

impl PersistentKey {
    /// Flow of the key.
    #[must_use]
    pub const fn flow(&self) -> &FlowKey { &self.flow }

    /// Message identifier of the key.
    #[must_use]
    pub const fn id(&self) -> MessageId { self.id }

    /// Discriminator bytes of the key, if any.
    #[must_use]
    pub fn discriminator(&self) -> Option<&[u8]> { self.discriminator.as_deref() }
}

impl fmt::Display for PersistentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} id {}", self.flow, self.id)?;
        if let Some(extra) = &self.discriminator {
            write!(f, " (+{} discriminator bytes)", extra.len())?;
        }
        Ok(())
    }
}

/// Builds temporary and persistent keys for one reassembly table.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
///
/// use reassembly::key::{FlowKey, KeyFactory, KeyInput, KeyScheme, MessageId};
///
/// let flow = FlowKey::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
/// let mut keys = KeyFactory::new(KeyScheme::AddressesPorts);
/// let input = KeyInput::new(&flow, MessageId::new(7));
///
/// let temp = keys.make_temp_key(&input);
/// assert_eq!(keys.find_temp_key(&input), Some(temp));
/// assert_eq!(keys.make_persistent_key(&input).id(), MessageId::new(7));
/// ```
#[derive(Debug, Default)]
pub struct KeyFactory {
    scheme: KeyScheme,
    ids: HashMap<FlowKey, FlowId>,
    flows: Vec<FlowKey>,
}

impl KeyFactory {
    /// Create a factory applying `scheme` to every key it builds.
    #[must_use]
    pub fn new(scheme: KeyScheme) -> Self {
        Self {
            scheme,
            ids: HashMap::new(),
            flows: Vec::new(),
        }
    }

    /// Scheme applied to flows.
    #[must_use]
    pub const fn scheme(&self) -> KeyScheme { self.scheme }

    /// Build a fragment-table key, interning the flow on first sight.
    pub fn make_temp_key(&mut self, input: &KeyInput<'_>) -> TempKey {
        let flow = self.scheme.project(input.flow);
        let flow = if let Some(id) = self.ids.get(flow.as_ref()) {
            *id
        } else {
            let id = FlowId(self.flows.len());
            let owned = flow.into_owned();
            self.flows.push(owned.clone());
            self.ids.insert(owned, id);
            id
        };
        TempKey {
            flow,
            id: input.id,
            discriminator: input.discriminator.map(Bytes::copy_from_slice),
        }
    }

    /// Build a fragment-table key without interning.
    ///
    /// Returns `None` when the flow has never been seen, in which case no
    /// fragment-table entry can exist for the input.
    #[must_use]
    pub fn find_temp_key(&self, input: &KeyInput<'_>) -> Option<TempKey> {
        let flow = self.scheme.project(input.flow);
        let flow = *self.ids.get(flow.as_ref())?;
        Some(TempKey {
            flow,
            id: input.id,
            discriminator: input.discriminator.map(Bytes::copy_from_slice),
        })
    }

    /// Build a result-table key owning a full copy of the flow.
    #[must_use]
    pub fn make_persistent_key(&self, input: &KeyInput<'_>) -> PersistentKey {
        PersistentKey {
            flow: self.scheme.project(input.flow).into_owned(),
            id: input.id,
            discriminator: input.discriminator.map(Bytes::copy_from_slice),
        }
    }

    /// Resolve an interned flow.
    #[must_use]
    pub fn flow(&self, id: FlowId) -> Option<&FlowKey> { self.flows.get(id.0) }

    /// Resolve the full persistent identity behind a temporary key.
    #[must_use]
    pub fn persist(&self, key: &TempKey) -> Option<PersistentKey> {
        Some(PersistentKey {
            flow: self.flow(key.flow)?.clone(),
            id: key.id,
            discriminator: key.discriminator.clone(),
        })
    }

    /// Number of interned flows.
    #[must_use]
    pub fn flow_count(&self) -> usize { self.flows.len() }

    /// Forget every interned flow. Outstanding temporary keys become meaningless.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.flows.clear();
    }
}
