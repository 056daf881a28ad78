use ethereum_types::H160;
use std::fmt;
use std::net::IpAddr;
use std::ops::BitXor;

use anyhow::bail;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of bits in the identifier space. Matches SHA-1's output length.
pub const ID_BITS: usize = 160;
pub const ID_BYTES: usize = ID_BITS / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpcId(u64);

impl RpcId {
    pub fn new_random() -> Self {
        let val: u64 = rand::rng().random();
        Self(val)
    }
}

/// A 160-bit node identifier, totally ordered by unsigned magnitude. Keys
/// are hashed into the same space, so a `NodeId` doubles as a lookup target
/// for stored records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub H160);

impl NodeId {
    /// Draw an identifier uniformly from the full 2^160 space.
    pub fn new_random() -> Self {
        NodeId(H160::random())
    }

    pub fn zero() -> Self {
        NodeId(H160::zero())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(H160::from_slice(bytes))
    }

    /// The sole bridge from key space to identifier space: SHA-1 of the raw
    /// key bytes.
    pub fn from_key(key: &DhtKey) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        Self(H160::from_slice(&digest))
    }

    /// Bit `i` under the MSB-first convention: bit 0 is the most significant
    /// bit of byte 0. Indexing at or past `ID_BITS` is a caller bug.
    pub fn bit(&self, bit_index: usize) -> u8 {
        assert!(bit_index < ID_BITS, "bit index {bit_index} out of range");
        let bytes = self.0.as_bytes();
        let byte_index = bit_index / 8;
        let shift_amount = 7 - (bit_index % 8);
        (bytes[byte_index] >> shift_amount) & 1u8
    }

    /// Return a copy with bit `i` inverted. Used by the maintenance loop to
    /// derive one refresh target per bucket.
    pub fn flip_bit(&self, bit_index: usize) -> Self {
        assert!(bit_index < ID_BITS, "bit index {bit_index} out of range");
        let mut bytes: [u8; ID_BYTES] = *self.0.as_fixed_bytes();
        let byte_index = bit_index / 8;
        let shift_amount = 7 - (bit_index % 8);
        bytes[byte_index] ^= 1 << shift_amount;
        NodeId(H160::from(bytes))
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        Distance(self.0 ^ other.0)
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(ID_BYTES * 2);
        for byte in self.0.as_bytes() {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Parse the 40-character hex form produced by `to_hex`.
    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        if hex.len() != ID_BYTES * 2 {
            bail!("identifier hex must be {} chars, got {}", ID_BYTES * 2, hex.len());
        }
        let mut bytes = [0u8; ID_BYTES];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let hi = hex_digit(chunk[0])?;
            let lo = hex_digit(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(NodeId(H160::from(bytes)))
    }

    /// Return a short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }
}

fn hex_digit(c: u8) -> anyhow::Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => bail!("invalid hex digit {:?}", c as char),
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: Self) -> Self::Output {
        NodeId(self.0 ^ rhs.0)
    }
}

/// XOR distance between two identifiers, ordered by unsigned magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H160);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Index of the first 1-bit under the MSB-first convention, i.e. the
    /// common-prefix length of the two identifiers. `None` for zero distance.
    pub fn leading_bit(&self) -> Option<usize> {
        self.0
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, b)| **b != 0)
            .map(|(i, b)| i * 8 + b.leading_zeros() as usize)
    }
}

/// An opaque DHT key: any byte sequence, including the empty one. Records
/// are keyed by the raw bytes; the canonical string form is display-only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DhtKey(Vec<u8>);

impl DhtKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for DhtKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl fmt::Display for DhtKey {
    /// Raw characters when every byte is printable ASCII and the key is
    /// non-empty, else `0x` followed by lowercase hex. Not injective across
    /// the two branches, which is why storage never keys on this form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printable = !self.0.is_empty() && self.0.iter().all(|b| (0x20..=0x7e).contains(b));
        if printable {
            for b in &self.0 {
                write!(f, "{}", *b as char)?;
            }
        } else {
            write!(f, "0x")?;
            for b in &self.0 {
                write!(f, "{b:02x}")?;
            }
        }
        Ok(())
    }
}

/// The wire-visible descriptor of a peer: identifier plus transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(with = "serde_ipaddr")]
    pub ip_address: IpAddr,
    pub udp_port: u16,
    pub node_id: NodeId,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id.to_hex(), self.ip_address, self.udp_port)
    }
}

pub(crate) mod serde_ipaddr {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::IpAddr;

    pub fn serialize<S>(ip: &IpAddr, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&ip.to_string())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<IpAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
