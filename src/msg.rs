// Copyright 2024 The Opal Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire formats. Every message on a stream connection is a fixed-layout
//! command header followed by `size` opaque payload bytes. All multi-byte
//! scalars are little-endian; identifier bytes travel verbatim.

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use data_encoding::HEXLOWER;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::Error;

/// Width of every identifier on the wire.
pub const ID_SIZE: usize = 64;

/// Encoded size of a command header.
pub const CMD_HEADER_SIZE: usize = ID_SIZE + 8 + 8 + 4 + 4;

/// Encoded size of an IO attribute block.
pub const IO_ATTR_SIZE: usize = ID_SIZE * 2 + 4 + 8 + 8 + 4 + 4;

/// Bit 63 of the `trans` field marks a reply; the low 63 bits carry the
/// transaction number.
pub const TRANS_REPLY: u64 = 1 << 63;

/// Mask selecting the transaction number out of the `trans` field.
pub const TRANS_ID_MASK: u64 = !TRANS_REPLY;

bitflags! {
	/// Flag word of the command header. Bits above JOIN are reserved.
	pub struct CmdFlags: u32 {
		/// More replies for this transaction will follow.
		const MORE = 0b0001;
		/// Advisory: the recipient may tear the transaction down.
		const DESTROY = 0b0010;
		/// The sender wants a terminal ack even for an empty reply set.
		const NEED_ACK = 0b0100;
		/// Control: payload announces a storage participant (id + address).
		const JOIN = 0b1000;
	}
}

/// Errno-style status codes carried in reply headers. Zero is success,
/// failures are negative.
pub mod status {
	pub const OK: i32 = 0;
	pub const NOT_FOUND: i32 = -2;
	pub const IO: i32 = -5;
	pub const NO_MEM: i32 = -12;
	pub const EXIST: i32 = -17;
	pub const INVALID: i32 = -22;
	pub const FORWARD_FAILED: i32 = -32;
	pub const ABORTED: i32 = -103;
	pub const TIMEOUT: i32 = -110;
	pub const CANCELLED: i32 = -125;
}

/// Fixed-width identifier naming an object or a node. Both live in the same
/// space; a node owns the ids closest at or below its own. Ordering is
/// big-endian lexicographic on the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; ID_SIZE]);

impl ObjectId {
	pub fn new(bytes: [u8; ID_SIZE]) -> ObjectId {
		ObjectId(bytes)
	}

	/// The all-zero id, smallest in the identifier space.
	pub fn min() -> ObjectId {
		ObjectId([0u8; ID_SIZE])
	}

	pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		HEXLOWER.encode(&self.0)
	}

	pub fn from_hex(hex: &str) -> Result<ObjectId, Error> {
		let bytes = HEXLOWER
			.decode(hex.as_bytes())
			.map_err(|e| Error::Malformed(format!("bad id hex: {}", e)))?;
		if bytes.len() != ID_SIZE {
			return Err(Error::Malformed(format!(
				"bad id length {}, expected {}",
				bytes.len(),
				ID_SIZE
			)));
		}
		let mut id = [0u8; ID_SIZE];
		id.copy_from_slice(&bytes);
		Ok(ObjectId(id))
	}
}

impl fmt::Display for ObjectId {
	/// Prints the leading 6 bytes, enough to tell ids apart in a log line.
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", HEXLOWER.encode(&self.0[..6]))
	}
}

impl fmt::Debug for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ObjectId({})", self)
	}
}

impl Serialize for ObjectId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

struct ObjectIdVisitor;

impl<'de> Visitor<'de> for ObjectIdVisitor {
	type Value = ObjectId;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		formatter.write_str("a hex string of the full identifier width")
	}

	fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<ObjectId, E> {
		ObjectId::from_hex(value).map_err(|e| E::custom(format!("{}", e)))
	}
}

impl<'de> Deserialize<'de> for ObjectId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ObjectId, D::Error> {
		deserializer.deserialize_str(ObjectIdVisitor)
	}
}

/// Wire-visible command header framing every message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CmdHeader {
	/// Target object (or node) id the request routes by.
	pub id: ObjectId,
	/// Number of payload bytes following this header.
	pub size: u64,
	/// REPLY bit plus 63-bit transaction number.
	pub trans: u64,
	pub flags: CmdFlags,
	/// Errno-style completion status, zero for success.
	pub status: i32,
}

impl CmdHeader {
	pub fn new(id: ObjectId) -> CmdHeader {
		CmdHeader {
			id,
			size: 0,
			trans: 0,
			flags: CmdFlags::empty(),
			status: status::OK,
		}
	}

	pub fn is_reply(&self) -> bool {
		self.trans & TRANS_REPLY != 0
	}

	pub fn trans_id(&self) -> u64 {
		self.trans & TRANS_ID_MASK
	}

	pub fn encode(&self) -> [u8; CMD_HEADER_SIZE] {
		let mut buf = [0u8; CMD_HEADER_SIZE];
		{
			let mut wr = Cursor::new(&mut buf[..]);
			use std::io::Write;
			wr.write_all(&self.id.0).unwrap();
			wr.write_u64::<LittleEndian>(self.size).unwrap();
			wr.write_u64::<LittleEndian>(self.trans).unwrap();
			wr.write_u32::<LittleEndian>(self.flags.bits()).unwrap();
			wr.write_i32::<LittleEndian>(self.status).unwrap();
		}
		buf
	}

	/// Decodes a header, rejecting an advertised payload size above
	/// `max_size`. Field widths are validated here; semantic constraints
	/// are the caller's problem.
	pub fn decode(buf: &[u8], max_size: u64) -> Result<CmdHeader, Error> {
		if buf.len() < CMD_HEADER_SIZE {
			return Err(Error::Malformed(format!(
				"short command header: {} bytes",
				buf.len()
			)));
		}
		let mut id = [0u8; ID_SIZE];
		id.copy_from_slice(&buf[..ID_SIZE]);
		let mut rd = Cursor::new(&buf[ID_SIZE..]);
		let size = rd.read_u64::<LittleEndian>()?;
		let trans = rd.read_u64::<LittleEndian>()?;
		let flags = rd.read_u32::<LittleEndian>()?;
		let status = rd.read_i32::<LittleEndian>()?;
		if size > max_size {
			return Err(Error::Malformed(format!(
				"message size {} above cap {}",
				size, max_size
			)));
		}
		Ok(CmdHeader {
			id: ObjectId(id),
			size,
			trans,
			flags: CmdFlags::from_bits_truncate(flags),
			status,
		})
	}
}

/// IO attribute block prefixing read/write payloads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IoAttr {
	/// Linked-object id.
	pub parent: ObjectId,
	pub id: ObjectId,
	pub flags: u32,
	pub offset: u64,
	pub size: u64,
	pub attr_type: i32,
	pub num: i32,
}

impl IoAttr {
	pub fn encode(&self) -> [u8; IO_ATTR_SIZE] {
		let mut buf = [0u8; IO_ATTR_SIZE];
		{
			let mut wr = Cursor::new(&mut buf[..]);
			use std::io::Write;
			wr.write_all(&self.parent.0).unwrap();
			wr.write_all(&self.id.0).unwrap();
			wr.write_u32::<LittleEndian>(self.flags).unwrap();
			wr.write_u64::<LittleEndian>(self.offset).unwrap();
			wr.write_u64::<LittleEndian>(self.size).unwrap();
			wr.write_i32::<LittleEndian>(self.attr_type).unwrap();
			wr.write_i32::<LittleEndian>(self.num).unwrap();
		}
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<IoAttr, Error> {
		if buf.len() < IO_ATTR_SIZE {
			return Err(Error::Malformed(format!(
				"short io attribute: {} bytes",
				buf.len()
			)));
		}
		let mut parent = [0u8; ID_SIZE];
		parent.copy_from_slice(&buf[..ID_SIZE]);
		let mut id = [0u8; ID_SIZE];
		id.copy_from_slice(&buf[ID_SIZE..ID_SIZE * 2]);
		let mut rd = Cursor::new(&buf[ID_SIZE * 2..]);
		Ok(IoAttr {
			parent: ObjectId(parent),
			id: ObjectId(id),
			flags: rd.read_u32::<LittleEndian>()?,
			offset: rd.read_u64::<LittleEndian>()?,
			size: rd.read_u64::<LittleEndian>()?,
			attr_type: rd.read_i32::<LittleEndian>()?,
			num: rd.read_i32::<LittleEndian>()?,
		})
	}
}

/// Handshake payload: the sender's advertised id and address. Exchanged
/// before anything routes through a connection, and re-sent with the JOIN
/// flag when the sender becomes a storage participant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hello {
	pub id: ObjectId,
	pub addr: SocketAddr,
}

impl Hello {
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(ID_SIZE + 19);
		buf.extend_from_slice(&self.id.0);
		match self.addr.ip() {
			IpAddr::V4(ip) => {
				buf.push(4);
				buf.extend_from_slice(&ip.octets());
			}
			IpAddr::V6(ip) => {
				buf.push(6);
				buf.extend_from_slice(&ip.octets());
			}
		}
		buf.write_u16::<LittleEndian>(self.addr.port()).unwrap();
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Hello, Error> {
		if buf.len() < ID_SIZE + 1 + 4 + 2 {
			return Err(Error::Malformed(format!("short hello: {} bytes", buf.len())));
		}
		let mut id = [0u8; ID_SIZE];
		id.copy_from_slice(&buf[..ID_SIZE]);
		let rest = &buf[ID_SIZE..];
		let (ip, port_off): (IpAddr, usize) = match rest[0] {
			4 => {
				let mut octets = [0u8; 4];
				octets.copy_from_slice(&rest[1..5]);
				(IpAddr::V4(Ipv4Addr::from(octets)), 5)
			}
			6 => {
				if rest.len() < 1 + 16 + 2 {
					return Err(Error::Malformed("short v6 hello".to_owned()));
				}
				let mut octets = [0u8; 16];
				octets.copy_from_slice(&rest[1..17]);
				(IpAddr::V6(Ipv6Addr::from(octets)), 17)
			}
			tag => {
				return Err(Error::Malformed(format!("bad hello address tag {}", tag)));
			}
		};
		let mut rd = Cursor::new(&rest[port_off..]);
		let port = rd.read_u16::<LittleEndian>()?;
		Ok(Hello {
			id: ObjectId(id),
			addr: SocketAddr::new(ip, port),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_id(last: u8) -> ObjectId {
		let mut b = [0u8; ID_SIZE];
		b[ID_SIZE - 1] = last;
		ObjectId::new(b)
	}

	#[test]
	fn cmd_header_roundtrip() {
		let cmd = CmdHeader {
			id: test_id(0x42),
			size: 4096,
			trans: TRANS_REPLY | 77,
			flags: CmdFlags::MORE | CmdFlags::NEED_ACK,
			status: status::NOT_FOUND,
		};
		let buf = cmd.encode();
		let back = CmdHeader::decode(&buf, u64::max_value()).unwrap();
		assert_eq!(cmd, back);
		assert!(back.is_reply());
		assert_eq!(back.trans_id(), 77);
	}

	#[test]
	fn cmd_header_size_bounds() {
		let cap = 1024;
		for size in &[0u64, cap] {
			let mut cmd = CmdHeader::new(test_id(1));
			cmd.size = *size;
			let back = CmdHeader::decode(&cmd.encode(), cap).unwrap();
			assert_eq!(back.size, *size);
		}
		let mut cmd = CmdHeader::new(test_id(1));
		cmd.size = cap + 1;
		match CmdHeader::decode(&cmd.encode(), cap) {
			Err(Error::Malformed(_)) => {}
			other => panic!("expected Malformed, got {:?}", other.map(|c| c.size)),
		}
	}

	#[test]
	fn cmd_header_short_buffer() {
		let cmd = CmdHeader::new(test_id(9));
		let buf = cmd.encode();
		assert!(CmdHeader::decode(&buf[..CMD_HEADER_SIZE - 1], 1024).is_err());
	}

	#[test]
	fn io_attr_roundtrip() {
		let io = IoAttr {
			parent: test_id(1),
			id: test_id(2),
			flags: 0xdead,
			offset: 1 << 40,
			size: 12345,
			attr_type: -3,
			num: 7,
		};
		assert_eq!(io, IoAttr::decode(&io.encode()).unwrap());
	}

	#[test]
	fn hello_roundtrip() {
		let hello = Hello {
			id: test_id(0xaa),
			addr: "127.0.0.1:1025".parse().unwrap(),
		};
		assert_eq!(hello, Hello::decode(&hello.encode()).unwrap());

		let hello6 = Hello {
			id: test_id(0xbb),
			addr: "[::1]:4000".parse().unwrap(),
		};
		assert_eq!(hello6, Hello::decode(&hello6.encode()).unwrap());
	}

	#[test]
	fn id_ordering_is_lexicographic() {
		let mut hi = [0u8; ID_SIZE];
		hi[0] = 1;
		let hi = ObjectId::new(hi);
		let lo = test_id(0xff);
		assert!(lo < hi, "leading byte dominates the comparison");
	}

	#[test]
	fn id_hex_roundtrip() {
		let id = test_id(0x2f);
		assert_eq!(id, ObjectId::from_hex(&id.to_hex()).unwrap());
		assert!(ObjectId::from_hex("abcd").is_err());
	}
}
