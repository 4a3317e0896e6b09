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

//! Hello exchange on a freshly-dialed socket. The dialer speaks first; the
//! accepting side answers through its worker once the first message arrives.
//! Nothing routes through a connection until both ids are known.
//!
//! The exchange runs on the still-blocking socket with short read/write
//! timeouts; the stream is switched to nonblocking afterwards, when the
//! peer record takes ownership.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::msg::{CmdHeader, Hello, CMD_HEADER_SIZE};
use crate::types::Error;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_millis(5000);
const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Largest hello payload we accept; anything bigger is not a handshake.
const HELLO_MAX_SIZE: u64 = 256;

/// Builds the wire form of a hello: a command header with a zero
/// transaction and the advertised id + address as payload.
pub fn hello_msg(local: &Hello) -> (CmdHeader, Vec<u8>) {
	let payload = local.encode();
	let mut cmd = CmdHeader::new(local.id);
	cmd.size = payload.len() as u64;
	(cmd, payload)
}

/// Dialer side: sends our hello and reads the remote's answer.
pub fn initiate(stream: &TcpStream, local: &Hello) -> Result<Hello, Error> {
	stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT))?;
	stream.set_write_timeout(Some(HANDSHAKE_WRITE_TIMEOUT))?;

	let (cmd, payload) = hello_msg(local);
	let mut wr = stream;
	wr.write_all(&cmd.encode())?;
	wr.write_all(&payload)?;

	let remote = read_hello(stream)?;
	trace!("handshake with {}: remote id {}", remote.addr, remote.id);
	Ok(remote)
}

fn read_hello(stream: &TcpStream) -> Result<Hello, Error> {
	let mut rd = stream;
	let mut hdr = [0u8; CMD_HEADER_SIZE];
	rd.read_exact(&mut hdr).map_err(map_timeout)?;
	let cmd = CmdHeader::decode(&hdr, HELLO_MAX_SIZE)?;
	if cmd.is_reply() {
		return Err(Error::Malformed("reply header during handshake".to_owned()));
	}
	let mut payload = vec![0u8; cmd.size as usize];
	rd.read_exact(&mut payload).map_err(map_timeout)?;
	Hello::decode(&payload)
}

fn map_timeout(e: std::io::Error) -> Error {
	match e.kind() {
		std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
		std::io::ErrorKind::UnexpectedEof => Error::Disconnect,
		_ => Error::Connection(e),
	}
}
