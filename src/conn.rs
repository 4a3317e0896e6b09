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

//! Framed I/O over a nonblocking peer socket, and the per-peer worker
//! thread that drives the receive side.
//!
//! Every wait is bounded by the peer's configured timeout: nonblocking
//! attempts are retried with a short sleep in between so the node-wide
//! stop flag is observed within one interval. Any transferred byte counts
//! as progress and resets the deadline; a deadline with zero progress is a
//! timeout. Partial transfers are tracked with an explicit buffer/offset
//! cursor and hard errors after partial progress terminate the operation.

use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::msg::CmdHeader;
use crate::node::NodeInner;
use crate::peer::{JoinState, Peer};
use crate::trans;
use crate::types::Error;

// Sleep between nonblocking attempts, to avoid the heavy polling which
// would consume CPU 100%.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause between failed reconnect attempts of a participant peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Waits until the peer's socket has bytes to read. An idle deadline
/// returns `Timeout`; the caller decides whether that is an error.
pub fn wait_readable(peer: &Peer) -> Result<(), Error> {
	let deadline = Instant::now() + peer.timeout();
	let mut byte = [0u8; 1];
	loop {
		if peer.should_exit() {
			return Err(Error::Shutdown);
		}
		let res = peer.conn_read().peek(&mut byte);
		match res {
			Ok(0) => return Err(Error::Disconnect),
			Ok(_) => return Ok(()),
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
				if Instant::now() >= deadline {
					return Err(Error::Timeout);
				}
				thread::sleep(POLL_INTERVAL);
			}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
			Err(e) => return Err(Error::Connection(e)),
		}
	}
}

/// Reads exactly `buf.len()` bytes from the peer.
pub fn recv_all(peer: &Peer, buf: &mut [u8]) -> Result<(), Error> {
	let mut offset = 0;
	let mut deadline = Instant::now() + peer.timeout();
	while offset < buf.len() {
		if peer.should_exit() {
			return Err(Error::Shutdown);
		}
		let res = {
			let conn = peer.conn_read();
			(&*conn).read(&mut buf[offset..])
		};
		match res {
			Ok(0) => return Err(Error::Disconnect),
			Ok(n) => {
				offset += n;
				deadline = Instant::now() + peer.timeout();
			}
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
				if Instant::now() >= deadline {
					return Err(Error::Timeout);
				}
				thread::sleep(POLL_INTERVAL);
			}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
			Err(e) => return Err(Error::Connection(e)),
		}
	}
	Ok(())
}

/// Writes the whole buffer to the peer, holding its send lock so no other
/// sender can interleave bytes.
pub fn send_all(peer: &Peer, buf: &[u8]) -> Result<(), Error> {
	let _guard = peer.send_guard();
	send_all_locked(peer, buf)
}

/// Sends a header and its body as one atomic sequence on the peer.
pub fn send_msg(peer: &Peer, cmd: &CmdHeader, body: &[u8]) -> Result<(), Error> {
	let _guard = peer.send_guard();
	send_all_locked(peer, &cmd.encode())?;
	if !body.is_empty() {
		send_all_locked(peer, body)?;
	}
	Ok(())
}

/// Sends a header followed by exactly `size` bytes taken from `file` at
/// `offset`. A file shorter than `size` is padded with zeros so the
/// receiver can rely on the advertised length; the padding is logged but
/// is not an error.
pub fn send_file(
	peer: &Peer,
	cmd: &CmdHeader,
	file: &mut File,
	offset: u64,
	size: u64,
) -> Result<(), Error> {
	let _guard = peer.send_guard();
	send_all_locked(peer, &cmd.encode())?;

	file.seek(SeekFrom::Start(offset))?;
	let mut remaining = size;
	let mut buf = [0u8; 4096];
	while remaining > 0 {
		let want = cmp::min(remaining, buf.len() as u64) as usize;
		let n = file.read(&mut buf[..want])?;
		if n == 0 {
			break;
		}
		send_all_locked(peer, &buf[..n])?;
		remaining -= n as u64;
	}

	if remaining > 0 {
		debug!(
			"short file for {}: padding {} of {} bytes with zeros",
			peer.addr(),
			remaining,
			size
		);
		let zeros = [0u8; 4096];
		while remaining > 0 {
			let n = cmp::min(remaining, zeros.len() as u64) as usize;
			send_all_locked(peer, &zeros[..n])?;
			remaining -= n as u64;
		}
	}
	Ok(())
}

/// Reads and discards `size` bytes, used when a reply has no transaction
/// left to deliver to.
pub(crate) fn drain(peer: &Peer, size: u64) -> Result<(), Error> {
	let mut buf = [0u8; 4096];
	let mut left = size;
	while left > 0 {
		let want = cmp::min(left, buf.len() as u64) as usize;
		recv_all(peer, &mut buf[..want])?;
		left -= want as u64;
	}
	Ok(())
}

fn send_all_locked(peer: &Peer, buf: &[u8]) -> Result<(), Error> {
	let mut offset = 0;
	let mut deadline = Instant::now() + peer.timeout();
	while offset < buf.len() {
		if peer.should_exit() {
			return Err(Error::Shutdown);
		}
		let res = {
			let conn = peer.conn_read();
			(&*conn).write(&buf[offset..])
		};
		match res {
			Ok(0) => return Err(Error::Disconnect),
			Ok(n) => {
				offset += n;
				deadline = Instant::now() + peer.timeout();
			}
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
				if Instant::now() >= deadline {
					return Err(Error::Timeout);
				}
				thread::sleep(POLL_INTERVAL);
			}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
			Err(e) => return Err(Error::Connection(e)),
		}
	}
	Ok(())
}

/// Spawns the peer's dedicated receive worker.
pub(crate) fn spawn_worker(
	node: Arc<NodeInner>,
	peer: Arc<Peer>,
) -> io::Result<JoinHandle<()>> {
	thread::Builder::new()
		.name("peer_read".to_string())
		.spawn(move || run_worker(node, peer))
}

fn run_worker(node: Arc<NodeInner>, peer: Arc<Peer>) {
	loop {
		if node.stop.is_stopped() || peer.is_stopped() {
			break;
		}

		// Messages from a single peer are processed one by one on this
		// thread; one peer cannot get more than a single thread of the node.
		match wait_readable(&peer) {
			Ok(()) => {}
			// idle connection, nothing arrived within the poll bound
			Err(Error::Timeout) => continue,
			Err(Error::Shutdown) => break,
			Err(e) => {
				if !recover(&node, &peer, &e) {
					break;
				}
				continue;
			}
		}

		match trans::process_one(&node, &peer) {
			Ok(()) => peer.touch(),
			Err(Error::Shutdown) => break,
			Err(e) => {
				if !recover(&node, &peer, &e) {
					break;
				}
			}
		}
	}

	debug!(
		"stopped processing peer {}, refs {}",
		peer.addr(),
		Arc::strong_count(&peer)
	);
	node.release_peer(&peer);
}

/// Handles a connection-level failure. Pending transactions on the peer
/// are aborted right away; participants then get their socket re-dialed,
/// clients are done. Returns whether the worker should keep looping.
fn recover(node: &Arc<NodeInner>, peer: &Arc<Peer>, err: &Error) -> bool {
	debug!("peer {} processing error: {}", peer.addr(), err);

	// not queued across reconnect: whoever was waiting learns now
	node.abort_peer_trans(peer);

	if let Error::Malformed(_) = err {
		// framing is gone, nothing sensible can follow on this connection
		return false;
	}
	if peer.join_state() == JoinState::Client || peer.should_exit() {
		return false;
	}

	match peer.reconnect(&node.local_hello()) {
		Ok(()) => {
			node.announce_rejoin(peer);
			true
		}
		Err(e) => {
			debug!("reconnect to {} failed: {}", peer.addr(), e);
			sleep_interruptible(peer, RECONNECT_DELAY);
			!peer.should_exit()
		}
	}
}

fn sleep_interruptible(peer: &Peer, dur: Duration) {
	let deadline = Instant::now() + dur;
	while Instant::now() < deadline {
		if peer.should_exit() {
			return;
		}
		thread::sleep(Duration::from_millis(50));
	}
}
