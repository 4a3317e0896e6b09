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

//! In-flight transactions and their registry, plus the dispatch of one
//! inbound message: replies are correlated back to their transaction,
//! requests are handled locally or re-issued toward the owning peer on
//! behalf of the sender.
//!
//! The registry is the sole strong owner of a transaction between insert
//! and remove; peers reach transactions only through the index. Every
//! transaction leaves the registry exactly once, so its terminal
//! completion fires exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::conn;
use crate::handshake;
use crate::msg::{status, CmdFlags, CmdHeader, Hello, CMD_HEADER_SIZE, TRANS_ID_MASK, TRANS_REPLY};
use crate::node::NodeInner;
use crate::peer::{JoinState, Peer};
use crate::route::Route;
use crate::types::Error;

/// Caller-supplied callback invoked once per received reply chunk, and
/// once more with a synthetic terminal header on cancel or abort. Runs
/// with no crate lock held.
pub type Completion = Box<dyn Fn(&CmdHeader, &[u8]) + Send + Sync>;

/// An in-flight request/reply pair. Client-issued transactions carry a
/// completion; forwarded ones remember the upstream transaction number
/// instead and relay replies back to the origin peer.
pub struct Transaction {
	trans_id: u64,
	/// Transaction number assigned by the upstream peer, set only when this
	/// transaction forwards a request on its behalf.
	recv_trans: Option<u64>,
	/// Peer this transaction keeps alive: the reply target. `None` for
	/// requests that resolved to the local node.
	peer: Option<Arc<Peer>>,
	/// Last observed command header.
	cmd: Mutex<CmdHeader>,
	/// Request payload on creation, replaced by each reply body.
	data: Mutex<Vec<u8>>,
	completion: Option<Completion>,
	/// Registry membership flag, cleared exactly once.
	in_tree: AtomicBool,
}

impl Transaction {
	pub fn trans_id(&self) -> u64 {
		self.trans_id
	}

	pub fn recv_trans(&self) -> Option<u64> {
		self.recv_trans
	}

	pub fn peer(&self) -> Option<&Arc<Peer>> {
		self.peer.as_ref()
	}

	pub fn cmd(&self) -> CmdHeader {
		*self.cmd.lock()
	}

	pub fn in_tree(&self) -> bool {
		self.in_tree.load(Ordering::Relaxed)
	}

	pub(crate) fn data_guard(&self) -> MutexGuard<'_, Vec<u8>> {
		self.data.lock()
	}

	/// Delivers one reply chunk: records it, then invokes the completion
	/// or relays the packet to the origin peer of a forwarded request.
	pub(crate) fn deliver(&self, cmd: &CmdHeader, data: Vec<u8>) {
		let mut out = *cmd;
		out.size = data.len() as u64;
		if let Some(recv_trans) = self.recv_trans {
			out.trans = recv_trans | TRANS_REPLY;
		}
		*self.cmd.lock() = out;

		if let Some(cb) = &self.completion {
			cb(&out, &data);
		} else if let (Some(peer), Some(_)) = (&self.peer, self.recv_trans) {
			if let Err(e) = conn::send_msg(peer, &out, &data) {
				debug!(
					"failed to relay reply {} to {}: {}",
					out.trans_id(),
					peer.addr(),
					e
				);
			}
		}
		*self.data.lock() = data;
	}

	/// Synthesizes the terminal completion used by cancel, abort and
	/// shutdown: given status, DESTROY set, MORE cleared, empty payload.
	/// The caller must have removed the transaction from the registry.
	pub(crate) fn finalize(&self, status: i32) {
		let mut out = *self.cmd.lock();
		out.trans = self.trans_id | TRANS_REPLY;
		out.status = status;
		out.flags.remove(CmdFlags::MORE);
		out.flags.insert(CmdFlags::DESTROY);
		self.deliver(&out, Vec::new());
	}
}

/// Everything needed to build a transaction; the registry assigns the id.
pub(crate) struct PendingTrans {
	pub cmd: CmdHeader,
	pub data: Vec<u8>,
	pub peer: Option<Arc<Peer>>,
	pub recv_trans: Option<u64>,
	pub completion: Option<Completion>,
}

struct RegistryInner {
	/// Next transaction number to hand out; 63-bit, never reused within a
	/// process run.
	next: u64,
	index: HashMap<u64, Arc<Transaction>>,
}

/// Per-node set of in-flight transactions keyed by their 63-bit number.
pub struct TransRegistry {
	inner: Mutex<RegistryInner>,
}

impl TransRegistry {
	pub fn new() -> TransRegistry {
		TransRegistry {
			inner: Mutex::new(RegistryInner {
				next: 0,
				index: HashMap::new(),
			}),
		}
	}

	/// Assigns the next transaction number and links the transaction into
	/// the index. Exhausting the 63-bit counter would risk collision with
	/// a live transaction, so it aborts instead.
	pub(crate) fn insert(&self, pending: PendingTrans) -> Result<Arc<Transaction>, Error> {
		let mut inner = self.inner.lock();
		assert!(
			inner.next & TRANS_REPLY == 0,
			"transaction counter exhausted"
		);
		let id = inner.next & TRANS_ID_MASK;
		inner.next += 1;

		let mut cmd = pending.cmd;
		cmd.trans = id;
		let t = Arc::new(Transaction {
			trans_id: id,
			recv_trans: pending.recv_trans,
			peer: pending.peer,
			cmd: Mutex::new(cmd),
			data: Mutex::new(pending.data),
			completion: pending.completion,
			in_tree: AtomicBool::new(true),
		});
		if inner.index.insert(id, t.clone()).is_some() {
			return Err(Error::Duplicate);
		}
		Ok(t)
	}

	pub fn find(&self, id: u64) -> Option<Arc<Transaction>> {
		self.inner.lock().index.get(&id).cloned()
	}

	/// Removes and returns the transaction, if still indexed.
	pub(crate) fn take(&self, id: u64) -> Option<Arc<Transaction>> {
		let t = self.inner.lock().index.remove(&id);
		if let Some(ref t) = t {
			t.in_tree.store(false, Ordering::Relaxed);
		}
		t
	}

	/// Looks a reply's transaction up; terminal replies (MORE clear) also
	/// remove it under the same lock hold.
	pub(crate) fn take_reply(&self, id: u64, more: bool) -> Option<Arc<Transaction>> {
		let mut inner = self.inner.lock();
		if more {
			inner.index.get(&id).cloned()
		} else {
			let t = inner.index.remove(&id);
			if let Some(ref t) = t {
				t.in_tree.store(false, Ordering::Relaxed);
			}
			t
		}
	}

	/// Idempotent removal.
	pub(crate) fn remove(&self, t: &Arc<Transaction>) {
		if t.in_tree.swap(false, Ordering::Relaxed) {
			self.inner.lock().index.remove(&t.trans_id);
		}
	}

	/// Removes every transaction whose reply path runs through `peer`.
	pub(crate) fn take_for_peer(&self, peer: &Arc<Peer>) -> Vec<Arc<Transaction>> {
		let mut inner = self.inner.lock();
		let ids: Vec<u64> = inner
			.index
			.iter()
			.filter(|(_, t)| match t.peer {
				Some(ref p) => Arc::ptr_eq(p, peer),
				None => false,
			})
			.map(|(id, _)| *id)
			.collect();
		ids.iter()
			.filter_map(|id| {
				let t = inner.index.remove(id);
				if let Some(ref t) = t {
					t.in_tree.store(false, Ordering::Relaxed);
				}
				t
			})
			.collect()
	}

	/// Drains the whole registry, used on node shutdown.
	pub(crate) fn take_all(&self) -> Vec<Arc<Transaction>> {
		let mut inner = self.inner.lock();
		inner
			.index
			.drain()
			.map(|(_, t)| {
				t.in_tree.store(false, Ordering::Relaxed);
				t
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().index.len()
	}
}

/// Reads and dispatches one message from the peer: hello and join control
/// first, then replies by transaction lookup, then requests by routing.
pub(crate) fn process_one(node: &Arc<NodeInner>, peer: &Arc<Peer>) -> Result<(), Error> {
	let mut hdr = [0u8; CMD_HEADER_SIZE];
	conn::recv_all(peer, &mut hdr)?;
	let cmd = CmdHeader::decode(&hdr, node.config.max_msg_size())?;

	trace!(
		"{}: size {}, trans {}, reply {}, flags {:?}, status {}",
		cmd.id,
		cmd.size,
		cmd.trans_id(),
		cmd.is_reply(),
		cmd.flags,
		cmd.status
	);

	// the first message on a not-yet-identified connection is the hello
	if peer.id().is_none() {
		return handle_hello(node, peer, &cmd);
	}
	if !cmd.is_reply() && cmd.flags.contains(CmdFlags::JOIN) {
		return handle_join(node, peer, &cmd);
	}
	if cmd.is_reply() {
		return handle_reply(node, peer, &cmd);
	}
	handle_request(node, peer, cmd)
}

fn read_body(peer: &Peer, size: u64) -> Result<Vec<u8>, Error> {
	let mut data = vec![0u8; size as usize];
	if size > 0 {
		conn::recv_all(peer, &mut data)?;
	}
	Ok(data)
}

fn handle_hello(node: &Arc<NodeInner>, peer: &Arc<Peer>, cmd: &CmdHeader) -> Result<(), Error> {
	if cmd.is_reply() {
		return Err(Error::Malformed(
			"reply before the connection was identified".to_owned(),
		));
	}
	let payload = read_body(peer, cmd.size)?;
	let hello = Hello::decode(&payload)?;

	if hello.id == node.id {
		debug!("rejecting hello carrying our own id from {}", peer.addr());
		return Err(Error::Duplicate);
	}

	let mut addr = hello.addr;
	if addr.ip().is_unspecified() {
		// the peer advertised a wildcard bind address; what we can dial is
		// the ip it connected from
		addr.set_ip(peer.addr().ip());
	}

	// a reconnecting peer may identify before its dead connection has been
	// reaped; the fresh connection wins
	if let Some(old) = node.route.find(&hello.id) {
		if !Arc::ptr_eq(&old, peer) {
			debug!("replacing stale route entry for {}", hello.id);
			node.release_peer(&old);
		}
	}

	peer.set_id(hello.id);
	peer.set_addr(addr);
	node.unkeyed.lock().retain(|p| !Arc::ptr_eq(p, peer));
	node.route.insert(peer.clone())?;

	// answer so the dialing side can finish its handshake
	let (hcmd, hpayload) = handshake::hello_msg(&node.local_hello());
	conn::send_msg(peer, &hcmd, &hpayload)?;

	info!("peer {} identified as {}", peer.addr(), hello.id);

	if cmd.flags.contains(CmdFlags::JOIN) {
		peer.set_join_state(JoinState::Joined);
	}
	Ok(())
}

fn handle_join(_node: &Arc<NodeInner>, peer: &Arc<Peer>, cmd: &CmdHeader) -> Result<(), Error> {
	let payload = read_body(peer, cmd.size)?;
	let hello = Hello::decode(&payload)?;

	match peer.id() {
		Some(id) if id != hello.id => {
			return Err(Error::Malformed(format!(
				"join announcement id {} does not match peer id {}",
				hello.id, id
			)));
		}
		_ => {}
	}

	let mut addr = hello.addr;
	if addr.ip().is_unspecified() {
		addr.set_ip(peer.addr().ip());
	}
	peer.set_addr(addr);
	peer.set_join_state(JoinState::Joined);
	info!("peer {} ({}) joined the mesh", addr, hello.id);

	if cmd.flags.contains(CmdFlags::NEED_ACK) {
		let mut ack = CmdHeader::new(cmd.id);
		ack.trans = cmd.trans | TRANS_REPLY;
		ack.status = status::OK;
		conn::send_msg(peer, &ack, &[])?;
	}
	Ok(())
}

fn handle_reply(node: &Arc<NodeInner>, peer: &Arc<Peer>, cmd: &CmdHeader) -> Result<(), Error> {
	let tid = cmd.trans_id();
	let more = cmd.flags.contains(CmdFlags::MORE);

	let t = node.trans.take_reply(tid, more);
	let t = match t {
		Some(t) => t,
		None => {
			// stale reply, e.g. for a cancelled transaction
			conn::drain(peer, cmd.size)?;
			debug!(
				"{}: no transaction for reply {}, dropping {} bytes",
				cmd.id, tid, cmd.size
			);
			return Ok(());
		}
	};

	let data = match read_body(peer, cmd.size) {
		Ok(data) => data,
		Err(e) => {
			// the stream is broken mid-frame; the transaction dies with it
			node.trans.remove(&t);
			return Err(e);
		}
	};

	t.deliver(cmd, data);
	Ok(())
}

fn handle_request(node: &Arc<NodeInner>, peer: &Arc<Peer>, cmd: CmdHeader) -> Result<(), Error> {
	let target = match node.route.lookup(&cmd.id) {
		// a request routed back to its source is ours to execute
		Route::Peer(ref p) if Arc::ptr_eq(p, peer) => Route::Local,
		other => other,
	};

	let data = read_body(peer, cmd.size)?;

	match target {
		Route::Local => local_process(node, peer, &cmd, &data),
		Route::Peer(target) => forward(node, peer, target, cmd, data),
	}
}

/// Executes a request against the local handler and streams its replies
/// back, MORE set on all but the last. Handler failures turn into a
/// terminal reply carrying the mapped status.
fn local_process(
	node: &Arc<NodeInner>,
	peer: &Arc<Peer>,
	cmd: &CmdHeader,
	data: &[u8],
) -> Result<(), Error> {
	let replies = match node.handler.handle(cmd, data) {
		Ok(replies) => replies,
		Err(e) => {
			warn!("{}: local handler failed: {}", cmd.id, e);
			return send_reply(peer, cmd, e.to_status(), &[], false);
		}
	};

	if replies.is_empty() {
		if cmd.flags.contains(CmdFlags::NEED_ACK) {
			return send_reply(peer, cmd, status::OK, &[], false);
		}
		return Ok(());
	}

	let last = replies.len() - 1;
	for (i, reply) in replies.iter().enumerate() {
		send_reply(peer, cmd, reply.status, &reply.data, i < last)?;
	}
	Ok(())
}

fn send_reply(
	peer: &Peer,
	req: &CmdHeader,
	status: i32,
	data: &[u8],
	more: bool,
) -> Result<(), Error> {
	let mut out = CmdHeader::new(req.id);
	out.size = data.len() as u64;
	out.trans = req.trans | TRANS_REPLY;
	if more {
		out.flags.insert(CmdFlags::MORE);
	}
	out.status = status;
	conn::send_msg(peer, &out, data)
}

/// Re-issues a request toward the peer that owns its id, remembering the
/// upstream transaction number for the reply path. The source peer is kept
/// alive by the forwarding transaction until the terminal reply.
fn forward(
	node: &Arc<NodeInner>,
	source: &Arc<Peer>,
	target: Arc<Peer>,
	cmd: CmdHeader,
	data: Vec<u8>,
) -> Result<(), Error> {
	let recv_trans = cmd.trans;
	let t = node.trans.insert(PendingTrans {
		cmd,
		data,
		peer: Some(source.clone()),
		recv_trans: Some(recv_trans),
		completion: None,
	})?;

	let mut wire = cmd;
	wire.trans = t.trans_id();

	let sent = {
		let body = t.data_guard();
		conn::send_msg(&target, &wire, &body)
	};

	match sent {
		Ok(()) => {
			debug!(
				"{}: forwarded to {} ({}), trans {} for upstream {}",
				cmd.id,
				target.id().map(|id| id.to_string()).unwrap_or_default(),
				target.addr(),
				t.trans_id(),
				recv_trans & TRANS_ID_MASK
			);
			Ok(())
		}
		Err(e) => {
			debug!(
				"{}: forward to {} failed: {}",
				cmd.id,
				target.addr(),
				e
			);
			node.trans.remove(&t);
			// tell the origin; the request will not be answered otherwise
			if let Err(e) = send_reply(source, &cmd, status::FORWARD_FAILED, &[], false) {
				debug!("failed to report forward failure: {}", e);
			}
			Ok(())
		}
	}
}
