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

//! The node: owns the routing table, the transaction registry, the peer
//! workers and the listener, and exposes the client operations — add and
//! remove peers, join the mesh, issue and cancel transactions.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel;
use parking_lot::{Mutex, RwLock};

use crate::conn;
use crate::handshake::{self, CONNECT_TIMEOUT};
use crate::msg::{status, CmdFlags, CmdHeader, Hello, ObjectId, TRANS_REPLY};
use crate::peer::{JoinState, Peer};
use crate::route::{Route, RouteTable};
use crate::trans::{Completion, PendingTrans, TransRegistry};
use crate::types::{Error, NetConfig, Reply, RequestHandler, StopState};

/// Shared node state handed to every peer worker.
pub struct NodeInner {
	pub config: NetConfig,
	/// This node's id; the routing table carries it as the self-entry.
	pub id: ObjectId,
	pub route: RouteTable,
	pub trans: TransRegistry,
	/// Accepted connections that have not identified themselves yet.
	pub unkeyed: Mutex<Vec<Arc<Peer>>>,
	pub stop: Arc<StopState>,
	pub handler: Arc<dyn RequestHandler>,
	listen_addr: RwLock<Option<SocketAddr>>,
}

impl NodeInner {
	/// The hello this node advertises: its id and reachable address.
	pub fn local_hello(&self) -> Hello {
		let addr = self
			.listen_addr
			.read()
			.unwrap_or_else(|| SocketAddr::new(self.config.host, self.config.port));
		Hello { id: self.id, addr }
	}

	/// Aborts every transaction whose reply path runs through the peer.
	/// Each gets exactly one terminal completion with status ABORTED.
	pub(crate) fn abort_peer_trans(&self, peer: &Arc<Peer>) {
		let aborted = self.trans.take_for_peer(peer);
		if !aborted.is_empty() {
			debug!(
				"aborting {} transactions pointing at {}",
				aborted.len(),
				peer.addr()
			);
		}
		for t in aborted {
			t.finalize(status::ABORTED);
		}
	}

	/// Detaches a peer from the node: flags it stopped, pulls it out of
	/// the tables and aborts its transactions. The worker thread drops the
	/// last reference on its way out.
	pub(crate) fn release_peer(&self, peer: &Arc<Peer>) {
		peer.stop();
		self.route.remove(peer);
		self.unkeyed.lock().retain(|p| !Arc::ptr_eq(p, peer));
		self.abort_peer_trans(peer);
	}

	/// Re-announces this node on a freshly reconnected participant link,
	/// completing the Rejoin transition.
	pub(crate) fn announce_rejoin(&self, peer: &Arc<Peer>) {
		let hello = self.local_hello();
		let payload = hello.encode();
		let mut cmd = CmdHeader::new(hello.id);
		cmd.flags = CmdFlags::JOIN;
		cmd.size = payload.len() as u64;
		match conn::send_msg(peer, &cmd, &payload) {
			Ok(()) => {
				peer.set_join_state(JoinState::Joined);
				info!("re-announced to {} after reconnect", peer.addr());
			}
			Err(e) => debug!("failed to re-announce to {}: {}", peer.addr(), e),
		}
	}
}

/// A transport node. Dropping it performs the full ordered shutdown.
pub struct Node {
	inner: Arc<NodeInner>,
	accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
	/// Builds the tables and, when configured to listen, binds the
	/// listener and spawns the accept loop.
	pub fn new(config: NetConfig, handler: Arc<dyn RequestHandler>) -> Result<Node, Error> {
		let id = config.id;
		let inner = Arc::new(NodeInner {
			id,
			route: RouteTable::new(id),
			trans: TransRegistry::new(),
			unkeyed: Mutex::new(Vec::new()),
			stop: Arc::new(StopState::new()),
			handler,
			listen_addr: RwLock::new(None),
			config,
		});

		let mut accept_thread = None;
		if inner.config.listen() {
			let bind = SocketAddr::new(inner.config.host, inner.config.port);
			let listener = TcpListener::bind(bind)?;
			listener.set_nonblocking(true)?;
			let local = listener.local_addr()?;
			*inner.listen_addr.write() = Some(local);
			info!("node {} listening at {}", id, local);

			let accept_inner = inner.clone();
			let handle = thread::Builder::new()
				.name("node_accept".to_string())
				.spawn(move || accept_loop(accept_inner, listener))
				.map_err(|e| Error::Resource(format!("failed to spawn accept loop: {}", e)))?;
			accept_thread = Some(handle);
		}

		Ok(Node {
			inner,
			accept_thread: Mutex::new(accept_thread),
		})
	}

	pub fn id(&self) -> ObjectId {
		self.inner.id
	}

	/// Address the listener actually bound, if any.
	pub fn local_addr(&self) -> Option<SocketAddr> {
		*self.inner.listen_addr.read()
	}

	/// Refcount-bumped snapshot of the routed peers.
	pub fn peers(&self) -> Vec<Arc<Peer>> {
		self.inner.route.iter_snapshot()
	}

	/// Count of transactions currently in flight.
	pub fn in_flight(&self) -> usize {
		self.inner.trans.len()
	}

	/// Dials a remote node, exchanges hellos and registers the peer in the
	/// routing table. An id already present fails with `Duplicate` before
	/// any worker thread is created.
	pub fn add_peer(&self, addr: SocketAddr) -> Result<Arc<Peer>, Error> {
		if self.inner.stop.is_stopped() {
			return Err(Error::Shutdown);
		}
		if self
			.inner
			.route
			.iter_snapshot()
			.iter()
			.any(|p| p.addr() == addr)
		{
			debug!("add_peer: already connected to {}", addr);
			return Err(Error::Duplicate);
		}

		let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
		let remote = handshake::initiate(&stream, &self.inner.local_hello())?;

		if remote.id == self.inner.id {
			debug!("add_peer: ignoring connection to self at {}", addr);
			return Err(Error::Duplicate);
		}

		let mut peer_addr = remote.addr;
		if peer_addr.ip().is_unspecified() {
			// wildcard advertisement; dial what we dialed, at the
			// advertised port
			peer_addr.set_ip(addr.ip());
		}

		let peer = Peer::create(&self.inner, Some(remote.id), peer_addr, stream)?;
		info!("added peer {} at {}", remote.id, peer_addr);
		Ok(peer)
	}

	/// Disconnects the peer with the given id and waits for its worker.
	pub fn remove_peer(&self, id: &ObjectId) -> Result<(), Error> {
		match self.inner.route.find(id) {
			Some(peer) => {
				self.inner.release_peer(&peer);
				peer.wait();
				Ok(())
			}
			None => Err(Error::NotFound),
		}
	}

	/// Announces this node as a storage participant to every routed peer.
	/// Peers that ack are marked Joined and will be reconnected on
	/// failure from then on.
	pub fn join(&self) -> Result<(), Error> {
		let hello = self.inner.local_hello();
		let payload = hello.encode();
		let mut failed = 0;

		for peer in self.inner.route.iter_snapshot() {
			let id = match peer.id() {
				Some(id) => id,
				None => continue,
			};
			let mut cmd = CmdHeader::new(id);
			cmd.flags = CmdFlags::JOIN | CmdFlags::NEED_ACK;

			match self.issue_wait(cmd, &payload) {
				Ok(replies) => {
					let ok = replies
						.last()
						.map(|(hdr, _)| hdr.status == status::OK)
						.unwrap_or(false);
					if ok {
						peer.set_join_state(JoinState::Joined);
					} else {
						warn!("join not acknowledged by {}", peer.addr());
						failed += 1;
					}
				}
				Err(e) => {
					warn!("join announcement to {} failed: {}", peer.addr(), e);
					failed += 1;
				}
			}
		}

		if failed > 0 {
			return Err(Error::Internal(format!(
				"{} peers did not acknowledge the join",
				failed
			)));
		}
		Ok(())
	}

	/// Builds and registers a transaction, routes it and sends the framed
	/// message. The completion is invoked once per reply chunk; the
	/// returned transaction number can be handed to `cancel`.
	pub fn issue(
		&self,
		mut cmd: CmdHeader,
		payload: &[u8],
		completion: Option<Completion>,
	) -> Result<u64, Error> {
		if self.inner.stop.is_stopped() {
			return Err(Error::Shutdown);
		}
		cmd.size = payload.len() as u64;
		cmd.trans = 0;

		match self.inner.route.lookup(&cmd.id) {
			Route::Local => self.issue_local(cmd, payload, completion),
			Route::Peer(peer) => {
				let t = self.inner.trans.insert(PendingTrans {
					cmd,
					data: payload.to_vec(),
					peer: Some(peer.clone()),
					recv_trans: None,
					completion,
				})?;

				let mut wire = cmd;
				wire.trans = t.trans_id();
				if let Err(e) = conn::send_msg(&peer, &wire, payload) {
					error!("send to {} failed, dropping peer: {}", peer.addr(), e);
					self.inner.trans.remove(&t);
					self.inner.release_peer(&peer);
					t.finalize(status::ABORTED);
					return Err(e);
				}
				Ok(t.trans_id())
			}
		}
	}

	/// A request that routes to ourselves never touches the wire: the
	/// handler runs on the calling thread and its replies feed the
	/// completion directly, with the usual MORE/ack semantics.
	fn issue_local(
		&self,
		cmd: CmdHeader,
		payload: &[u8],
		completion: Option<Completion>,
	) -> Result<u64, Error> {
		let t = self.inner.trans.insert(PendingTrans {
			cmd,
			data: payload.to_vec(),
			peer: None,
			recv_trans: None,
			completion,
		})?;
		let tid = t.trans_id();

		let mut wire = cmd;
		wire.trans = tid;

		let outcome = self.inner.handler.handle(&wire, payload);
		// terminal delivery happens off the registry, like a wire reply
		let t = match self.inner.trans.take(tid) {
			Some(t) => t,
			// cancelled from another thread before the handler returned
			None => return Ok(tid),
		};

		match outcome {
			Ok(replies) => {
				if replies.is_empty() {
					if wire.flags.contains(CmdFlags::NEED_ACK) {
						t.deliver(&reply_header(&wire, status::OK, false), Vec::new());
					}
					return Ok(tid);
				}
				let last = replies.len() - 1;
				for (i, Reply { status, data }) in replies.into_iter().enumerate() {
					t.deliver(&reply_header(&wire, status, i < last), data);
				}
			}
			Err(e) => {
				warn!("{}: local handler failed: {}", wire.id, e);
				t.deliver(&reply_header(&wire, e.to_status(), false), Vec::new());
			}
		}
		Ok(tid)
	}

	/// Issues a transaction and blocks until the terminal reply, returning
	/// every received chunk in order. Times out after the configured wait
	/// bound, cancelling the transaction.
	pub fn issue_wait(
		&self,
		cmd: CmdHeader,
		payload: &[u8],
	) -> Result<Vec<(CmdHeader, Vec<u8>)>, Error> {
		let (tx, rx) = channel::unbounded();
		let completion: Completion = Box::new(move |hdr, data| {
			let _ = tx.send((*hdr, data.to_vec()));
		});
		let tid = self.issue(cmd, payload, Some(completion))?;

		let timeout = self.inner.config.wait_timeout();
		let mut replies = Vec::new();
		loop {
			match rx.recv_timeout(timeout) {
				Ok((hdr, data)) => {
					let done = !hdr.flags.contains(CmdFlags::MORE);
					replies.push((hdr, data));
					if done {
						return Ok(replies);
					}
				}
				Err(_) => {
					let _ = self.cancel(tid);
					return Err(Error::Timeout);
				}
			}
		}
	}

	/// Removes the transaction from the registry and invokes its
	/// completion exactly once with status CANCELLED and the DESTROY flag.
	pub fn cancel(&self, trans_id: u64) -> Result<(), Error> {
		match self.inner.trans.take(trans_id & !TRANS_REPLY) {
			Some(t) => {
				t.finalize(status::CANCELLED);
				Ok(())
			}
			None => Err(Error::NotFound),
		}
	}

	/// Ordered shutdown: stop flag, listener, workers, then every
	/// remaining transaction is completed with ABORTED exactly once, and
	/// the tables are cleared. Idempotent; also run on drop.
	pub fn stop(&self) {
		if self.inner.stop.is_stopped() {
			return;
		}
		self.inner.stop.stop();

		if let Some(handle) = self.accept_thread.lock().take() {
			if let Err(e) = handle.join() {
				error!("failed to join accept loop: {:?}", e);
			}
		}

		let mut peers = self.inner.route.iter_snapshot();
		peers.extend(self.inner.unkeyed.lock().iter().cloned());
		for peer in &peers {
			peer.stop();
		}
		for peer in &peers {
			peer.wait();
		}

		let aborted = self.inner.trans.take_all();
		if !aborted.is_empty() {
			debug!(
				"aborting {} in-flight transactions on shutdown",
				aborted.len()
			);
		}
		for t in aborted {
			t.finalize(status::ABORTED);
		}

		self.inner.route.clear();
		self.inner.unkeyed.lock().clear();
		info!("node {} stopped", self.inner.id);
	}
}

impl Drop for Node {
	fn drop(&mut self) {
		self.stop();
	}
}

fn reply_header(req: &CmdHeader, status: i32, more: bool) -> CmdHeader {
	let mut out = CmdHeader::new(req.id);
	out.trans = req.trans | TRANS_REPLY;
	if more {
		out.flags.insert(CmdFlags::MORE);
	}
	out.status = status;
	out
}

fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
	let sleep_time = Duration::from_millis(5);
	loop {
		if inner.stop.is_stopped() {
			break;
		}
		match listener.accept() {
			Ok((stream, peer_addr)) => {
				// the peer identifies itself through its worker; until the
				// hello arrives it sits on the unkeyed list
				match Peer::create(&inner, None, peer_addr, stream) {
					Ok(_) => debug!("accepted connection from {}", peer_addr),
					Err(e) => debug!("error accepting peer {}: {:?}", peer_addr, e),
				}
			}
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
				// nothing to do, will retry in next iteration
			}
			Err(e) => {
				debug!("couldn't establish new client connection: {:?}", e);
			}
		}
		thread::sleep(sleep_time);
	}
	debug!("accept loop for node {} exited", inner.id);
}

/// Request handler that echoes every payload back, used for testing.
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
	fn handle(&self, _cmd: &CmdHeader, data: &[u8]) -> Result<Vec<Reply>, Error> {
		Ok(vec![Reply::ok(data.to_vec())])
	}
}
