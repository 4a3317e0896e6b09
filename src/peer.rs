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

//! Per-connection peer state. A peer exclusively owns its socket; the
//! routing table, the worker thread and any transaction expecting a reply
//! on the connection each hold a strong reference, and the record is freed
//! when the last one drops.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::prelude::*;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::conn;
use crate::handshake::{self, CONNECT_TIMEOUT};
use crate::msg::{Hello, ObjectId};
use crate::node::NodeInner;
use crate::types::{Error, StopState};

/// Role of a peer connection within the storage mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
	/// One-shot outbound client: the worker exits on disconnect.
	Client,
	/// Storage participant: the worker reconnects on failure.
	Joined,
	/// Reconnected participant that has not yet re-announced itself.
	Rejoin,
}

pub struct Peer {
	/// Remote id, filled once the handshake assigns it.
	id: RwLock<Option<ObjectId>>,
	/// Advertised address used for reconnects; a JOIN announcement may
	/// replace the accept-time source address with the remote's listener.
	addr: RwLock<SocketAddr>,
	/// The connection. Write-locked only to swap the socket on reconnect.
	conn: RwLock<TcpStream>,
	/// Serializes the outbound byte stream; any header+body sequence is
	/// atomic with respect to other senders on this peer.
	send_lock: Mutex<()>,
	join_state: RwLock<JoinState>,
	timeout: Duration,
	stop: Arc<StopState>,
	stopped: AtomicBool,
	worker: Mutex<Option<JoinHandle<()>>>,
	pub connected_at: DateTime<Utc>,
	last_seen: RwLock<DateTime<Utc>>,
}

impl Peer {
	/// Builds the peer record, registers it with the node (routing table
	/// when `id` is known, the unkeyed list when not) and spawns its worker
	/// thread. A duplicate id fails before any thread is created.
	pub(crate) fn create(
		node: &Arc<NodeInner>,
		id: Option<ObjectId>,
		addr: SocketAddr,
		stream: TcpStream,
	) -> Result<Arc<Peer>, Error> {
		stream.set_nonblocking(true)?;

		let now = Utc::now();
		let peer = Arc::new(Peer {
			id: RwLock::new(id),
			addr: RwLock::new(addr),
			conn: RwLock::new(stream),
			send_lock: Mutex::new(()),
			join_state: RwLock::new(JoinState::Client),
			timeout: node.config.wait_timeout(),
			stop: node.stop.clone(),
			stopped: AtomicBool::new(false),
			worker: Mutex::new(None),
			connected_at: now,
			last_seen: RwLock::new(now),
		});

		if id.is_some() {
			node.route.insert(peer.clone())?;
		} else {
			node.unkeyed.lock().push(peer.clone());
		}

		match conn::spawn_worker(node.clone(), peer.clone()) {
			Ok(handle) => {
				*peer.worker.lock() = Some(handle);
				Ok(peer)
			}
			Err(e) => {
				node.route.remove(&peer);
				node.unkeyed.lock().retain(|p| !Arc::ptr_eq(p, &peer));
				Err(Error::Resource(format!("failed to spawn peer worker: {}", e)))
			}
		}
	}

	pub fn id(&self) -> Option<ObjectId> {
		*self.id.read()
	}

	pub fn set_id(&self, id: ObjectId) {
		*self.id.write() = Some(id);
	}

	pub fn addr(&self) -> SocketAddr {
		*self.addr.read()
	}

	pub fn set_addr(&self, addr: SocketAddr) {
		*self.addr.write() = addr;
	}

	pub fn join_state(&self) -> JoinState {
		*self.join_state.read()
	}

	pub fn set_join_state(&self, state: JoinState) {
		*self.join_state.write() = state;
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	pub fn touch(&self) {
		*self.last_seen.write() = Utc::now();
	}

	pub fn last_seen(&self) -> DateTime<Utc> {
		*self.last_seen.read()
	}

	pub(crate) fn conn_read(&self) -> RwLockReadGuard<'_, TcpStream> {
		self.conn.read()
	}

	pub(crate) fn send_guard(&self) -> MutexGuard<'_, ()> {
		self.send_lock.lock()
	}

	/// True once either the node or this peer has been asked to stop; every
	/// bounded wait polls this.
	pub fn should_exit(&self) -> bool {
		self.stop.is_stopped() || self.stopped.load(Ordering::Relaxed)
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Relaxed)
	}

	/// Schedules the connection to close: flags the worker and shuts the
	/// socket down so any blocked wait observes it promptly.
	pub fn stop(&self) {
		self.stopped.store(true, Ordering::Relaxed);
		let _ = self.conn.read().shutdown(Shutdown::Both);
	}

	/// Joins the worker thread. Waits only when called from another thread,
	/// e.g. shutdown; a worker tearing itself down skips the join.
	pub fn wait(&self) {
		let handle = self.worker.lock().take();
		if let Some(handle) = handle {
			if thread::current().id() != handle.thread().id() {
				debug!("waiting for peer {} worker exit", self.addr());
				if let Err(e) = handle.join() {
					error!("failed to join peer worker: {:?}", e);
				}
			} else {
				debug!("peer {} worker exiting on its own thread", self.addr());
			}
		}
	}

	#[cfg(test)]
	pub(crate) fn detached(
		id: Option<ObjectId>,
		addr: SocketAddr,
		stream: TcpStream,
	) -> Arc<Peer> {
		let now = Utc::now();
		Arc::new(Peer {
			id: RwLock::new(id),
			addr: RwLock::new(addr),
			conn: RwLock::new(stream),
			send_lock: Mutex::new(()),
			join_state: RwLock::new(JoinState::Client),
			timeout: Duration::from_millis(1000),
			stop: Arc::new(StopState::new()),
			stopped: AtomicBool::new(false),
			worker: Mutex::new(None),
			connected_at: now,
			last_seen: RwLock::new(now),
		})
	}

	/// Dials the peer's advertised address again, re-runs the handshake and
	/// swaps the socket in place. Only participants reconnect; a client
	/// connection is simply dropped.
	pub fn reconnect(&self, local: &Hello) -> Result<(), Error> {
		if self.join_state() == JoinState::Client {
			return Err(Error::Internal(
				"reconnect requested for a client peer".to_owned(),
			));
		}
		let addr = self.addr();
		let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
		let remote = handshake::initiate(&stream, local)?;
		match self.id() {
			Some(id) if id != remote.id => {
				return Err(Error::Internal(format!(
					"peer at {} changed id from {} to {}",
					addr, id, remote.id
				)));
			}
			_ => self.set_id(remote.id),
		}
		stream.set_nonblocking(true)?;
		{
			let mut conn = self.conn.write();
			let _ = conn.shutdown(Shutdown::Both);
			*conn = stream;
		}
		self.set_join_state(JoinState::Rejoin);
		info!("reconnected to {} ({})", addr, remote.id);
		Ok(())
	}
}
