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

//! Id-keyed routing table. A node owns the slice of the identifier space
//! between its own id and the next one up, so looking an id up means
//! finding the closest predecessor, wrapping past zero to the largest
//! known id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::msg::ObjectId;
use crate::peer::Peer;
use crate::types::Error;

/// Result of a routing lookup: the request is ours, or it belongs to a peer.
pub enum Route {
	Local,
	Peer(Arc<Peer>),
}

enum Entry {
	/// The local node's own id.
	Local,
	Remote(Arc<Peer>),
}

pub struct RouteTable {
	entries: RwLock<BTreeMap<ObjectId, Entry>>,
}

impl RouteTable {
	/// Builds a table holding only the self-entry.
	pub fn new(local_id: ObjectId) -> RouteTable {
		let mut entries = BTreeMap::new();
		entries.insert(local_id, Entry::Local);
		RouteTable {
			entries: RwLock::new(entries),
		}
	}

	/// Adds a peer under its assigned id. Fails with `Duplicate` when the
	/// id is already present, the local id included.
	pub fn insert(&self, peer: Arc<Peer>) -> Result<(), Error> {
		let id = peer
			.id()
			.ok_or_else(|| Error::Internal("routing insert of an unkeyed peer".to_owned()))?;
		let mut entries = self.entries.write();
		if entries.contains_key(&id) {
			return Err(Error::Duplicate);
		}
		entries.insert(id, Entry::Remote(peer));
		Ok(())
	}

	/// Removes the peer's entry. Idempotent, and pointer-checked so a
	/// replacement registered under the same id is left alone.
	pub fn remove(&self, peer: &Arc<Peer>) {
		let id = match peer.id() {
			Some(id) => id,
			None => return,
		};
		let mut entries = self.entries.write();
		let matches = match entries.get(&id) {
			Some(Entry::Remote(p)) => Arc::ptr_eq(p, peer),
			_ => false,
		};
		if matches {
			entries.remove(&id);
		}
	}

	/// Closest-predecessor lookup: the entry with the largest id at or
	/// below `id`, wrapping to the overall largest when nothing compares
	/// below. The returned reference is acquired before the table lock is
	/// released.
	pub fn lookup(&self, id: &ObjectId) -> Route {
		let entries = self.entries.read();
		let entry = entries
			.range(..=*id)
			.next_back()
			.or_else(|| entries.iter().next_back());
		match entry {
			Some((_, Entry::Remote(p))) => Route::Peer(p.clone()),
			// the self-entry is always present
			_ => Route::Local,
		}
	}

	/// Exact lookup of a remote peer by id.
	pub fn find(&self, id: &ObjectId) -> Option<Arc<Peer>> {
		match self.entries.read().get(id) {
			Some(Entry::Remote(p)) => Some(p.clone()),
			_ => None,
		}
	}

	/// Refcount-bumped snapshot of every remote peer, for broadcasts.
	pub fn iter_snapshot(&self) -> Vec<Arc<Peer>> {
		self.entries
			.read()
			.values()
			.filter_map(|e| match e {
				Entry::Remote(p) => Some(p.clone()),
				Entry::Local => None,
			})
			.collect()
	}

	/// Number of remote peers in the table.
	pub fn len(&self) -> usize {
		self.entries
			.read()
			.values()
			.filter(|e| match e {
				Entry::Remote(_) => true,
				Entry::Local => false,
			})
			.count()
	}

	/// Drops every remote entry, returning them for final release.
	pub fn clear(&self) -> Vec<Arc<Peer>> {
		let mut entries = self.entries.write();
		let peers = entries
			.values()
			.filter_map(|e| match e {
				Entry::Remote(p) => Some(p.clone()),
				Entry::Local => None,
			})
			.collect();
		entries.retain(|_, e| match e {
			Entry::Local => true,
			Entry::Remote(_) => false,
		});
		peers
	}
}
