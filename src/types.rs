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

//! Shared types for the transport core: errors, node configuration, the
//! stop flag and the seam to the local request handler.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::msg::{status, CmdHeader, ObjectId};

/// Wait timeout applied to every bounded socket wait unless configured.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 60_000;

/// Largest payload size accepted by the header decoder unless configured.
pub const DEFAULT_MAX_MSG_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("net malformed message, {0}")]
	Malformed(String),
	#[error("net connection error, {0}")]
	Connection(#[from] io::Error),
	#[error("peer disconnected")]
	Disconnect,
	#[error("net timeout")]
	Timeout,
	#[error("node is shutting down")]
	Shutdown,
	#[error("id already present")]
	Duplicate,
	#[error("transaction not found")]
	NotFound,
	#[error("transaction aborted")]
	Aborted,
	#[error("forward failed")]
	ForwardFailed,
	#[error("resource exhausted, {0}")]
	Resource(String),
	#[error("net internal error: {0}")]
	Internal(String),
}

impl Error {
	/// Errno-style status carried in reply headers for this error.
	pub fn to_status(&self) -> i32 {
		match self {
			Error::Malformed(_) => status::INVALID,
			Error::Connection(_) => status::IO,
			Error::Disconnect => status::IO,
			Error::Timeout => status::TIMEOUT,
			Error::Shutdown => status::ABORTED,
			Error::Duplicate => status::EXIST,
			Error::NotFound => status::NOT_FOUND,
			Error::Aborted => status::ABORTED,
			Error::ForwardFailed => status::FORWARD_FAILED,
			Error::Resource(_) => status::NO_MEM,
			Error::Internal(_) => status::IO,
		}
	}
}

/// Configuration for a transport node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
	pub host: IpAddr,
	pub port: u16,

	/// Network-wide id of this node; object ids closest below it are ours.
	pub id: ObjectId,

	/// Whether to bind and accept incoming connections. Pure clients that
	/// only dial out run with this disabled.
	pub listen: Option<bool>,

	/// Bound applied to every blocking wait on a peer socket, milliseconds.
	pub wait_timeout_ms: Option<u64>,

	/// Cap on the advertised payload size of a single message, bytes.
	pub max_msg_size: Option<u64>,
}

impl Default for NetConfig {
	fn default() -> NetConfig {
		NetConfig {
			host: "0.0.0.0".parse().unwrap(),
			port: 1025,
			id: ObjectId::min(),
			listen: Some(true),
			wait_timeout_ms: None,
			max_msg_size: None,
		}
	}
}

impl NetConfig {
	pub fn listen(&self) -> bool {
		self.listen.unwrap_or(true)
	}

	pub fn wait_timeout(&self) -> Duration {
		Duration::from_millis(self.wait_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS))
	}

	pub fn max_msg_size(&self) -> u64 {
		self.max_msg_size.unwrap_or(DEFAULT_MAX_MSG_SIZE)
	}
}

/// Node-wide shutdown flag, polled between bounded waits so every blocked
/// worker wakes within one poll interval.
pub struct StopState {
	stopped: AtomicBool,
}

impl StopState {
	pub fn new() -> StopState {
		StopState {
			stopped: AtomicBool::new(false),
		}
	}

	pub fn stop(&self) {
		self.stopped.store(true, Ordering::Relaxed);
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Relaxed)
	}
}

/// One reply chunk produced by the local request handler.
pub struct Reply {
	pub status: i32,
	pub data: Vec<u8>,
}

impl Reply {
	pub fn ok(data: Vec<u8>) -> Reply {
		Reply {
			status: status::OK,
			data,
		}
	}
}

/// A trait to be implemented in order to execute requests that route to the
/// local node. Returned replies are sent back to the requester in order,
/// with the MORE flag set on all but the last.
pub trait RequestHandler: Send + Sync + 'static {
	fn handle(&self, cmd: &CmdHeader, data: &[u8]) -> Result<Vec<Reply>, Error>;
}
