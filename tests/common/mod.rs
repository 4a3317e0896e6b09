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

//! Common test scaffolding: node builders on ephemeral loopback ports and
//! a few request handlers with scripted behavior.

// not every test binary uses every helper
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use opal_net::{CmdHeader, Error, NetConfig, Node, ObjectId, Reply, RequestHandler, ID_SIZE};

pub fn init_logger() {
	let _ = env_logger::try_init();
}

/// An id with every byte zero except the last; ordering then follows the
/// last byte, which keeps routing expectations readable.
pub fn test_id(last: u8) -> ObjectId {
	let mut bytes = [0u8; ID_SIZE];
	bytes[ID_SIZE - 1] = last;
	ObjectId::new(bytes)
}

pub fn config(id: u8, listen: bool) -> NetConfig {
	NetConfig {
		host: "127.0.0.1".parse().unwrap(),
		port: 0,
		id: test_id(id),
		listen: Some(listen),
		wait_timeout_ms: Some(2000),
		max_msg_size: None,
	}
}

pub fn server(id: u8, handler: Arc<dyn RequestHandler>) -> Node {
	Node::new(config(id, true), handler).unwrap()
}

pub fn client(id: u8, handler: Arc<dyn RequestHandler>) -> Node {
	Node::new(config(id, false), handler).unwrap()
}

/// Accepts every request and never replies, leaving the transaction in
/// flight on the issuing side.
pub struct SilentHandler;

impl RequestHandler for SilentHandler {
	fn handle(&self, _cmd: &CmdHeader, _data: &[u8]) -> Result<Vec<Reply>, Error> {
		Ok(vec![])
	}
}

/// Splits the payload into `chunks` replies so the issuer sees a
/// multi-reply stream.
pub struct ChunkHandler {
	pub chunks: usize,
}

impl RequestHandler for ChunkHandler {
	fn handle(&self, _cmd: &CmdHeader, data: &[u8]) -> Result<Vec<Reply>, Error> {
		Ok((0..self.chunks)
			.map(|i| {
				let mut chunk = vec![i as u8];
				chunk.extend_from_slice(data);
				Reply::ok(chunk)
			})
			.collect())
	}
}

/// Records every request payload it sees; replies with nothing.
pub struct RecordingHandler {
	pub seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingHandler {
	pub fn new() -> (Arc<RecordingHandler>, Arc<Mutex<Vec<Vec<u8>>>>) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		(
			Arc::new(RecordingHandler { seen: seen.clone() }),
			seen,
		)
	}
}

impl RequestHandler for RecordingHandler {
	fn handle(&self, _cmd: &CmdHeader, data: &[u8]) -> Result<Vec<Reply>, Error> {
		self.seen.lock().unwrap().push(data.to_vec());
		Ok(vec![])
	}
}

/// Polls `cond` until it holds or the deadline passes.
pub fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if cond() {
			return true;
		}
		thread::sleep(Duration::from_millis(20));
	}
	cond()
}
