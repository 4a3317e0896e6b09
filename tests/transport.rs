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

//! Single-hop transaction behavior: echo, multi-reply streams,
//! cancellation and timeouts.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{client, server, test_id, wait_for, ChunkHandler, SilentHandler};
use opal_net::{msg::status, CmdFlags, CmdHeader, EchoHandler, Error};

#[test]
fn loopback_echo() {
	common::init_logger();

	let n1 = server(0x01, Arc::new(EchoHandler));
	let c = client(0x05, Arc::new(EchoHandler));
	c.add_peer(n1.local_addr().unwrap()).unwrap();

	let cmd = CmdHeader::new(n1.id());
	let replies = c.issue_wait(cmd, b"ping").unwrap();

	assert_eq!(replies.len(), 1);
	let (hdr, data) = &replies[0];
	assert_eq!(hdr.status, status::OK);
	assert!(!hdr.flags.contains(CmdFlags::MORE));
	assert_eq!(hdr.id, n1.id());
	assert_eq!(data.as_slice(), b"ping");

	assert_eq!(c.in_flight(), 0);
	assert_eq!(n1.in_flight(), 0);

	c.stop();
	n1.stop();
}

#[test]
fn multi_reply_stream() {
	common::init_logger();

	let n1 = server(0x11, Arc::new(ChunkHandler { chunks: 3 }));
	let c = client(0x06, Arc::new(EchoHandler));
	c.add_peer(n1.local_addr().unwrap()).unwrap();

	let cmd = CmdHeader::new(n1.id());
	let replies = c.issue_wait(cmd, b"data").unwrap();

	assert_eq!(replies.len(), 3);
	for (i, (hdr, data)) in replies.iter().enumerate() {
		assert_eq!(hdr.status, status::OK);
		assert_eq!(data[0], i as u8, "chunks arrive in order");
		assert_eq!(&data[1..], b"data");
		if i < 2 {
			assert!(hdr.flags.contains(CmdFlags::MORE));
		} else {
			assert!(!hdr.flags.contains(CmdFlags::MORE));
		}
	}

	// the registry lets go of the transaction only on the terminal reply
	assert_eq!(c.in_flight(), 0);

	c.stop();
	n1.stop();
}

#[test]
fn local_issue_runs_handler_inline() {
	common::init_logger();

	let c = client(0x30, Arc::new(EchoHandler));
	// no peers: the lookup resolves to the self-entry
	let cmd = CmdHeader::new(test_id(0x31));
	let replies = c.issue_wait(cmd, b"self").unwrap();

	assert_eq!(replies.len(), 1);
	assert_eq!(replies[0].1.as_slice(), b"self");
	assert_eq!(c.in_flight(), 0);

	c.stop();
}

#[test]
fn cancel_invokes_completion_exactly_once() {
	common::init_logger();

	let n1 = server(0x21, Arc::new(SilentHandler));
	let c = client(0x07, Arc::new(EchoHandler));
	let peer = c.add_peer(n1.local_addr().unwrap()).unwrap();

	let seen: Arc<Mutex<Vec<(i32, CmdFlags)>>> = Arc::new(Mutex::new(Vec::new()));
	let seen2 = seen.clone();
	let cmd = CmdHeader::new(n1.id());
	let tid = c
		.issue(
			cmd,
			b"never answered",
			Some(Box::new(move |hdr, _data| {
				seen2.lock().unwrap().push((hdr.status, hdr.flags));
			})),
		)
		.unwrap();

	assert_eq!(c.in_flight(), 1);
	// a registered transaction keeps its peer alive alongside the worker
	// and the routing table
	assert!(Arc::strong_count(&peer) >= 2);

	c.cancel(tid).unwrap();

	let seen = seen.lock().unwrap();
	assert_eq!(seen.len(), 1, "cancel delivers exactly one completion");
	assert_eq!(seen[0].0, status::CANCELLED);
	assert!(seen[0].1.contains(CmdFlags::DESTROY));
	drop(seen);

	assert_eq!(c.in_flight(), 0);
	match c.cancel(tid) {
		Err(Error::NotFound) => {}
		other => panic!("expected NotFound, got {:?}", other),
	}

	c.stop();
	n1.stop();
}

#[test]
fn issue_wait_times_out_on_silence() {
	common::init_logger();

	let n1 = server(0x22, Arc::new(SilentHandler));
	let c = client(0x08, Arc::new(EchoHandler));
	c.add_peer(n1.local_addr().unwrap()).unwrap();

	let cmd = CmdHeader::new(n1.id());
	match c.issue_wait(cmd, b"lost") {
		Err(Error::Timeout) => {}
		other => panic!("expected Timeout, got {:?}", other.map(|r| r.len())),
	}

	// the timed-out transaction was cancelled out of the registry
	assert!(wait_for(|| c.in_flight() == 0, Duration::from_secs(1)));

	c.stop();
	n1.stop();
}
