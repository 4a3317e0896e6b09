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

//! Failure paths: peer loss aborting in-flight transactions, and the
//! ordered node shutdown draining the registry.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::prelude::*;

use common::{client, server, test_id, wait_for, SilentHandler};
use opal_net::{msg::status, CmdFlags, CmdHeader, EchoHandler, JoinState};

#[test]
fn peer_loss_aborts_pending_transactions() {
	common::init_logger();

	let n1 = server(0x10, Arc::new(SilentHandler));
	let n2 = server(0x80, Arc::new(SilentHandler));
	let peer = n1.add_peer(n2.local_addr().unwrap()).unwrap();

	n1.join().unwrap();
	assert_eq!(peer.join_state(), JoinState::Joined);

	let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
	let seen2 = seen.clone();
	n1.issue(
		CmdHeader::new(n2.id()),
		b"pending",
		Some(Box::new(move |hdr, _| {
			seen2.lock().unwrap().push(hdr.status);
		})),
	)
	.unwrap();
	assert_eq!(n1.in_flight(), 1);

	// kill the remote end; the pending transaction must abort right away,
	// not sit queued across reconnect attempts
	n2.stop();

	assert!(
		wait_for(|| seen.lock().unwrap().len() == 1, Duration::from_secs(3)),
		"peer loss must deliver the abort promptly"
	);
	assert_eq!(seen.lock().unwrap()[0], status::ABORTED);
	assert_eq!(n1.in_flight(), 0);

	n1.stop();
}

#[test]
fn shutdown_drains_every_completion_exactly_once() {
	common::init_logger();

	let a = server(0x40, Arc::new(SilentHandler));
	let b = server(0x80, Arc::new(SilentHandler));
	let c = client(0x01, Arc::new(SilentHandler));
	c.add_peer(a.local_addr().unwrap()).unwrap();
	c.add_peer(b.local_addr().unwrap()).unwrap();

	// half the ids land on each server, in random order
	let mut targets: Vec<u8> = (0..100u8).map(|i| if i % 2 == 0 { 0x41 } else { 0x81 }).collect();
	targets.shuffle(&mut thread_rng());

	let seen: Arc<Mutex<Vec<(u64, i32, CmdFlags)>>> = Arc::new(Mutex::new(Vec::new()));
	for target in targets {
		let seen2 = seen.clone();
		c.issue(
			CmdHeader::new(test_id(target)),
			b"in flight",
			Some(Box::new(move |hdr, _| {
				seen2.lock().unwrap().push((hdr.trans_id(), hdr.status, hdr.flags));
			})),
		)
		.unwrap();
	}
	assert_eq!(c.in_flight(), 100);

	c.stop();

	let seen = seen.lock().unwrap();
	assert_eq!(seen.len(), 100, "every completion fires exactly once");
	for (_, status_code, flags) in seen.iter() {
		assert_eq!(*status_code, status::ABORTED);
		assert!(flags.contains(CmdFlags::DESTROY));
	}
	let mut ids: Vec<u64> = seen.iter().map(|(id, _, _)| *id).collect();
	ids.sort();
	ids.dedup();
	assert_eq!(ids.len(), 100, "no transaction was completed twice");

	a.stop();
	b.stop();
}

#[test]
fn stop_is_idempotent() {
	common::init_logger();

	let n1 = server(0x33, Arc::new(EchoHandler));
	n1.stop();
	n1.stop();
}
