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

//! File-payload transmission: the receiver always gets exactly the
//! advertised number of bytes, zero-padded when the file runs short.

mod common;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use common::{client, server, wait_for, RecordingHandler};
use opal_net::{conn, CmdHeader, EchoHandler};

fn temp_file(name: &str, content: &[u8]) -> PathBuf {
	let path = std::env::temp_dir().join(format!("opal_net_{}_{}", process::id(), name));
	let mut f = OpenOptions::new()
		.create(true)
		.write(true)
		.truncate(true)
		.open(&path)
		.unwrap();
	f.write_all(content).unwrap();
	path
}

#[test]
fn short_file_is_zero_padded() {
	common::init_logger();

	let (handler, seen) = RecordingHandler::new();
	let n1 = server(0x50, handler);
	let c = client(0x02, Arc::new(EchoHandler));
	let peer = c.add_peer(n1.local_addr().unwrap()).unwrap();

	let path = temp_file("short", b"0123456789");
	let mut file = File::open(&path).unwrap();

	let mut cmd = CmdHeader::new(n1.id());
	cmd.size = 32;
	conn::send_file(&peer, &cmd, &mut file, 0, 32).unwrap();

	assert!(
		wait_for(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(2)),
		"request did not arrive"
	);
	let seen = seen.lock().unwrap();
	assert_eq!(seen[0].len(), 32, "exactly the advertised size arrives");
	assert_eq!(&seen[0][..10], b"0123456789");
	assert!(seen[0][10..].iter().all(|b| *b == 0), "the rest is padding");
	drop(seen);

	fs::remove_file(&path).unwrap();
	c.stop();
	n1.stop();
}

#[test]
fn offset_and_size_select_a_window() {
	common::init_logger();

	let (handler, seen) = RecordingHandler::new();
	let n1 = server(0x51, handler);
	let c = client(0x03, Arc::new(EchoHandler));
	let peer = c.add_peer(n1.local_addr().unwrap()).unwrap();

	let path = temp_file("window", b"abcdefghij");
	let mut file = File::open(&path).unwrap();

	let mut cmd = CmdHeader::new(n1.id());
	cmd.size = 4;
	conn::send_file(&peer, &cmd, &mut file, 3, 4).unwrap();

	assert!(
		wait_for(|| !seen.lock().unwrap().is_empty(), Duration::from_secs(2)),
		"request did not arrive"
	);
	assert_eq!(seen.lock().unwrap()[0].as_slice(), b"defg");

	fs::remove_file(&path).unwrap();
	c.stop();
	n1.stop();
}
