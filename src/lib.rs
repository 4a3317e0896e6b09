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

//! Network transport and transaction layer for the Opal object store.
//!
//! Every node keeps one stream connection per peer, with a dedicated worker
//! thread on the receive side. Requests are routed by object id through a
//! closest-predecessor table and correlated with their asynchronous replies
//! through a per-node transaction registry. Requests that belong to another
//! node are re-issued on its connection on behalf of the sender.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod conn;
mod handshake;
pub mod msg;
mod node;
mod peer;
mod route;
mod trans;
pub mod types;

pub use crate::msg::{CmdFlags, CmdHeader, IoAttr, ObjectId, ID_SIZE};
pub use crate::node::{EchoHandler, Node};
pub use crate::peer::{JoinState, Peer};
pub use crate::trans::{Completion, Transaction};
pub use crate::types::{Error, NetConfig, Reply, RequestHandler, StopState};
