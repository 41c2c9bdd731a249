// Copyright 2025 The fabr contributors
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

//! SSH connection management: authenticated clients, the per-worker
//! connection cache, host-key policy, and the interactive channel pump.

pub mod auth;
pub mod cache;
pub mod client;
pub mod known_hosts;
pub mod pump;

pub use auth::AuthMethod;
pub use cache::ConnectionCache;
pub use client::Connection;
pub use known_hosts::HostKeyPolicy;
pub use pump::{CommandSpec, LineSplitter, PumpOutcome};
