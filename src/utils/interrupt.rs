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

//! Cooperative cancellation for SIGINT.
//!
//! There is no thread-kill primitive here: a ^C flips a process-wide token,
//! in-flight channel pumps react to it (forwarding `\x03` or closing their
//! channel), and the executor starts no new work once it is set.

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

static STOP: Lazy<CancellationToken> = Lazy::new(CancellationToken::new);

/// A clone of the process-wide stop token.
pub fn stop_token() -> CancellationToken {
    STOP.clone()
}

/// Whether a stop has been requested.
pub fn stop_requested() -> bool {
    STOP.is_cancelled()
}

/// Request cancellation (used by tests and the signal handler).
pub fn trigger_stop() {
    STOP.cancel();
}

/// Spawn the ^C listener. Call once from the driver.
pub fn install_sigint_handler() {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping");
            STOP.cancel();
        }
    });
}
