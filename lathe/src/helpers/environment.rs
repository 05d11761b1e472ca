// Copyright 2025 The Lathe Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host compatibility validation performed once at instance startup.
//!
//! Replay determinism relies on a 64-bit address space and on the host's
//! shortest round-trip float formatting; both are checked here rather than
//! assumed.

use std::mem;

use thiserror::Error;

/// Raised when the host cannot produce deterministic replays.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported platform: {0}")]
pub struct EnvironmentError(pub String);

/// Validates host compatibility. Called by the instance builder; all other
/// entry points assume it has passed.
pub fn check() -> Result<(), EnvironmentError> {
    if mem::size_of::<usize>() < 8 {
        return Err(EnvironmentError("64-bit platform required".to_owned()));
    }
    check_float_formatting()
}

// Canonical state bytes embed decimal floats; the stringifier requires
// shortest round-trip rendering from the host formatter.
fn check_float_formatting() -> Result<(), EnvironmentError> {
    let samples: [(f64, &str); 3] = [
        (0.1 + 0.2, "0.30000000000000004"),
        (1e21, "1e21"),
        (-5.5, "-5.5"),
    ];
    for &(value, expected) in &samples {
        let rendered = format!("{}", serde_json::json!(value));
        if rendered != expected {
            return Err(EnvironmentError(format!(
                "non-canonical float formatting: {} rendered as {}",
                expected, rendered
            )));
        }
    }
    Ok(())
}
