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

//! Per-jig lifecycle states.
//!
//! ```text
//! UNDEPLOYED ──deploy──▶ DEPLOYING ──commit──▶ LIVE
//!                          │  failure             │  call/update/upgrade
//!                          ▼                      ▼
//!                        POISONED               LIVE (nonce+1)
//!                                                 │  destroy
//!                                                 ▼
//!                                              DESTROYED (terminal)
//! ```

use std::fmt;

/// Lifecycle state of a creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Known locally, never entered a record.
    Undeployed,
    /// Inside an open or publishing record.
    Deploying,
    /// Committed on-chain and usable.
    Live,
    /// Deleted on-chain; terminal.
    Destroyed,
    /// An unrecoverable failure struck while the jig was pending; reads
    /// fail from here on.
    Poisoned,
}

impl Lifecycle {
    /// Whether the jig may enter a new record.
    pub fn can_record(&self) -> bool {
        matches!(self, Lifecycle::Undeployed | Lifecycle::Deploying | Lifecycle::Live)
    }

    /// Whether the jig is terminally destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Lifecycle::Destroyed)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Undeployed => "undeployed",
            Lifecycle::Deploying => "deploying",
            Lifecycle::Live => "live",
            Lifecycle::Destroyed => "destroyed",
            Lifecycle::Poisoned => "poisoned",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recordability() {
        assert!(Lifecycle::Undeployed.can_record());
        assert!(Lifecycle::Live.can_record());
        assert!(!Lifecycle::Destroyed.can_record());
        assert!(!Lifecycle::Poisoned.can_record());
    }
}
