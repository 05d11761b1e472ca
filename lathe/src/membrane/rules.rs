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

//! Immutable policy records driving the membrane.
//!
//! Each creation kind gets a predefined rule set; child-property
//! membranes inherit the parent's rules with binding semantics stripped.

/// Binding names that identify a jig's position in the chain.
pub const LOCATION_PROPS: &[&str] = &["location", "origin", "nonce"];

/// Binding names that identify a jig's spendable output.
pub const UTXO_PROPS: &[&str] = &["owner", "satoshis"];

/// Names protected from definition, deletion and shadowing.
pub const RESERVED_PROPS: &[&str] = &[
    "constructor",
    "prototype",
    "deps",
    "presets",
    "sync",
    "destroy",
    "auth",
    "upgrade",
    "load",
    "pluck",
];

/// Whether the name is one of the five binding fields.
pub fn is_binding(name: &str) -> bool {
    LOCATION_PROPS.contains(&name) || UTXO_PROPS.contains(&name)
}

/// Whether the name is reserved.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_PROPS.contains(&name)
}

/// Whether the name is private to its defining class.
pub fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

/// The policy record consulted by every membrane operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rules {
    /// `location`/`origin`/`nonce` are surfaced read-only and validated.
    pub location_bindings: bool,
    /// `owner`/`satoshis` are surfaced, writable only inside methods.
    pub utxo_bindings: bool,
    /// Reserved names are refused.
    pub reserved: bool,
    /// Code binding surface (class-level state).
    pub code_props: bool,
    /// Jig-instance binding surface.
    pub jig_props: bool,
    /// Berry binding surface.
    pub berry_props: bool,
    /// Underscored names are filtered on cross-jig access.
    pub privacy: bool,
    /// Writes and deletes are rejected.
    pub immutable: bool,
    /// Reads are reported to the active record.
    pub record_reads: bool,
    /// Updates are reported to the active record.
    pub record_updates: bool,
    /// Method calls are reported to the active record.
    pub record_calls: bool,
    /// The object itself enters the record's read/input sets.
    pub recordable_target: bool,
    /// Method calls dispatch through the kernel.
    pub smart_api: bool,
    /// Functions are called with no receiver.
    pub thisless: bool,
    /// Method names that always fail.
    pub disabled_methods: Vec<&'static str>,
}

impl Rules {
    /// Rules for a deployed jig class.
    pub fn jig_code() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            code_props: true,
            privacy: true,
            record_reads: true,
            record_updates: true,
            record_calls: true,
            recordable_target: true,
            smart_api: true,
            disabled_methods: vec!["init"],
            ..Rules::default()
        }
    }

    /// Rules for deployed sidekick code (plain classes and functions).
    pub fn sidekick_code() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            code_props: true,
            immutable: true,
            record_reads: true,
            recordable_target: true,
            thisless: true,
            ..Rules::default()
        }
    }

    /// Rules for a deployed berry class.
    pub fn berry_code() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            code_props: true,
            immutable: true,
            record_reads: true,
            recordable_target: true,
            disabled_methods: vec!["init"],
            ..Rules::default()
        }
    }

    /// Rules for the built-in primitives.
    pub fn native_code() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            code_props: true,
            immutable: true,
            ..Rules::default()
        }
    }

    /// Rules for a jig instance.
    pub fn jig_instance() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            jig_props: true,
            privacy: true,
            record_reads: true,
            record_updates: true,
            record_calls: true,
            recordable_target: true,
            smart_api: true,
            disabled_methods: vec!["init"],
            ..Rules::default()
        }
    }

    /// Rules for a berry instance.
    pub fn berry_instance() -> Rules {
        Rules {
            location_bindings: true,
            utxo_bindings: true,
            reserved: true,
            berry_props: true,
            privacy: true,
            immutable: true,
            record_reads: true,
            recordable_target: true,
            ..Rules::default()
        }
    }

    /// Rules for an inner object owned by a jig: the parent's policy with
    /// binding semantics stripped and the target made non-recordable.
    pub fn child_property(parent: &Rules) -> Rules {
        Rules {
            location_bindings: false,
            utxo_bindings: false,
            code_props: false,
            jig_props: false,
            berry_props: false,
            recordable_target: false,
            reserved: false,
            disabled_methods: Vec::new(),
            ..parent.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_classes() {
        assert!(is_binding("owner"));
        assert!(is_binding("nonce"));
        assert!(!is_binding("ownerName"));
        assert!(is_reserved("prototype"));
        assert!(is_private("_x"));
        assert!(!is_private("x"));
    }

    #[test]
    fn child_property_strips_binding_semantics() {
        let parent = Rules::jig_instance();
        let child = Rules::child_property(&parent);
        assert!(!child.location_bindings);
        assert!(!child.utxo_bindings);
        assert!(!child.recordable_target);
        assert!(child.record_updates, "recording flags inherited");
        assert!(child.privacy, "privacy inherited");
        assert!(child.smart_api, "dispatch inherited");
    }

    #[test]
    fn immutable_kinds() {
        assert!(Rules::sidekick_code().immutable);
        assert!(Rules::berry_instance().immutable);
        assert!(Rules::native_code().immutable);
        assert!(!Rules::jig_code().immutable);
        assert!(!Rules::jig_instance().immutable);
    }
}
