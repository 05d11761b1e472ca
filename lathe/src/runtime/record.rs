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

//! The transient operation log that becomes one transaction at commit.
//!
//! A record captures the top-level actions of one entry (or of one open
//! batch), together with the tracked jig sets: reads, updates, creates,
//! deletes and auths. Jigs are noted in first-touch order; the commit
//! engine derives the input/reference/output/delete spaces from these
//! lists without re-sorting, so the derived transaction shape is a pure
//! function of program order.

use crate::value::{JigRef, Value};

/// An executing method frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Frame {
    /// Receiver (the code jig itself for static methods).
    pub this: JigRef,
    /// Code jig of the class defining the executing method.
    pub class: JigRef,
}

/// A top-level action captured by the record.
#[derive(Debug)]
pub(crate) enum Action {
    /// Install new code jigs (one deploy may carry several classes).
    Deploy { codes: Vec<JigRef> },
    /// Swap the class of a code jig.
    Upgrade { code: JigRef },
    /// Instantiate a jig class.
    New {
        class: JigRef,
        instance: JigRef,
        args: Vec<Value>,
    },
    /// Invoke a method (including `auth` and `destroy`).
    Call {
        target: JigRef,
        method: String,
        args: Vec<Value>,
    },
}

/// The operation log of one open entry or batch.
#[derive(Debug, Default)]
pub(crate) struct Record {
    /// Record id used in provisional `record://` locations.
    pub id: String,
    /// Whether the record publishes only on explicit request.
    pub manual: bool,
    /// Top-level actions in program order.
    pub actions: Vec<Action>,
    /// Every jig observed or modified, in first-touch order.
    pub touched: Vec<JigRef>,
    /// Jigs read.
    pub reads: Vec<JigRef>,
    /// Jigs modified (including created and deleted ones).
    pub updates: Vec<JigRef>,
    /// Jigs created in this record.
    pub creates: Vec<JigRef>,
    /// Jigs deleted in this record.
    pub deletes: Vec<JigRef>,
    /// Jigs authed without state change.
    pub auths: Vec<JigRef>,
    /// Jigs whose owner or satoshis changed in this record; operations
    /// requiring committed ownership fail on them until commit.
    pub unbound: Vec<JigRef>,
    /// Nested method frames.
    pub stack: Vec<Frame>,
}

fn note(list: &mut Vec<JigRef>, jig: JigRef) {
    if !list.contains(&jig) {
        list.push(jig);
    }
}

impl Record {
    /// An empty record.
    pub fn new(id: String, manual: bool) -> Record {
        Record {
            id,
            manual,
            ..Record::default()
        }
    }

    /// Whether any action was captured.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether the record changes chain state. Pure-read entries commit
    /// nothing; there is nothing for a replay to verify.
    pub fn has_effects(&self) -> bool {
        !self.updates.is_empty() || !self.deletes.is_empty() || !self.auths.is_empty()
    }

    /// Notes a read.
    pub fn read(&mut self, jig: JigRef) {
        note(&mut self.touched, jig);
        note(&mut self.reads, jig);
    }

    /// Notes a state update.
    pub fn update(&mut self, jig: JigRef) {
        note(&mut self.touched, jig);
        note(&mut self.updates, jig);
    }

    /// Notes a creation (also an update).
    pub fn create(&mut self, jig: JigRef) {
        note(&mut self.touched, jig);
        note(&mut self.creates, jig);
        note(&mut self.updates, jig);
    }

    /// Notes a deletion (also an update).
    pub fn delete(&mut self, jig: JigRef) {
        note(&mut self.touched, jig);
        note(&mut self.deletes, jig);
        note(&mut self.updates, jig);
    }

    /// Notes an ownership approval without state change.
    pub fn auth(&mut self, jig: JigRef) {
        note(&mut self.touched, jig);
        note(&mut self.auths, jig);
    }

    /// Marks an in-record owner/satoshis change.
    pub fn mark_unbound(&mut self, jig: JigRef) {
        note(&mut self.unbound, jig);
    }

    /// Whether the jig has a pending owner/satoshis change.
    pub fn is_unbound(&self, jig: JigRef) -> bool {
        self.unbound.contains(&jig)
    }

    /// Whether the jig was created in this record.
    pub fn is_created(&self, jig: JigRef) -> bool {
        self.creates.contains(&jig)
    }

    /// Whether the jig was deleted in this record.
    pub fn is_deleted(&self, jig: JigRef) -> bool {
        self.deletes.contains(&jig)
    }

    /// The executing frame, if any.
    pub fn top_frame(&self) -> Option<Frame> {
        self.stack.last().copied()
    }

    /// Jigs whose prior outputs this record spends: everything updated,
    /// deleted or authed that existed before the record, in first-touch
    /// order.
    pub fn inputs(&self) -> Vec<JigRef> {
        self.touched
            .iter()
            .copied()
            .filter(|jig| {
                !self.creates.contains(jig)
                    && (self.updates.contains(jig)
                        || self.deletes.contains(jig)
                        || self.auths.contains(jig))
            })
            .collect()
    }

    /// Jigs observed but not consumed, in first-touch order.
    pub fn refs(&self) -> Vec<JigRef> {
        self.touched
            .iter()
            .copied()
            .filter(|jig| {
                self.reads.contains(jig)
                    && !self.creates.contains(jig)
                    && !self.updates.contains(jig)
                    && !self.deletes.contains(jig)
                    && !self.auths.contains(jig)
            })
            .collect()
    }

    /// The `$jig` index space: inputs, then refs, then creations.
    pub fn jig_space(&self) -> Vec<JigRef> {
        let mut space = self.inputs();
        space.extend(self.refs());
        space.extend(self.creates.iter().copied());
        space
    }

    /// Jigs surviving as outputs: spent inputs that were not deleted (in
    /// input order), then creations that were not deleted (in creation
    /// order).
    pub fn outputs(&self) -> Vec<JigRef> {
        let mut out: Vec<JigRef> = self
            .inputs()
            .into_iter()
            .filter(|jig| !self.deletes.contains(jig))
            .collect();
        out.extend(
            self.creates
                .iter()
                .copied()
                .filter(|jig| !self.deletes.contains(jig)),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jig(n: u32) -> JigRef {
        JigRef(n)
    }

    #[test]
    fn reads_do_not_consume() {
        let mut record = Record::new("r".to_owned(), false);
        record.read(jig(1));
        record.read(jig(2));
        record.update(jig(2));
        assert_eq!(record.inputs(), vec![jig(2)]);
        assert_eq!(record.refs(), vec![jig(1)]);
    }

    #[test]
    fn creates_are_outputs_not_inputs() {
        let mut record = Record::new("r".to_owned(), false);
        record.create(jig(5));
        record.update(jig(5));
        assert!(record.inputs().is_empty());
        assert_eq!(record.outputs(), vec![jig(5)]);
    }

    #[test]
    fn deletes_spend_without_producing() {
        let mut record = Record::new("r".to_owned(), false);
        record.update(jig(1));
        record.delete(jig(2));
        assert_eq!(record.inputs(), vec![jig(1), jig(2)]);
        assert_eq!(record.outputs(), vec![jig(1)]);
    }

    #[test]
    fn created_then_deleted_never_outputs() {
        let mut record = Record::new("r".to_owned(), false);
        record.create(jig(7));
        record.delete(jig(7));
        assert!(record.inputs().is_empty());
        assert!(record.outputs().is_empty());
        // Still addressable in the index space.
        assert_eq!(record.jig_space(), vec![jig(7)]);
    }

    #[test]
    fn index_space_orders_inputs_refs_creates() {
        let mut record = Record::new("r".to_owned(), false);
        record.read(jig(1));
        record.update(jig(2));
        record.create(jig(3));
        record.auth(jig(4));
        assert_eq!(record.jig_space(), vec![jig(2), jig(4), jig(1), jig(3)]);
    }

    #[test]
    fn unbound_tracking() {
        let mut record = Record::new("r".to_owned(), false);
        assert!(!record.is_unbound(jig(1)));
        record.mark_unbound(jig(1));
        assert!(record.is_unbound(jig(1)));
    }
}
