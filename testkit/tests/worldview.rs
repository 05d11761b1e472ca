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

//! Worldview consistency and batch transactions.

use std::sync::Arc;

use lathe::sandbox::ClassDef;
use lathe::{ClassKind, ClassManifest, Error, MethodScope, Value};
use lathe_testkit::TestKit;

struct Dragon;

impl ClassDef for Dragon {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Dragon", ClassKind::Jig)
            .method("init")
            .method("feed")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "init" => {
                scope.set("hunger", Value::from(10))?;
                Ok(Value::Undefined)
            }
            "feed" => {
                let hunger = match scope.get("hunger")? {
                    Value::Number(n) => n,
                    _ => 0.0,
                };
                scope.set("hunger", Value::Number(hunger - 1.0))?;
                Ok(Value::Undefined)
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

struct Holder;

impl ClassDef for Holder {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Holder", ClassKind::Jig).method("grab")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "grab" => {
                let target = args.first().cloned().unwrap_or(Value::Undefined);
                scope.set("it", target)?;
                Ok(Value::Undefined)
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

#[test]
fn mixed_worldviews_fail_the_batch() {
    let kit = TestKit::new("worldview-test");
    let dragon = kit.lathe.deploy(Arc::new(Dragon)).unwrap();
    let holder = kit.lathe.deploy(Arc::new(Holder)).unwrap();

    let a = dragon.construct(vec![]).unwrap();
    a.call("feed", vec![]).unwrap();
    // An older view of the same dragon.
    let a_old = kit.lathe.load(&a.origin().unwrap()).unwrap();
    assert_eq!(a_old.origin().unwrap(), a.origin().unwrap());
    assert_ne!(a_old.location().unwrap(), a.location().unwrap());

    let h1 = holder.construct(vec![]).unwrap();
    let h2 = holder.construct(vec![]).unwrap();

    kit.lathe.begin().unwrap();
    h1.call("grab", vec![Value::Jig(a.jig_ref())]).unwrap();
    h2.call("grab", vec![Value::Jig(a_old.jig_ref())]).unwrap();
    let err = kit.lathe.publish().unwrap_err();
    assert!(
        err.to_string().contains("Inconsistent worldview"),
        "unexpected error: {}",
        err
    );

    // The failed batch rolled its participants back.
    assert!(h1.get("it").unwrap().deep_eq(&Value::Undefined));
    assert!(h2.get("it").unwrap().deep_eq(&Value::Undefined));
}

#[test]
fn consistent_references_publish() {
    let kit = TestKit::new("worldview-test");
    let dragon = kit.lathe.deploy(Arc::new(Dragon)).unwrap();
    let holder = kit.lathe.deploy(Arc::new(Holder)).unwrap();

    let a = dragon.construct(vec![]).unwrap();
    let h1 = holder.construct(vec![]).unwrap();
    let h2 = holder.construct(vec![]).unwrap();

    kit.lathe.begin().unwrap();
    h1.call("grab", vec![Value::Jig(a.jig_ref())]).unwrap();
    h2.call("grab", vec![Value::Jig(a.jig_ref())]).unwrap();
    kit.lathe.publish().unwrap();

    assert!(matches!(h1.get("it").unwrap(), Value::Jig(_)));
    // One transaction for both holders.
    assert_eq!(h1.nonce().unwrap(), 2);
    assert_eq!(h2.nonce().unwrap(), 2);
    assert_eq!(
        h1.location().unwrap()[..64],
        h2.location().unwrap()[..64]
    );
}

#[test]
fn batch_rollback_restores_state() {
    let kit = TestKit::new("worldview-test");
    let dragon = kit.lathe.deploy(Arc::new(Dragon)).unwrap();
    let a = dragon.construct(vec![]).unwrap();
    let location = a.location().unwrap();

    kit.lathe.begin().unwrap();
    a.call("feed", vec![]).unwrap();
    a.call("feed", vec![]).unwrap();
    kit.lathe.rollback().unwrap();

    assert!(a.get("hunger").unwrap().deep_eq(&Value::from(10)));
    assert_eq!(a.location().unwrap(), location);
    assert_eq!(a.nonce().unwrap(), 1);
}

#[test]
fn batch_spans_multiple_entries_in_one_transaction() {
    let kit = TestKit::new("worldview-test");
    let dragon = kit.lathe.deploy(Arc::new(Dragon)).unwrap();
    let a = dragon.construct(vec![]).unwrap();
    let b = dragon.construct(vec![]).unwrap();
    let before = kit.chain.tx_count();

    kit.lathe.begin().unwrap();
    a.call("feed", vec![]).unwrap();
    b.call("feed", vec![]).unwrap();
    kit.lathe.publish().unwrap();

    assert_eq!(kit.chain.tx_count(), before + 1);
    assert!(a.get("hunger").unwrap().deep_eq(&Value::from(9)));
    assert!(b.get("hunger").unwrap().deep_eq(&Value::from(9)));
}

#[test]
fn export_returns_a_paid_signed_transaction() {
    let kit = TestKit::new("worldview-test");
    let dragon = kit.lathe.deploy(Arc::new(Dragon)).unwrap();
    let a = dragon.construct(vec![]).unwrap();

    kit.lathe.begin().unwrap();
    a.call("feed", vec![]).unwrap();
    let rawtx = kit.lathe.export().unwrap();
    let tx = lathe::Transaction::from_bytes(&rawtx).unwrap();
    // One jig input plus at least one payment input; anchor plus the jig
    // output plus change.
    assert!(tx.inputs.len() >= 2, "inputs: {}", tx.inputs.len());
    assert!(tx.outputs.len() >= 2, "outputs: {}", tx.outputs.len());
    assert!(tx.inputs.iter().all(|i| !i.script.is_empty()));

    // Nothing was broadcast; the batch can still be abandoned.
    kit.lathe.rollback().unwrap();
    assert!(a.get("hunger").unwrap().deep_eq(&Value::from(10)));
}

#[test]
fn empty_batch_cannot_publish() {
    let kit = TestKit::new("worldview-test");
    kit.lathe.begin().unwrap();
    let err = kit.lathe.publish().unwrap_err();
    assert!(err.to_string().contains("unavailable"), "{}", err);
}
