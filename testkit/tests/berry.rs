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

//! Berries: foreign-data values pinned by content hash.

use std::sync::Arc;

use lathe::sandbox::{BerryDef, BerryFetch, ClassDef};
use lathe::value::{ObjectRef, PropKey};
use lathe::{ClassKind, ClassManifest, Error, MethodScope, Value};
use lathe_testkit::TestKit;

/// A berry class mirroring a raw transaction by txid.
struct TxMirror;

impl ClassDef for TxMirror {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("TxMirror", ClassKind::Berry)
    }

    fn invoke(
        &self,
        _scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        Err(Error::custom(format!("no method {}", method)))
    }
}

impl BerryDef for TxMirror {
    fn pluck(&self, path: &str, fetch: &mut dyn BerryFetch) -> Result<Value, Error> {
        let rawtx = fetch.fetch(path)?;
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("path"), Value::from(path));
        obj.borrow_mut().props.insert(PropKey::new("rawtx"), rawtx);
        Ok(Value::Object(obj))
    }
}

#[test]
fn plucked_berries_are_pinned_and_immutable() {
    let kit = TestKit::new("berry-test");
    let class = kit.lathe.deploy_berry(Arc::new(TxMirror), &[]).unwrap();
    let class_location = class.location().unwrap();
    let target_txid = class_location[..64].to_owned();

    let partial = format!("{}?berry={}", class_location, target_txid);
    let berry = kit.lathe.load(&partial).unwrap();

    // The pinned location carries the state hash and the version.
    let location = berry.location().unwrap();
    assert!(location.starts_with(&class_location));
    assert!(location.contains("&hash="), "location: {}", location);
    assert!(location.contains("&version=5"), "location: {}", location);

    assert!(berry.get("path").unwrap().deep_eq(&Value::from(target_txid)));
    assert!(matches!(berry.get("rawtx").unwrap(), Value::String(_)));
    assert_eq!(berry.nonce().unwrap(), 1);
    assert!(berry.owner().unwrap().deep_eq(&Value::Null));
    assert_eq!(berry.satoshis().unwrap(), 0);

    // Berries cannot be spent or destroyed.
    let err = berry.destroy().unwrap_err();
    assert!(err.to_string().contains("unavailable"), "{}", err);
    let err = berry.auth().unwrap_err();
    assert!(err.to_string().contains("unavailable"), "{}", err);
}

#[test]
fn repeated_loads_alias_the_pinned_berry() {
    let kit = TestKit::new("berry-test");
    let class = kit.lathe.deploy_berry(Arc::new(TxMirror), &[]).unwrap();
    let class_location = class.location().unwrap();
    let target_txid = class_location[..64].to_owned();

    let partial = format!("{}?berry={}", class_location, target_txid);
    let first = kit.lathe.load(&partial).unwrap();
    let second = kit.lathe.load(&partial).unwrap();
    assert_eq!(first.jig_ref(), second.jig_ref());

    let pinned = kit.lathe.load(&first.location().unwrap()).unwrap();
    assert_eq!(pinned.jig_ref(), first.jig_ref());
}

#[test]
fn jigs_may_reference_berries() {
    struct Keeper;
    impl ClassDef for Keeper {
        fn manifest(&self) -> ClassManifest {
            ClassManifest::new("Keeper", ClassKind::Jig).method("keep")
        }
        fn invoke(
            &self,
            scope: &mut MethodScope<'_>,
            method: &str,
            args: &[Value],
        ) -> Result<Value, Error> {
            match method {
                "keep" => {
                    let berry = args.first().cloned().unwrap_or(Value::Undefined);
                    scope.set("berry", berry)?;
                    Ok(Value::Undefined)
                }
                other => Err(Error::custom(format!("no method {}", other))),
            }
        }
    }

    let kit = TestKit::new("berry-test");
    let berry_class = kit.lathe.deploy_berry(Arc::new(TxMirror), &[]).unwrap();
    let keeper_class = kit.lathe.deploy(Arc::new(Keeper)).unwrap();
    let class_location = berry_class.location().unwrap();
    let target_txid = class_location[..64].to_owned();
    let berry = kit
        .lathe
        .load(&format!("{}?berry={}", class_location, target_txid))
        .unwrap();

    let keeper = keeper_class.construct(vec![]).unwrap();
    keeper
        .call("keep", vec![Value::Jig(berry.jig_ref())])
        .unwrap();
    assert!(matches!(keeper.get("berry").unwrap(), Value::Jig(_)));
}
