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

//! Deploy–publish–load round trips.

use std::sync::Arc;

use lathe::{ClassKind, ClassManifest, Error, MethodScope, Value};
use lathe_testkit::TestKit;
use pretty_assertions::assert_eq;

/// `class Counter { static bump() { this.n = (this.n || 0) + 1 } }`
struct Counter;

impl lathe::sandbox::ClassDef for Counter {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Counter", ClassKind::Jig).static_method("bump")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "bump" => {
                let n = match scope.get("n")? {
                    Value::Number(n) => n,
                    _ => 0.0,
                };
                scope.set("n", Value::Number(n + 1.0))?;
                scope.get("n")
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

fn txid_of(location: &str) -> String {
    location[..64].to_owned()
}

#[test]
fn deploy_assigns_bindings() {
    let kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();

    let location = class.location().unwrap();
    assert!(location.ends_with("_o1"), "location: {}", location);
    assert_eq!(class.origin().unwrap(), location);
    assert_eq!(class.nonce().unwrap(), 1);
    assert!(matches!(class.owner().unwrap(), Value::String(_)));
}

#[test]
fn static_call_advances_state() {
    let kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    let origin = class.origin().unwrap();

    let result = class.call("bump", vec![]).unwrap();
    assert!(result.deep_eq(&Value::Number(1.0)));

    assert!(class.get("n").unwrap().deep_eq(&Value::Number(1.0)));
    assert_eq!(class.nonce().unwrap(), 2);
    let location = class.location().unwrap();
    assert_ne!(location, origin);
    assert_eq!(class.origin().unwrap(), origin);
}

#[test]
fn cold_cache_load_reproduces_state() {
    let mut kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    class.call("bump", vec![]).unwrap();
    let location = class.location().unwrap();
    let deploy_txid = txid_of(&class.origin().unwrap());

    // A second host: same chain, cold cache, fresh keys. It must trust
    // the deploy transaction and hold the class definition locally.
    let peer = kit.peer(&[&deploy_txid]);
    peer.lathe.register(Arc::new(Counter));

    let loaded = peer.lathe.load(&location).unwrap();
    assert!(loaded.get("n").unwrap().deep_eq(&Value::Number(1.0)));
    assert_eq!(loaded.nonce().unwrap(), 2);
    assert_eq!(loaded.location().unwrap(), location);
    assert_eq!(loaded.origin().unwrap(), class.origin().unwrap());
}

#[test]
fn untrusted_code_is_refused_and_ban_clears_on_trust() {
    let mut kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    let location = class.location().unwrap();
    let deploy_txid = txid_of(&location);

    let peer = kit.peer(&[]);
    peer.lathe.register(Arc::new(Counter));

    let err = peer.lathe.load(&location).unwrap_err();
    assert!(
        err.to_string().contains("Cannot load untrusted code"),
        "unexpected error: {}",
        err
    );

    // The failure is remembered...
    let err = peer.lathe.load(&location).unwrap_err();
    assert!(err.to_string().contains("Banned location"), "{}", err);

    // ...until the txid becomes trusted.
    peer.lathe.trust(&deploy_txid).unwrap();
    let loaded = peer.lathe.load(&location).unwrap();
    assert_eq!(loaded.nonce().unwrap(), 1);
}

#[test]
fn load_without_local_definition_fails() {
    let mut kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    let location = class.location().unwrap();

    let peer = kit.peer(&["*"]);
    let err = peer.lathe.load(&location).unwrap_err();
    assert!(err.to_string().contains("is not installed"), "{}", err);
}

#[test]
fn import_implicitly_trusts() {
    let mut kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    let location = class.location().unwrap();
    let deploy_txid = txid_of(&location);

    let peer = kit.peer(&[]);
    peer.lathe.register(Arc::new(Counter));

    let rawtx = {
        use lathe::chain::adapters::Blockchain;
        let txid: lathe::Txid = deploy_txid.parse().unwrap();
        kit.chain.fetch(&txid).unwrap()
    };
    let imported = peer.lathe.import(&rawtx).unwrap();
    assert_eq!(imported.to_hex(), deploy_txid);

    // No explicit trust was granted, yet the jig is live.
    let loaded = peer.lathe.load(&location).unwrap();
    assert_eq!(loaded.nonce().unwrap(), 1);
}

#[test]
fn pure_reads_publish_nothing() {
    let kit = TestKit::new("deploy-test");
    let class = kit.lathe.deploy(Arc::new(Counter)).unwrap();
    let before = kit.chain.tx_count();
    let n = class.get("n").unwrap();
    assert!(n.deep_eq(&Value::Undefined));
    assert_eq!(kit.chain.tx_count(), before);
}
