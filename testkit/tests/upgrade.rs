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

//! Dynamic class replacement and forward sync.

use std::sync::Arc;

use lathe::sandbox::ClassDef;
use lathe::semver::Version;
use lathe::{ClassKind, ClassManifest, Error, MethodScope, Value};
use lathe_testkit::TestKit;

struct ApiV1;

impl ClassDef for ApiV1 {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Api", ClassKind::Jig)
            .version(Version::new(0, 1, 0))
            .method("answer")
    }

    fn invoke(
        &self,
        _scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "answer" => Ok(Value::from(1)),
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

struct ApiV2;

impl ClassDef for ApiV2 {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Api", ClassKind::Jig)
            .version(Version::new(0, 2, 0))
            .method("answer")
    }

    fn invoke(
        &self,
        _scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "answer" => Ok(Value::from(2)),
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

#[test]
fn upgrade_changes_behavior_in_place() {
    let kit = TestKit::new("upgrade-test");
    let class = kit.lathe.deploy(Arc::new(ApiV1)).unwrap();
    let jig = class.construct(vec![]).unwrap();
    assert!(jig.call("answer", vec![]).unwrap().deep_eq(&Value::from(1)));

    let nonce_before = class.nonce().unwrap();
    class.upgrade(Arc::new(ApiV2)).unwrap();
    assert_eq!(class.nonce().unwrap(), nonce_before + 1);

    // The live handle keeps identity but observes the new behavior.
    assert!(jig.call("answer", vec![]).unwrap().deep_eq(&Value::from(2)));
}

#[test]
fn loaded_snapshots_keep_old_behavior_until_synced() {
    let kit = TestKit::new("upgrade-test");
    let class = kit.lathe.deploy(Arc::new(ApiV1)).unwrap();
    let jig = class.construct(vec![]).unwrap();
    class.upgrade(Arc::new(ApiV2)).unwrap();

    // A snapshot loaded from the instance's origin still binds to v1.
    let old = kit.lathe.load(&jig.origin().unwrap()).unwrap();
    assert!(old.call("answer", vec![]).unwrap().deep_eq(&Value::from(1)));
    assert!(jig.call("answer", vec![]).unwrap().deep_eq(&Value::from(2)));
}

#[test]
fn destroyed_code_cannot_upgrade() {
    let kit = TestKit::new("upgrade-test");
    let class = kit.lathe.deploy(Arc::new(ApiV1)).unwrap();
    class.destroy().unwrap();
    let err = class.upgrade(Arc::new(ApiV2)).unwrap_err();
    assert_eq!(err.to_string(), "Cannot upgrade destroyed jig");
}

#[test]
fn sync_advances_to_the_tip() {
    let mut kit = TestKit::new("upgrade-test");
    let class = kit.lathe.deploy(Arc::new(ApiV1)).unwrap();
    let jig = class.construct(vec![]).unwrap();
    let deploy_txid = class.origin().unwrap()[..64].to_owned();
    let origin = jig.origin().unwrap();

    // Another host watches the same jig from its creation.
    let peer = kit.peer(&[&deploy_txid]);
    peer.lathe.register(Arc::new(ApiV1));
    let watched = peer.lathe.load(&origin).unwrap();
    assert_eq!(watched.nonce().unwrap(), 1);

    // Meanwhile the jig is destroyed on the first host; the peer only
    // catches up when it syncs.
    jig.destroy().unwrap();
    assert_eq!(watched.nonce().unwrap(), 1);

    watched.sync().unwrap();
    assert_eq!(watched.nonce().unwrap(), 2);
    assert!(watched.location().unwrap().contains("_d"));
    assert!(watched.owner().unwrap().deep_eq(&Value::Null));
    assert_eq!(watched.satoshis().unwrap(), 0);
}
