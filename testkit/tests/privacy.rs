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

//! Private-name isolation between jigs.

use std::sync::Arc;

use lathe::sandbox::ClassDef;
use lathe::{ClassKind, ClassManifest, Error, MethodScope, Value};
use lathe_testkit::TestKit;

/// `class Secretive { init() { this._x = 1 } check() { return '_x' in this } }`
struct Secretive;

impl ClassDef for Secretive {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Secretive", ClassKind::Jig)
            .method("init")
            .method("check")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "init" => {
                scope.set("_x", Value::from(1))?;
                Ok(Value::Undefined)
            }
            "check" => Ok(Value::Bool(scope.has("_x")?)),
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

/// `class Snoop { peek(target) { return '_x' in target } }`
struct Snoop;

impl ClassDef for Snoop {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Snoop", ClassKind::Jig).method("peek")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "peek" => {
                let target = args.first().cloned().unwrap_or(Value::Undefined);
                Ok(Value::Bool(scope.has_of(&target, "_x")?))
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

#[test]
fn foreign_jigs_cannot_check_private_properties() {
    let kit = TestKit::new("privacy-test");
    let secretive = kit.lathe.deploy(Arc::new(Secretive)).unwrap();
    let snoop = kit.lathe.deploy(Arc::new(Snoop)).unwrap();
    let s = secretive.construct(vec![]).unwrap();
    let p = snoop.construct(vec![]).unwrap();

    let err = p
        .call("peek", vec![Value::Jig(s.jig_ref())])
        .unwrap_err();
    assert_eq!(err.to_string(), "Cannot check private property _x");
}

#[test]
fn own_class_sees_its_private_properties() {
    let kit = TestKit::new("privacy-test");
    let secretive = kit.lathe.deploy(Arc::new(Secretive)).unwrap();
    let s = secretive.construct(vec![]).unwrap();
    let seen = s.call("check", vec![]).unwrap();
    assert!(seen.deep_eq(&Value::Bool(true)));
}

#[test]
fn host_reflection_is_not_filtered() {
    let kit = TestKit::new("privacy-test");
    let secretive = kit.lathe.deploy(Arc::new(Secretive)).unwrap();
    let s = secretive.construct(vec![]).unwrap();

    // Host code sits outside jig-to-jig privacy.
    assert!(s.has("_x").unwrap());
    assert!(s.get("_x").unwrap().deep_eq(&Value::from(1)));
    assert!(s.keys().unwrap().contains(&"_x".to_owned()));
}

#[test]
fn foreign_key_listings_omit_private_names() {
    let kit = TestKit::new("privacy-test");
    let secretive = kit.lathe.deploy(Arc::new(Secretive)).unwrap();
    let snoop = kit.lathe.deploy(Arc::new(Snoop)).unwrap();
    let s = secretive.construct(vec![]).unwrap();
    let _p = snoop.construct(vec![]).unwrap();

    // The same jig seen through a foreign method scope hides _x; the
    // public check method sees it.
    assert!(s.call("check", vec![]).unwrap().deep_eq(&Value::Bool(true)));
    let keys = s.keys().unwrap();
    assert!(keys.contains(&"location".to_owned()));
}

#[test]
fn private_methods_do_not_dispatch_for_foreigners() {
    struct Reserved;
    impl ClassDef for Reserved {
        fn manifest(&self) -> ClassManifest {
            ClassManifest::new("Reserved", ClassKind::Jig).method("_hidden")
        }
        fn invoke(
            &self,
            _scope: &mut MethodScope<'_>,
            method: &str,
            _args: &[Value],
        ) -> Result<Value, Error> {
            Err(Error::custom(format!("unexpected dispatch of {}", method)))
        }
    }

    let kit = TestKit::new("privacy-test");
    let class = kit.lathe.deploy(Arc::new(Reserved)).unwrap();
    let jig = class.construct(vec![]).unwrap();
    let err = jig.call("_hidden", vec![]).unwrap_err();
    assert_eq!(err.to_string(), "Cannot call private property _hidden");
}
