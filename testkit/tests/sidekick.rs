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

//! Sidekick code, dependency resolution and arbitrary objects.

use std::sync::Arc;

use lathe::sandbox::ClassDef;
use lathe::value::{ObjectRef, PropKey};
use lathe::{ClassKind, ClassManifest, Error, JigRef, MethodScope, Value};
use lathe_testkit::TestKit;

/// Plain sidekick class; deployed for jig use, immutable afterwards.
struct Point;

impl ClassDef for Point {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Point", ClassKind::Sidekick).static_method("zero")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "zero" => {
                // Sidekicks may compute but never store.
                scope.set("cached", Value::from(0))?;
                Ok(Value::Undefined)
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

/// Jig class that instantiates Point values through its dependency.
struct Canvas;

impl ClassDef for Canvas {
    fn manifest(&self) -> ClassManifest {
        ClassManifest::new("Canvas", ClassKind::Jig)
            .method("plot")
            .method("probe")
            .dep("Point")
    }

    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "plot" => {
                let class = match scope.dep("Point")? {
                    Value::Jig(class) => class,
                    other => return Err(Error::custom(format!("dep is {}", other.type_name()))),
                };
                let x = args.first().cloned().unwrap_or(Value::from(0));
                let y = args.get(1).cloned().unwrap_or(Value::from(0));
                scope.set("last", arb_point(class, x, y))?;
                Ok(Value::Undefined)
            }
            "probe" => {
                let name = match args.first() {
                    Some(Value::String(name)) => name.clone(),
                    _ => return Err(Error::custom("probe needs a name")),
                };
                scope.dep(&name)
            }
            other => Err(Error::custom(format!("no method {}", other))),
        }
    }
}

fn arb_point(class: JigRef, x: Value, y: Value) -> Value {
    let obj = ObjectRef::default();
    obj.borrow_mut().class = Some(class);
    obj.borrow_mut().props.insert(PropKey::new("x"), x);
    obj.borrow_mut().props.insert(PropKey::new("y"), y);
    Value::Object(obj)
}

#[test]
fn sidekicks_deploy_immutable() {
    let kit = TestKit::new("sidekick-test");
    let point = kit.lathe.deploy(Arc::new(Point)).unwrap();
    assert!(point.location().unwrap().ends_with("_o1"));

    let err = point.call("zero", vec![]).unwrap_err();
    assert!(err.to_string().contains("immutable"), "{}", err);
}

#[test]
fn arbitrary_objects_round_trip_through_a_peer() {
    let mut kit = TestKit::new("sidekick-test");
    let point = kit.lathe.deploy(Arc::new(Point)).unwrap();
    let canvas = kit
        .lathe
        .deploy_with_deps(Arc::new(Canvas), &[("Point", &point)])
        .unwrap();
    let jig = canvas.construct(vec![]).unwrap();
    jig.call("plot", vec![Value::from(3), Value::from(4)]).unwrap();

    let last = jig.get("last").unwrap();
    if let Value::Object(obj) = &last {
        assert!(obj.borrow().class.is_some());
        let x = obj.borrow().props.get(&PropKey::new("x")).cloned().unwrap();
        assert!(x.deep_eq(&Value::from(3)));
    } else {
        panic!("expected an arbitrary object, got {}", last.type_name());
    }

    let point_txid = point.origin().unwrap()[..64].to_owned();
    let canvas_txid = canvas.origin().unwrap()[..64].to_owned();
    let peer = kit.peer(&[&point_txid, &canvas_txid]);
    peer.lathe.register(Arc::new(Point));
    peer.lathe.register(Arc::new(Canvas));

    let loaded = peer.lathe.load(&jig.location().unwrap()).unwrap();
    let last = loaded.get("last").unwrap();
    if let Value::Object(obj) = &last {
        let class = obj.borrow().class.expect("arb class resolved");
        let _ = class;
        let y = obj.borrow().props.get(&PropKey::new("y")).cloned().unwrap();
        assert!(y.deep_eq(&Value::from(4)));
    } else {
        panic!("expected an arbitrary object after replay");
    }
}

#[test]
fn dependencies_resolve_by_name() {
    let kit = TestKit::new("sidekick-test");
    let point = kit.lathe.deploy(Arc::new(Point)).unwrap();
    let canvas = kit
        .lathe
        .deploy_with_deps(Arc::new(Canvas), &[("Point", &point)])
        .unwrap();
    let jig = canvas.construct(vec![]).unwrap();

    let resolved = jig.call("probe", vec![Value::from("Point")]).unwrap();
    assert!(matches!(resolved, Value::Jig(_)));

    // The native primitives resolve without being declared.
    let resolved = jig.call("probe", vec![Value::from("Jig")]).unwrap();
    assert!(matches!(resolved, Value::Jig(_)));
}

#[test]
fn banned_and_unknown_globals() {
    let kit = TestKit::new("sidekick-test");
    let point = kit.lathe.deploy(Arc::new(Point)).unwrap();
    let canvas = kit
        .lathe
        .deploy_with_deps(Arc::new(Canvas), &[("Point", &point)])
        .unwrap();
    let jig = canvas.construct(vec![]).unwrap();

    let err = jig.call("probe", vec![Value::from("Math")]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Math is not defined (disabled because non-deterministic)"
    );

    let err = jig.call("probe", vec![Value::from("Teleport")]).unwrap_err();
    assert_eq!(err.to_string(), "Teleport is not defined");
}
