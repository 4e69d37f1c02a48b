//! End-to-end scenarios: frames pushed through a scripted socket into a
//! fresh registry.
//!
//! Run with: cargo test --test protocol_scenarios

use std::collections::VecDeque;
use std::time::Duration;

use glam::{Quat, Vec3};
use serde_json::{json, Value};
use vizlink::config::ConnectionConfig;
use vizlink::connection::{Connection, ConnectionState, SocketEvent, Transport};
use vizlink::dispatcher::{DispatchReport, Dispatcher, Effect};
use vizlink::error::{DispatchError, TransportError};
use vizlink::loader::{ImportedNode, LoadEvent, ManualLoader};
use vizlink::scene_graph::{SceneObject, SceneRegistry};

/// Socket that accepts every connection and replays queued events.
#[derive(Default)]
struct ScriptedSocket {
    opened: usize,
    sent: Vec<String>,
    events: VecDeque<SocketEvent>,
}

impl ScriptedSocket {
    fn push_frame(&mut self, frame: Value) {
        self.events.push_back(SocketEvent::Message(frame.to_string()));
    }
}

impl Transport for ScriptedSocket {
    fn open(&mut self, _url: &str) -> Result<(), TransportError> {
        self.opened += 1;
        self.events.push_back(SocketEvent::Open);
        Ok(())
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.sent.push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.events.push_back(SocketEvent::Close("closed locally".into()));
    }

    fn poll_event(&mut self) -> Option<SocketEvent> {
        self.events.pop_front()
    }
}

type Client = Connection<ScriptedSocket, ManualLoader>;

fn client() -> (Client, SceneRegistry) {
    let config = ConnectionConfig {
        reconnect_timeout_ms: 500,
        ..ConnectionConfig::default()
    };
    let mut registry = SceneRegistry::new();
    let mut connection = Connection::new(config, ScriptedSocket::default(), Dispatcher::new(ManualLoader::new()));
    connection.poll(Duration::ZERO, &mut registry);
    (connection, registry)
}

fn send(connection: &mut Client, registry: &mut SceneRegistry, frame: Value) -> DispatchReport {
    connection.transport_mut().push_frame(frame);
    let mut reports = connection.poll(Duration::ZERO, registry);
    assert_eq!(reports.len(), 1);
    reports.remove(0)
}

fn triangle_geometry(name: &str) -> Value {
    json!({
        "name": name,
        "type": "BufferGeometry",
        "data": {
            "attributes": {
                "position": {"itemSize": 3, "type": "Float32Array", "array": [0, 0, 0, 1, 0, 0, 0, 1, 0], "normalized": false}
            }
        }
    })
}

#[test]
fn unknown_keys_do_not_mutate() {
    let (mut conn, mut registry) = client();
    let names: Vec<String> = registry.names().into_iter().map(String::from).collect();

    let report = send(&mut conn, &mut registry, json!({"frobnicate": {"name": "x"}, "ping": 1}));

    assert!(!report.mutated());
    assert_eq!(report.errors().count(), 0);
    assert_eq!(registry.names(), names);
    assert!(!registry.needs_update());
}

#[test]
fn malformed_frame_is_dropped_and_socket_stays_open() {
    let (mut conn, mut registry) = client();
    conn.transport_mut().events.push_back(SocketEvent::Message("{\"add_mesh\": ".into()));
    let reports = conn.poll(Duration::from_millis(5), &mut registry);

    assert!(reports.is_empty());
    assert_eq!(conn.parse_errors(), 1);
    assert_eq!(conn.state(), ConnectionState::Open);
    assert_eq!(conn.connect_attempts(), 1);
}

#[test]
fn geometry_material_mesh_scenario() {
    let (mut conn, mut registry) = client();
    send(&mut conn, &mut registry, json!({"add_geometry": triangle_geometry("g1")}));
    send(
        &mut conn,
        &mut registry,
        json!({"add_material": {"name": "m1", "type": "MeshBasicMaterial", "color": 16711680}}),
    );
    let report = send(
        &mut conn,
        &mut registry,
        json!({"add_mesh": {"name": "obj1", "geometry_name": "g1", "material_name": "m1"}}),
    );
    assert_eq!(report.errors().count(), 0);

    let Some(SceneObject::Mesh(_, mesh)) = registry.get_by_name("obj1") else {
        panic!("obj1 is not a mesh");
    };
    assert_eq!(Some(mesh.geometry), registry.id_of("g1"));
    assert_eq!(Some(mesh.material), registry.id_of("m1"));

    let Some(SceneObject::Geometry(geometry)) = registry.get_by_name("g1") else {
        panic!("g1 is not a geometry");
    };
    assert_eq!(geometry.vertex_count(), 3);
    let Some(SceneObject::Material(material)) = registry.get_by_name("m1") else {
        panic!("m1 is not a material");
    };
    assert_eq!(material.color.to_hex(), 0xff0000);
}

#[test]
fn add_mesh_twice_replaces() {
    let (mut conn, mut registry) = client();
    let frame = json!({
        "add_geometry": triangle_geometry("g1"),
        "add_material": {"name": "m1", "type": "MeshBasicMaterial"},
        "add_mesh": {"name": "obj1", "geometry_name": "g1", "material_name": "m1", "parent_name": "scene"}
    });
    send(&mut conn, &mut registry, frame.clone());
    let first = registry.id_of("obj1").unwrap();
    let objects = registry.object_count();
    let report = send(&mut conn, &mut registry, frame);
    assert_eq!(registry.object_count(), objects);

    assert!(matches!(report.get("add_mesh"), Some(Ok(Effect::Registered { replaced: true, .. }))));
    let second = registry.id_of("obj1").unwrap();
    assert_ne!(first, second);
    assert!(registry.get(first).is_none());

    let root = registry.root();
    let meshes = registry
        .children_of(root)
        .iter()
        .filter(|&&id| registry.get(id).and_then(SceneObject::node).is_some_and(|n| n.name == "obj1"))
        .count();
    assert_eq!(meshes, 1);
}

#[test]
fn add_child_with_missing_end_does_nothing() {
    let (mut conn, mut registry) = client();
    send(&mut conn, &mut registry, json!({"add_object": {"name": "pivot", "object_type": "Group"}}));
    let pivot = registry.id_of("pivot").unwrap();

    let report = send(&mut conn, &mut registry, json!({"add_child": {"parent_name": "pivot", "child_name": "ghost"}}));
    assert_eq!(report.get("add_child"), Some(&Err(DispatchError::not_found("child", "ghost"))));
    let report = send(&mut conn, &mut registry, json!({"add_child": {"parent_name": "ghost", "child_name": "pivot"}}));
    assert_eq!(report.get("add_child"), Some(&Err(DispatchError::not_found("parent", "ghost"))));

    assert!(registry.children_of(pivot).is_empty());
    assert_eq!(registry.parent_of(pivot), None);
    assert!(!registry.needs_update());
}

#[test]
fn set_props_position_only() {
    let (mut conn, mut registry) = client();
    send(
        &mut conn,
        &mut registry,
        json!({
            "add_geometry": triangle_geometry("g1"),
            "add_material": {"name": "m1", "type": "MeshBasicMaterial", "color": 255},
            "add_mesh": {"name": "obj1", "geometry_name": "g1", "material_name": "m1", "quaternion": [0, 0.7071068, 0, 0.7071068], "scale": [2, 2, 2]}
        }),
    );
    let before = registry.get_by_name("obj1").unwrap().clone();
    registry.take_update();

    let report = send(&mut conn, &mut registry, json!({"set_props": {"name": "obj1", "position": [1, 2, 3]}}));
    assert!(matches!(
        report.get("set_props"),
        Some(Ok(Effect::PropsApplied { applied, .. })) if applied == &vec!["position"]
    ));

    let (SceneObject::Mesh(old, old_mesh), Some(SceneObject::Mesh(new, new_mesh))) =
        (&before, registry.get_by_name("obj1"))
    else {
        panic!("obj1 is not a mesh");
    };
    assert_eq!(new.position, Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(new.quaternion, old.quaternion);
    assert_eq!(new.scale, old.scale);
    assert_eq!(new_mesh, old_mesh);
    assert!(matches!(registry.get_by_name("m1"), Some(SceneObject::Material(m)) if m.color.to_hex() == 0x0000ff));
    assert!(registry.needs_update());
}

#[test]
fn legacy_typed_frames_move_objects() {
    let (mut conn, mut registry) = client();
    send(&mut conn, &mut registry, json!({"add_object": {"name": "sat", "object_type": "Group"}}));
    send(&mut conn, &mut registry, json!({"type": "set_position", "name": "sat", "data": [4, 5, 6]}));
    send(&mut conn, &mut registry, json!({"type": "set_quat", "name": "sat", "data": [0, 0, 0, 1]}));

    let node = registry.get_by_name("sat").unwrap().node().unwrap();
    assert_eq!(node.position, Vec3::new(4.0, 5.0, 6.0));
    assert_eq!(node.quaternion, Quat::IDENTITY);
}

#[test]
fn keys_apply_in_phase_order() {
    let (mut conn, mut registry) = client();
    // set_props and add_child reference objects created by other keys of the same frame
    let report = send(
        &mut conn,
        &mut registry,
        json!({
            "set_props": {"name": "obj1", "visible": false},
            "add_child": {"parent": "scene", "child": "obj1"},
            "add_mesh": {"name": "obj1", "geometry_name": "g1", "material_name": "m1"},
            "add_material": {"name": "m1", "type": "MeshNormalMaterial"},
            "add_geometry": {"name": "g1", "type": "PlaneGeometry", "width": 4, "height": 2}
        }),
    );
    assert_eq!(report.errors().count(), 0, "{:?}", report);

    let keys: Vec<&str> = report.entries.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["add_geometry", "add_material", "add_mesh", "add_child", "set_props"]);

    let id = registry.id_of("obj1").unwrap();
    assert!(registry.is_in_scene(id));
    assert!(!registry.get(id).unwrap().node().unwrap().visible);
}

#[test]
fn partial_failure_keeps_other_keys() {
    let (mut conn, mut registry) = client();
    let report = send(
        &mut conn,
        &mut registry,
        json!({
            "add_material": {"name": "bad", "type": "NotAMaterial"},
            "add_object": {"name": "grp", "object_type": "Group"}
        }),
    );
    assert!(matches!(report.get("add_material"), Some(Err(DispatchError::UnsupportedType { .. }))));
    assert!(report.get("add_object").is_some_and(|r| r.is_ok()));
    assert!(registry.contains("grp"));
    assert!(!registry.contains("bad"));
}

#[test]
fn reconnect_after_forced_close() {
    let (mut conn, mut registry) = client();
    assert_eq!(conn.transport().sent.len(), 1);

    conn.transport_mut().events.push_back(SocketEvent::Error("connection reset".into()));
    conn.poll(Duration::from_millis(1000), &mut registry);
    assert!(matches!(conn.state(), ConnectionState::Closed { .. }));
    assert_eq!(conn.next_reconnect(), Some(Duration::from_millis(1500)));

    conn.poll(Duration::from_millis(1499), &mut registry);
    assert_eq!(conn.transport().opened, 1);

    conn.poll(Duration::from_millis(1500), &mut registry);
    assert_eq!(conn.transport().opened, 2);
    assert_eq!(conn.connect_attempts(), 2);
    assert_eq!(conn.state(), ConnectionState::Open);

    let sent = &conn.transport().sent;
    assert_eq!(sent.len(), 2);
    let handshake: Value = serde_json::from_str(&sent[1]).unwrap();
    assert_eq!(handshake, json!({"type": "init", "client": "visualizer"}));

    // No further attempts while the socket stays open
    conn.poll(Duration::from_millis(5000), &mut registry);
    assert_eq!(conn.connect_attempts(), 2);
}

#[test]
fn load_animation_twice_keeps_one_action() {
    let (mut conn, mut registry) = client();
    let clip = |name: &str, x: f32| {
        json!({"name": name, "duration": 1, "tracks": [
            {"name": "pivot.position", "type": "vector", "times": [0, 1], "values": [x, 0, 0, x, 0, 0]}
        ]})
    };
    send(
        &mut conn,
        &mut registry,
        json!({
            "add_object": {"name": "pivot", "object_type": "Group", "parent_name": "scene"},
            "add_animation": clip("left", -1.0)
        }),
    );
    send(&mut conn, &mut registry, json!({"add_animation": clip("right", 1.0)}));

    let first = send(&mut conn, &mut registry, json!({"load_animation": {"clip_name": "left", "root_name": "scene"}}));
    assert!(matches!(first.get("load_animation"), Some(Ok(Effect::AnimationBound { replaced_action: false, .. }))));
    let second = send(&mut conn, &mut registry, json!({"load_animation": {"clip_name": "right", "root_name": "scene"}}));
    assert!(matches!(second.get("load_animation"), Some(Ok(Effect::AnimationBound { replaced_action: true, .. }))));

    let action = registry.mixer().active().unwrap();
    assert_eq!(Some(action.clip), registry.id_of("right"));

    registry.advance(0.25);
    let pivot = registry.get_by_name("pivot").unwrap().node().unwrap();
    assert_eq!(pivot.position, Vec3::new(1.0, 0.0, 0.0));
}

#[test]
fn gltf_load_registers_when_polled() {
    let (mut conn, mut registry) = client();
    let report = send(
        &mut conn,
        &mut registry,
        json!({"add_object": {"name": "station", "object_type": "GLTF", "path": "station.glb", "parent_name": "scene"}}),
    );
    let Some(Ok(Effect::LoadStarted { id, .. })) = report.get("add_object") else {
        panic!("expected load to start: {:?}", report);
    };
    let id = *id;
    assert!(!registry.contains("station"));

    let mut scene = ImportedNode::group("station");
    scene.children.push(ImportedNode::group("solar_panel"));
    conn.dispatcher_mut().loader_mut().push(LoadEvent::Loaded { id, scene });
    let reports = conn.poll(Duration::from_millis(20), &mut registry);

    assert_eq!(reports.len(), 1);
    let station = registry.id_of("station").unwrap();
    assert!(registry.is_in_scene(station));
    assert!(registry.find_in_subtree(station, "solar_panel").is_some());
    assert!(registry.needs_update());
}

#[test]
fn failed_gltf_load_stays_unregistered() {
    let (mut conn, mut registry) = client();
    let report = send(
        &mut conn,
        &mut registry,
        json!({"add_object": {"name": "wreck", "object_type": "GLTF", "path": "missing.glb"}}),
    );
    let Some(Ok(Effect::LoadStarted { id, .. })) = report.get("add_object") else {
        panic!("expected load to start");
    };
    let id = *id;

    conn.dispatcher_mut().loader_mut().push(LoadEvent::Failed {
        id,
        reason: "file not found".into(),
    });
    let reports = conn.poll(Duration::from_millis(20), &mut registry);

    assert!(matches!(reports[0].get("wreck"), Some(Err(DispatchError::Load { .. }))));
    assert!(!registry.contains("wreck"));
    assert_eq!(conn.dispatcher().pending_loads(), 0);
}
