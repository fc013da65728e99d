use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tempdir::TempDir;

use blobstream::scene::{Geometry, Model};
use blobstream::{ClientId, PipelineConfig, Scene, SharedScene, UploadService};

const CLIENT: ClientId = 3;
const TIMEOUT: Duration = Duration::from_secs(10);

fn start(replace_scene: bool) -> (UploadService, SharedScene) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PipelineConfig {
        worker_threads: 1,
        progress_interval_ms: 0,
        lock_retry_ms: 1,
        replace_scene,
        ..PipelineConfig::default()
    };
    let scene = Scene::shared();
    let service = UploadService::new(config, scene.clone()).unwrap();
    (service, scene)
}

fn upload_path(id: u64, paths: &[String]) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "upload-path",
        "params": paths,
    })
    .to_string()
}

fn cancel(id: u64) -> String {
    json!({"jsonrpc": "2.0", "method": "cancel", "params": {"id": id}})
        .to_string()
}

fn parse(message: &str) -> Value {
    serde_json::from_str(message).unwrap()
}

fn wait_response(service: &UploadService) -> Value {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        for outgoing in service.poll() {
            let message = parse(&outgoing.message);
            if message.get("method").is_none() {
                return message;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("no response within {:?}", TIMEOUT);
}

fn path_string(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).display().to_string()
}

fn model_names(scene: &SharedScene) -> Vec<String> {
    scene
        .read()
        .unwrap()
        .models()
        .map(|model| model.name.clone())
        .collect()
}

#[test]
fn missing_path_is_invalid() {
    let dir = TempDir::new("upload_path").unwrap();
    let (service, _) = start(true);
    let request = upload_path(1, &[path_string(&dir, "nope.xyz")]);
    let response = parse(&service.handle_text(CLIENT, &request).unwrap());
    assert_eq!(response["error"]["code"], -1736);
}

#[test]
fn unsupported_file_reports_index() {
    let dir = TempDir::new("upload_path").unwrap();
    fs::write(dir.path().join("a.xyz"), "1 2 3\n").unwrap();
    fs::write(dir.path().join("b.txt"), "text").unwrap();
    let (service, _) = start(true);

    let paths = [path_string(&dir, "a.xyz"), path_string(&dir, "b.txt")];
    let response =
        parse(&service.handle_text(CLIENT, &upload_path(2, &paths)).unwrap());
    assert_eq!(response["error"]["code"], -1732);
    assert_eq!(response["error"]["data"]["index"], 1);
}

#[test]
fn directory_is_only_scanned_by_the_task() {
    let dir = TempDir::new("upload_path").unwrap();
    let notes = dir.path().join("notes");
    for i in 0..20 {
        let sub = notes.join(format!("sub{:02}", i));
        fs::create_dir_all(&sub).unwrap();
        for j in 0..100 {
            fs::write(sub.join(format!("{}.txt", j)), "text").unwrap();
        }
    }
    fs::write(dir.path().join("cloud.xyz"), "1 2 3\n").unwrap();
    let (service, scene) = start(true);

    // accepted at once: the walk that finds no loader runs on a worker
    let paths = [path_string(&dir, "cloud.xyz"), path_string(&dir, "notes")];
    assert!(service.handle_text(CLIENT, &upload_path(3, &paths)).is_none());

    let response = wait_response(&service);
    assert_eq!(response["error"]["code"], -1732);
    assert_eq!(response["error"]["data"]["index"], 1);
    assert_eq!(model_names(&scene), vec!["cloud.xyz"]);
}

#[test]
fn directory_and_file_are_loaded() {
    let dir = TempDir::new("upload_path").unwrap();
    let clouds = dir.path().join("clouds");
    fs::create_dir(&clouds).unwrap();
    fs::write(clouds.join("a.xyz"), "1 2 3\n").unwrap();
    fs::write(clouds.join("b.xyz"), "1 2 3\n4 5 6\n").unwrap();
    fs::write(clouds.join("c.obj"), "v 0 0 0\n").unwrap();
    fs::write(
        dir.path().join("tri.obj"),
        "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n",
    )
    .unwrap();

    let (service, scene) = start(true);
    scene.write().unwrap().add_model(Model {
        name: "previous".to_owned(),
        type_tag: "xyz".to_owned(),
        geometry: Geometry::Spheres(Vec::new()),
    });

    let paths = [path_string(&dir, "clouds"), path_string(&dir, "tri.obj")];
    assert!(service.handle_text(CLIENT, &upload_path(4, &paths)).is_none());
    let response = wait_response(&service);
    assert_eq!(response["result"], true);
    assert_eq!(model_names(&scene), vec!["a.xyz", "b.xyz", "tri.obj"]);
}

#[test]
fn keep_scene_when_not_replacing() {
    let dir = TempDir::new("upload_path").unwrap();
    fs::write(dir.path().join("a.xyz"), "1 2 3\n").unwrap();
    let (service, scene) = start(false);

    for id in 0..2 {
        let request = upload_path(id, &[path_string(&dir, "a.xyz")]);
        service.handle_text(CLIENT, &request);
        assert_eq!(wait_response(&service)["result"], true);
    }
    assert_eq!(scene.read().unwrap().len(), 2);
}

#[test]
fn cancel_while_scene_is_busy() {
    let dir = TempDir::new("upload_path").unwrap();
    fs::write(dir.path().join("a.xyz"), "1 2 3\n").unwrap();
    let (service, scene) = start(true);

    // a render pass holding the scene keeps the load waiting
    let render = scene.read().unwrap();
    let request = upload_path(5, &[path_string(&dir, "a.xyz")]);
    assert!(service.handle_text(CLIENT, &request).is_none());
    thread::sleep(Duration::from_millis(20));
    assert!(service.handle_text(CLIENT, &cancel(5)).is_none());

    let response = wait_response(&service);
    assert_eq!(response["id"], 5);
    assert_eq!(response["error"]["code"], -1);
    assert_eq!(response["error"]["message"], "Request cancelled");
    assert!(render.is_empty());
    drop(render);
    assert!(scene.read().unwrap().is_empty());
}
