use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use blobstream::{ClientId, PipelineConfig, Scene, SharedScene, UploadService};

const CLIENT: ClientId = 1;
const TIMEOUT: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start() -> (UploadService, SharedScene) {
    init_logger();
    let config = PipelineConfig {
        worker_threads: 2,
        progress_interval_ms: 0,
        lock_retry_ms: 1,
        ..PipelineConfig::default()
    };
    let scene = Scene::shared();
    let service = UploadService::new(config, scene.clone()).unwrap();
    (service, scene)
}

fn request(id: u64, params: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "receive-binary",
        "params": params,
    })
    .to_string()
}

/// One descriptor of `size` bytes.
fn single(size: usize, type_tag: &str) -> Value {
    json!([{"size": size, "type": type_tag}])
}

/// Immediate response to a `receive-binary` call, if any.
fn call(service: &UploadService, id: u64, params: Value) -> Option<Value> {
    service
        .handle_text(CLIENT, &request(id, params))
        .map(|message| parse(&message))
}

fn cancel(id: u64) -> String {
    json!({"jsonrpc": "2.0", "method": "cancel", "params": {"id": id}})
        .to_string()
}

fn parse(message: &str) -> Value {
    serde_json::from_str(message).unwrap()
}

/// Poll until the response for `client` arrives; returns the progress
/// notifications seen on the way and the response.
fn wait_response(
    service: &UploadService,
    client: ClientId,
) -> (Vec<Value>, Value) {
    let deadline = Instant::now() + TIMEOUT;
    let mut notifications = Vec::new();
    while Instant::now() < deadline {
        for outgoing in service.poll() {
            assert_eq!(outgoing.client, client);
            let message = parse(&outgoing.message);
            if message["method"] == "progress" {
                notifications.push(message);
            } else {
                return (notifications, message);
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("no response within {:?}", TIMEOUT);
}

fn error_code(response: &Value) -> i64 {
    response["error"]["code"].as_i64().unwrap()
}

#[test]
fn binary_frame_without_request_is_ignored() {
    let (service, _) = start();
    service.handle_binary(CLIENT, b"illegal");
    assert!(service.poll().is_empty());
}

#[test]
fn empty_params_are_missing() {
    let (service, _) = start();
    let response = call(&service, 1, json!([])).unwrap();
    assert_eq!(error_code(&response), -1731);
    assert!(response["error"].get("data").is_none());
}

#[test]
fn default_descriptor_is_missing_params() {
    let (service, _) = start();
    let response = call(&service, 1, json!([{}])).unwrap();
    assert_eq!(error_code(&response), -1731);
}

#[test]
fn zero_size_is_missing_params() {
    let (service, _) = start();
    let response = call(&service, 1, single(0, "xyz")).unwrap();
    assert_eq!(error_code(&response), -1731);
}

#[test]
fn unsupported_type() {
    let (service, _) = start();
    let response = call(&service, 1, single(4, "blub")).unwrap();
    assert_eq!(error_code(&response), -1732);
    assert_eq!(response["error"]["data"]["index"], 0);
    assert_eq!(
        response["error"]["data"]["supportedTypes"],
        json!(["obj", "xyz", "xyzb"])
    );
}

#[test]
fn first_unsupported_param_is_reported() {
    let (service, _) = start();
    let params = json!([
        {"size": 4, "type": "xyz"},
        {"size": 4, "type": "wrong"},
        {"size": 4, "type": "abc"},
    ]);
    let response = call(&service, 1, params).unwrap();
    assert_eq!(error_code(&response), -1732);
    assert_eq!(response["error"]["data"]["index"], 1);
}

#[test]
fn xyz_in_small_frames() {
    let (service, scene) = start();
    let payload: String = (0..200)
        .map(|i| format!("{} {} {}\n", i, i * 2, i * 3))
        .collect();

    let params =
        json!([{"size": payload.len(), "type": "xyz", "name": "monkey"}]);
    assert!(call(&service, 1, params).is_none());
    for chunk in payload.as_bytes().chunks(64) {
        service.handle_binary(CLIENT, chunk);
    }

    let (notifications, response) = wait_response(&service, CLIENT);
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"], true);
    let scene = scene.read().unwrap();
    assert_eq!(scene.len(), 1);
    let model = scene.models().next().unwrap();
    assert_eq!(model.geometry.primitive_count(), 200);

    for notification in &notifications {
        assert_eq!(notification["params"]["id"], 1);
        let amount = notification["params"]["amount"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&amount));
    }
}

#[test]
fn broken_xyz_reports_loader_message() {
    let (service, scene) = start();
    let payload = b"2.500000 3.437500\n";
    call(&service, 2, single(payload.len(), "xyz"));
    service.handle_binary(CLIENT, payload);

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(error_code(&response), -1734);
    assert_eq!(
        response["error"]["message"],
        "Invalid content in line 1: 2.500000 3.437500"
    );
    assert!(scene.read().unwrap().is_empty());
}

#[test]
fn cancel_before_any_byte() {
    let (service, _) = start();
    call(&service, 3, single(42, "xyz"));
    assert!(service.handle_text(CLIENT, &cancel(3)).is_none());

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(error_code(&response), -1);
    assert_eq!(response["error"]["message"], "Request cancelled");
}

#[test]
fn too_many_bytes() {
    let (service, _) = start();
    call(&service, 4, single(4, "xyz"));
    service.handle_binary(CLIENT, b"not_four_bytes");

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(error_code(&response), -1733);

    // the failed request is gone, a new one is accepted
    assert!(call(&service, 5, single(4, "xyz")).is_none());
}

#[test]
fn cancel_while_loading() {
    let (service, _) = start();
    call(&service, 6, single(4, "forever"));
    service.handle_binary(CLIENT, b"four");
    service.handle_text(CLIENT, &cancel(6));

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(response["id"], 6);
    assert_eq!(error_code(&response), -1);
}

#[test]
fn disconnect_cancels_pending_request() {
    let (service, _) = start();
    call(&service, 7, single(4, "forever"));
    service.handle_binary(CLIENT, b"four");
    service.client_disconnected(CLIENT);

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(error_code(&response), -1);
    assert_eq!(service.pending_requests(), 0);
}

#[test]
fn multiple_files() {
    let (service, scene) = start();
    let cloud = b"0 0 0\n1 1 1\n";
    let mesh = b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n";
    service.handle_text(
        CLIENT,
        &request(
            8,
            json!([
                {"size": cloud.len(), "type": "xyz", "name": "cloud"},
                {"size": mesh.len(), "type": "obj", "name": "mesh"},
            ]),
        ),
    );
    service.handle_binary(CLIENT, cloud);
    service.handle_binary(CLIENT, &mesh[..10]);
    service.handle_binary(CLIENT, &mesh[10..]);

    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(response["result"], true);
    let names: Vec<String> = scene
        .read()
        .unwrap()
        .models()
        .map(|model| model.name.clone())
        .collect();
    assert_eq!(names, vec!["cloud", "mesh"]);
}

#[test]
fn second_request_while_first_pending() {
    let (service, _) = start();
    let params = single(4, "xyz");
    assert!(call(&service, 9, params.clone()).is_none());

    let response = call(&service, 10, params.clone()).unwrap();
    assert_eq!(error_code(&response), -1730);
    assert_eq!(response["id"], 10);

    // another client is not affected
    assert!(service.handle_text(CLIENT + 1, &request(11, params)).is_none());
    assert_eq!(service.pending_requests(), 2);
}

#[test]
fn frames_after_completion_do_not_change_the_result() {
    let (service, _) = start();
    call(&service, 12, single(6, "xyz"));
    service.handle_binary(CLIENT, b"1 2 3\n");
    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(response["result"], true);

    service.handle_binary(CLIENT, b"4 5 6\n");
    thread::sleep(Duration::from_millis(20));
    assert!(service.poll().is_empty());
}

#[test]
fn receive_progress_reaches_its_weight() {
    let (service, _) = start();
    call(&service, 13, single(4, "forever"));
    service.handle_binary(CLIENT, b"fo");
    service.handle_binary(CLIENT, b"ur");

    let deadline = Instant::now() + TIMEOUT;
    let mut amounts = Vec::new();
    while Instant::now() < deadline && amounts.last() != Some(&0.5) {
        for outgoing in service.poll() {
            let message = parse(&outgoing.message);
            assert_eq!(message["method"], "progress");
            amounts.push(message["params"]["amount"].as_f64().unwrap());
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(amounts.last(), Some(&0.5));
    assert!(amounts.windows(2).all(|w| w[0] <= w[1]));

    service.handle_text(CLIENT, &cancel(13));
    let (_, response) = wait_response(&service, CLIENT);
    assert_eq!(error_code(&response), -1);
}
