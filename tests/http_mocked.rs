use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use cua_graph::action::DeviceOperation;
use cua_graph::cua::{ComputerTool, ModelInput, ModelRequest, ResponsesModel};
use cua_graph::device::{DeviceClient, DeviceConnector, DeviceInstance};
use cua_graph::{CuaClient, CuaConfig, CuaError, Environment, Message, ScrapybaraConnector};
use serde_json::{json, Value};

struct CapturedRequest {
    first_line: String,
    head: String,
    body: String,
}

fn read_request(socket: &mut std::net::TcpStream) -> CapturedRequest {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = socket.read(&mut buffer).expect("read request");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
        let text = String::from_utf8_lossy(&data).to_string();
        if let Some(split) = text.find("\r\n\r\n") {
            let head = &text[..split];
            let length = head
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            if data.len() >= split + 4 + length {
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&data).to_string();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    CapturedRequest {
        first_line: head.lines().next().unwrap_or_default().to_string(),
        head: head.to_string(),
        body: body.to_string(),
    }
}

fn spawn_server(responses: Vec<(u16, String)>) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let address = listener.local_addr().expect("listener addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().expect("accept");
            let request = read_request(&mut socket);
            tx.send(request).expect("send captured request");

            let status_text = match status {
                200 => "OK",
                404 => "Not Found",
                500 => "Internal Server Error",
                _ => "OK",
            };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                status_text,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).expect("write response");
            socket.flush().expect("flush");
        }
    });

    (format!("http://{}", address), rx)
}

fn spawn_single_response_server(status: u16, body: String) -> (String, mpsc::Receiver<CapturedRequest>) {
    spawn_server(vec![(status, body)])
}

fn cua_client(base: String) -> CuaClient {
    CuaClient::new(CuaConfig { api_base: base, api_key: "sk-test".into(), model: "computer-use-preview".into() })
        .expect("client")
}

#[tokio::test]
async fn responses_request_carries_tool_and_history() {
    let body = json!({
        "id": "resp_1",
        "output": [{
            "type": "computer_call",
            "id": "cu_1",
            "call_id": "call_1",
            "action": { "type": "screenshot" },
            "pending_safety_checks": [],
            "status": "completed"
        }]
    });
    let (base, captured) = spawn_single_response_server(200, body.to_string());

    let turn = cua_client(base)
        .respond(ModelRequest {
            input: ModelInput::History(vec![Message::user("open example.com")]),
            tool: ComputerTool::for_environment(Environment::Windows),
            previous_response_id: None,
        })
        .await
        .expect("respond");

    assert_eq!(turn.computer_call().map(|c| c.call_id.as_str()), Some("call_1"));

    let request = captured.recv().expect("captured");
    assert!(request.first_line.starts_with("POST /responses"), "{}", request.first_line);
    assert!(request.head.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    let sent: Value = serde_json::from_str(&request.body).expect("json body");
    assert_eq!(sent["model"], "computer-use-preview");
    assert_eq!(sent["tools"][0]["environment"], "windows");
    assert_eq!(sent["input"][0]["content"], "open example.com");
}

#[tokio::test]
async fn responses_http_error_is_a_model_error() {
    let (base, _captured) = spawn_single_response_server(500, r#"{"error":"boom"}"#.into());
    let err = cua_client(base)
        .respond(ModelRequest {
            input: ModelInput::History(vec![Message::user("hi")]),
            tool: ComputerTool::for_environment(Environment::Web),
            previous_response_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CuaError::Model(_)));
}

#[tokio::test]
async fn scrapybara_start_posts_instance_type_and_timeout() {
    let (base, captured) = spawn_single_response_server(200, json!({ "id": "inst-abc" }).to_string());
    let client = ScrapybaraConnector::new(base).connect("sb-key").expect("connect");
    let instance = client.start(Environment::Ubuntu, 2.0).await.expect("start");
    assert_eq!(instance.id(), "inst-abc");

    let request = captured.recv().expect("captured");
    assert!(request.first_line.starts_with("POST /start"), "{}", request.first_line);
    assert!(request.head.to_ascii_lowercase().contains("x-api-key: sb-key"));
    let sent: Value = serde_json::from_str(&request.body).expect("json body");
    assert_eq!(sent, json!({ "instance_type": "ubuntu", "timeout_hours": 2.0 }));
}

#[tokio::test]
async fn scrapybara_unknown_instance_is_not_found() {
    let (base, captured) = spawn_single_response_server(404, r#"{"detail":"Instance not found"}"#.into());
    let client = ScrapybaraConnector::new(base).connect("sb-key").expect("connect");
    let err = client.get("nope").await.err().expect("error");
    assert!(matches!(err, CuaError::NotFound(_)));
    assert!(captured.recv().expect("captured").first_line.starts_with("GET /instance/nope"));
}

#[tokio::test]
async fn scrapybara_instance_round_trip() {
    let (base, captured) = spawn_server(vec![
        (200, json!({ "id": "inst-1" }).to_string()),
        (200, json!({ "stream_url": "https://live.example/inst-1" }).to_string()),
        (200, json!({ "base_64_image": "iVBORw0KGgo=" }).to_string()),
        (200, json!({ "error": "element not interactable" }).to_string()),
        (200, json!({ "status": "ok" }).to_string()),
    ]);
    let client = ScrapybaraConnector::new(base).connect("sb-key").expect("connect");

    let instance = client.get("inst-1").await.expect("get");
    assert!(captured.recv().expect("get").first_line.starts_with("GET /instance/inst-1 "));

    assert_eq!(instance.stream_url().await.expect("stream url"), "https://live.example/inst-1");
    assert!(captured.recv().expect("stream").first_line.starts_with("GET /instance/inst-1/stream_url"));

    let op = DeviceOperation::TypeText { text: "hello".into() };
    let resp = instance.computer(&op).await.expect("computer");
    assert_eq!(resp.base_64_image.as_deref(), Some("iVBORw0KGgo="));
    let request = captured.recv().expect("computer");
    assert!(request.first_line.starts_with("POST /instance/inst-1/computer"));
    let sent: Value = serde_json::from_str(&request.body).expect("json body");
    assert_eq!(sent, json!({ "action": "type_text", "text": "hello" }));

    let err = instance.computer(&DeviceOperation::TakeScreenshot).await.unwrap_err();
    assert!(matches!(err, CuaError::Device(_)));
    captured.recv().expect("failed computer");

    instance.authenticate("auth-1").await.expect("authenticate");
    let request = captured.recv().expect("authenticate");
    assert!(
        request.first_line.starts_with("POST /instance/inst-1/browser/authenticate?auth_state_id=auth-1"),
        "{}",
        request.first_line
    );
}
