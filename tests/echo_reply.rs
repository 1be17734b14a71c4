//! End-to-end echo scenario: a client's reply-bearing send gets back exactly
//! the bytes the server's handler echoes, carrying a user-range status.

#![cfg(target_os = "macos")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mach_ipc_fabric::status::USER_BASE;
use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};

const ECHO_TYPE: u8 = 1;

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

#[test]
fn echo_reply_returns_same_bytes_with_user_status() {
    let service_name = unique_service_name("echo");

    let callbacks = ServerCallbacks::new().with_on_message_with_reply(|_client, _remote_port, msg_type, bytes| {
        assert_eq!(msg_type, ECHO_TYPE);
        (bytes.to_vec(), Status::from_raw(USER_BASE + 1))
    });
    let server = Server::create(&service_name, ServerConfig::default(), callbacks).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
    let connect_status = client.connect(&service_name, Duration::from_millis(2_000));
    assert_eq!(connect_status, Status::SUCCESS);

    let (status, reply) = client.send_with_reply(ECHO_TYPE, b"Hello", Duration::from_millis(2_000));
    assert_eq!(status, Status::from_raw(USER_BASE + 1));
    assert_eq!(reply, b"Hello");

    client.disconnect();
    client.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}

#[test]
fn empty_payload_round_trips_in_both_directions() {
    let service_name = unique_service_name("echo-empty");

    let callbacks = ServerCallbacks::new()
        .with_on_message_with_reply(|_client, _remote_port, _msg_type, bytes| (bytes.to_vec(), Status::SUCCESS));
    let server = Server::create(&service_name, ServerConfig::default(), callbacks).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);

    let (status, reply) = client.send_with_reply(ECHO_TYPE, &[], Duration::from_millis(2_000));
    assert_eq!(status, Status::SUCCESS);
    assert!(reply.is_empty());

    client.disconnect();
    client.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}
