//! The server takes longer to reply than the client is willing to wait: the
//! client must see `TIMEOUT`, and the waiter pool must return to baseline
//! once the late ack eventually arrives and is rejected.

#![cfg(target_os = "macos")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};

const SLOW_TYPE: u8 = 7;

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

#[test]
fn slow_server_reply_times_out_at_the_client() {
    let service_name = unique_service_name("timeout");

    let callbacks = ServerCallbacks::new().with_on_message_with_reply(|_client, _remote_port, msg_type, bytes| {
        assert_eq!(msg_type, SLOW_TYPE);
        thread::sleep(Duration::from_millis(150));
        (bytes.to_vec(), Status::SUCCESS)
    });
    let server = Server::create(&service_name, ServerConfig::default(), callbacks).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);

    let (status, reply) = client.send_with_reply(SLOW_TYPE, b"slow", Duration::from_millis(20));
    assert_eq!(status, Status::TIMEOUT);
    assert!(reply.is_empty());

    // Give the late ack time to arrive and be rejected by the registry; a
    // second, unrelated round trip afterward proves the waiter pool is back
    // at baseline rather than stuck on the stale slot.
    thread::sleep(Duration::from_millis(300));
    let (status, reply) = client.send_with_reply(SLOW_TYPE, b"again", Duration::from_millis(2_000));
    assert_eq!(status, Status::SUCCESS);
    assert_eq!(reply, b"again");

    client.disconnect();
    client.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}

#[test]
fn zero_timeout_fails_unless_already_queued() {
    let service_name = unique_service_name("zero-timeout");

    let callbacks =
        ServerCallbacks::new().with_on_message_with_reply(|_c, _r, _t, bytes| (bytes.to_vec(), Status::SUCCESS));
    let server = Server::create(&service_name, ServerConfig::default(), callbacks).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);

    let (status, _reply) = client.send_with_reply(SLOW_TYPE, b"x", Duration::from_millis(0));
    assert_eq!(status, Status::TIMEOUT);

    client.disconnect();
    client.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}
