//! A server configured for a single client rejects a second connect attempt
//! with `CLIENT_FULL`, then accepts one once the table has room again.

#![cfg(target_os = "macos")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

#[test]
fn second_connect_is_rejected_until_a_slot_frees_up() {
    let service_name = unique_service_name("client-full");
    let config = ServerConfig { max_clients: 1, ..ServerConfig::default() };

    let server = Server::create(&service_name, config, ServerCallbacks::new()).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let first = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(first.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);
    assert_eq!(server.client_count(), 1);

    let second = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(second.connect(&service_name, Duration::from_millis(2_000)), Status::CLIENT_FULL);
    assert!(!second.is_connected());
    assert_eq!(server.client_count(), 1);

    first.disconnect();
    first.destroy();

    // The server notices the first client's port died asynchronously; give
    // its receive loop a moment to process the dead-name notification and
    // free the slot.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(server.client_count(), 0);

    let third = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(third.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);
    assert_eq!(server.client_count(), 1);

    third.disconnect();
    third.destroy();
    second.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}
