//! Three clients connect; a broadcast reaches each of them exactly once.

#![cfg(target_os = "macos")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};

const BROADCAST_TYPE: u8 = 9;

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

#[test]
fn broadcast_reaches_every_connected_client_exactly_once() {
    let service_name = unique_service_name("broadcast");

    let server = Server::create(&service_name, ServerConfig::default(), ServerCallbacks::new()).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let received_counts: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let barrier = Arc::new(Barrier::new(4));

    let clients: Vec<_> = received_counts
        .iter()
        .map(|count| {
            let count = Arc::clone(count);
            let callbacks = ClientCallbacks::new().with_on_message(move |msg_type, _bytes| {
                assert_eq!(msg_type, BROADCAST_TYPE);
                count.fetch_add(1, Ordering::SeqCst);
            });
            let client = Client::create(ClientConfig::default(), callbacks);
            assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);
            client
        })
        .collect();

    assert_eq!(server.client_count(), 3);

    // A fourth client triggers the broadcast, then is not itself a recipient.
    let broadcaster = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(broadcaster.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);
    let broadcast_status = server.broadcast(BROADCAST_TYPE, b"go");
    assert_eq!(broadcast_status, Status::SUCCESS);

    // Give the per-client serial queues time to run the callback.
    thread::sleep(Duration::from_millis(200));
    let _ = barrier;

    for count in &received_counts {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    broadcaster.disconnect();
    broadcaster.destroy();
    for client in clients {
        client.disconnect();
        client.destroy();
    }
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}
