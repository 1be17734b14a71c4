//! A connected client notices its server going away: the dead-name
//! notification on the service port fires the client's disconnect callback
//! without the client having to find out via a failed send first.

#![cfg(target_os = "macos")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn client_observes_server_death_via_dead_name_notification() {
    let service_name = unique_service_name("server-death");

    let server = Server::create(&service_name, ServerConfig::default(), ServerCallbacks::new()).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let disconnected = Arc::new(AtomicBool::new(false));
    let disconnected_for_cb = Arc::clone(&disconnected);
    let callbacks = ClientCallbacks::new().with_on_disconnected(move || {
        disconnected_for_cb.store(true, Ordering::SeqCst);
    });
    let client = Client::create(ClientConfig::default(), callbacks);
    assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);
    assert!(client.is_connected());

    server.stop();
    let _ = server_thread.join();
    server.destroy();

    let saw_disconnect = wait_until(Duration::from_millis(2_000), || disconnected.load(Ordering::SeqCst));
    assert!(saw_disconnect, "client never observed the server's death");
    assert!(!client.is_connected());

    client.destroy();
}
