//! A client hands a shared-memory capability to the server, then asks it to
//! overwrite the region; the client reads the server's bytes back through
//! its own mapping of the same capability.

#![cfg(target_os = "macos")]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mach_ipc_fabric::{Client, ClientCallbacks, ClientConfig, Server, ServerCallbacks, ServerConfig, Status};
use mach_ipc_fabric::shmem::SharedMemoryHandle;

const SHARE_TYPE: u8 = 2;
const OVERWRITE_TYPE: u8 = 3;
const REGION_SIZE: usize = 1024 * 1024;

fn unique_service_name(tag: &str) -> String {
    format!("com.example.mach-ipc-fabric.test.{tag}.{}", uuid::Uuid::new_v4())
}

fn decode_size(bytes: &[u8]) -> usize {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw) as usize
}

#[test]
fn server_overwrites_a_capability_the_client_reads_back() {
    let service_name = unique_service_name("shmem");

    let mapped: Arc<Mutex<Option<SharedMemoryHandle>>> = Arc::new(Mutex::new(None));
    let mapped_for_share = Arc::clone(&mapped);
    let mapped_for_overwrite = Arc::clone(&mapped);

    let callbacks = ServerCallbacks::new()
        .with_on_message_with_reply(move |_client, remote_port, msg_type, bytes| match msg_type {
            SHARE_TYPE => {
                let size = decode_size(bytes);
                let port = remote_port.expect("share message must carry a capability port");
                match SharedMemoryHandle::map(port, size) {
                    Ok(handle) => {
                        *mapped_for_share.lock().expect("mapped lock poisoned") = Some(handle);
                        (Vec::new(), Status::SUCCESS)
                    }
                    Err(_) => (Vec::new(), Status::INTERNAL),
                }
            }
            OVERWRITE_TYPE => {
                let guard = mapped_for_overwrite.lock().expect("mapped lock poisoned");
                match guard.as_ref() {
                    Some(handle) => {
                        let message = b"overwritten by server";
                        // SAFETY: this test holds the only writer on either side
                        // while the overwrite message is in flight.
                        unsafe {
                            std::ptr::copy_nonoverlapping(message.as_ptr(), handle.data(), message.len());
                        }
                        (Vec::new(), Status::SUCCESS)
                    }
                    None => (Vec::new(), Status::INTERNAL),
                }
            }
            other => panic!("unexpected message type {other}"),
        });
    let server = Server::create(&service_name, ServerConfig::default(), callbacks).expect("server create");
    let server_thread_handle = Arc::clone(&server);
    let server_thread = thread::spawn(move || server_thread_handle.run());

    let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
    assert_eq!(client.connect(&service_name, Duration::from_millis(2_000)), Status::SUCCESS);

    let owner = SharedMemoryHandle::create(REGION_SIZE).expect("create shared region");
    let seed = b"hello from the client";
    // SAFETY: only this thread touches the owner mapping before the
    // capability is handed off.
    unsafe {
        std::ptr::copy_nonoverlapping(seed.as_ptr(), owner.data(), seed.len());
    }

    let (status, _) = client.send_with_capability_and_reply(&owner, SHARE_TYPE, Duration::from_millis(2_000));
    assert_eq!(status, Status::SUCCESS);

    let (status, _) = client.send_with_reply(OVERWRITE_TYPE, &[], Duration::from_millis(2_000));
    assert_eq!(status, Status::SUCCESS);

    // SAFETY: the server has finished its write by the time the ack above
    // returned, and only this thread reads the owner mapping now.
    let observed = unsafe { std::slice::from_raw_parts(owner.data(), "overwritten by server".len()) };
    assert_eq!(observed, b"overwritten by server");

    drop(owner);

    client.disconnect();
    client.destroy();
    server.stop();
    let _ = server_thread.join();
    server.destroy();
}
