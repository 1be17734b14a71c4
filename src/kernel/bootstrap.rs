//! Bootstrap name service: check-in (server) and look-up (client) of a
//! printable service name. Grounded on `original_source/src/server.c`
//! (`bootstrap_check_in`) and `client.c` (`bootstrap_look_up`).

#![cfg(target_os = "macos")]

use std::ffi::CString;

use mach2::bootstrap::{bootstrap_check_in, bootstrap_look_up, bootstrap_port};
use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_name_t;

use super::{KernelError, KernelResult};
use super::port::{PortId, PortRight};

/// Register `name` with the bootstrap service and receive back a receive
/// right other processes can look up and send to.
pub fn check_in(name: &str) -> KernelResult<PortId> {
    let cname = CString::new(name).map_err(|_| KernelError::BootstrapCheckIn {
        name: name.to_string(),
        code: -1,
    })?;
    let mut port: mach_port_name_t = 0;
    // SAFETY: `bootstrap_port` is the process's standing bootstrap send
    // right; `cname` is a valid NUL-terminated C string for the call's
    // duration; `port` is an out-param.
    let kr = unsafe { bootstrap_check_in(bootstrap_port, cname.as_ptr(), &mut port) };
    if kr != KERN_SUCCESS {
        return Err(KernelError::BootstrapCheckIn { name: name.to_string(), code: kr });
    }
    Ok(PortId::from_raw(port, PortRight::Receive))
}

/// Look up a service name registered by a server's `check_in`, receiving a
/// send right to it.
pub fn look_up(name: &str) -> KernelResult<PortId> {
    let cname = CString::new(name).map_err(|_| KernelError::BootstrapLookup {
        name: name.to_string(),
        code: -1,
    })?;
    let mut port: mach_port_name_t = 0;
    // SAFETY: same contract as `check_in`.
    let kr = unsafe { bootstrap_look_up(bootstrap_port, cname.as_ptr(), &mut port) };
    if kr != KERN_SUCCESS {
        return Err(KernelError::BootstrapLookup { name: name.to_string(), code: kr });
    }
    Ok(PortId::from_raw(port, PortRight::Send))
}
