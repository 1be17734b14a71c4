//! Status taxonomy (component I): the public result code carried in every ack
//! and returned from every client/server API call.

use std::fmt;
use std::sync::RwLock;

/// Sentinel opening the user-extensible status range.
pub const USER_BASE: i32 = 1000;

/// A result code from the framework's built-in taxonomy, or an application
/// code `>= USER_BASE` whose meaning is owned by the caller.
///
/// Implements `Display` (built-in fixed formatter, or the user-installed
/// formatter for codes `>= USER_BASE`) and `std::error::Error` so it composes
/// with `anyhow` at the internal plumbing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status(i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_PARAM: Status = Status(-1);
    pub const NO_MEMORY: Status = Status(-2);
    pub const NOT_CONNECTED: Status = Status(-3);
    pub const TIMEOUT: Status = Status(-4);
    pub const SEND_FAILED: Status = Status(-5);
    pub const INTERNAL: Status = Status(-6);
    pub const CLIENT_FULL: Status = Status(-7);

    /// Wrap a raw code. Codes `< USER_BASE` that don't match a built-in
    /// constant still round-trip; they just format as "Unknown error".
    pub const fn from_raw(code: i32) -> Status {
        Status(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    pub const fn is_user(self) -> bool {
        self.0 >= USER_BASE
    }

    fn builtin_str(self) -> Option<&'static str> {
        match self {
            Status::SUCCESS => Some("Success"),
            Status::INVALID_PARAM => Some("Invalid parameter"),
            Status::NO_MEMORY => Some("No memory"),
            Status::NOT_CONNECTED => Some("Not connected"),
            Status::TIMEOUT => Some("Timeout"),
            Status::SEND_FAILED => Some("Send failed"),
            Status::INTERNAL => Some("Internal error"),
            Status::CLIENT_FULL => Some("Client table full"),
            _ => None,
        }
    }
}

/// A user-installed formatter for codes `>= USER_BASE`. Registered once per
/// process via [`set_user_status_formatter`].
pub type UserStatusFormatter = fn(i32) -> String;

static USER_FORMATTER: RwLock<Option<UserStatusFormatter>> = RwLock::new(None);

/// Install a formatter consulted by [`Status`]'s `Display` impl for codes
/// `>= USER_BASE`. Mirrors the source's `set_user_ipc_status_string` hook.
pub fn set_user_status_formatter(f: UserStatusFormatter) {
    *USER_FORMATTER.write().expect("user status formatter lock poisoned") = Some(f);
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.builtin_str() {
            return write!(f, "{s}");
        }
        if self.is_user() {
            if let Some(formatter) = *USER_FORMATTER.read().expect("user status formatter lock poisoned") {
                return write!(f, "{}", formatter(self.0));
            }
        }
        write!(f, "Unknown error ({})", self.0)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_codes_have_fixed_text() {
        assert_eq!(Status::SUCCESS.to_string(), "Success");
        assert_eq!(Status::TIMEOUT.to_string(), "Timeout");
        assert_eq!(Status::CLIENT_FULL.to_string(), "Client table full");
    }

    #[test]
    fn unknown_code_below_user_base_is_unknown_error() {
        let s = Status::from_raw(42);
        assert_eq!(s.to_string(), "Unknown error (42)");
    }

    #[test]
    fn user_code_without_formatter_is_unknown_error() {
        let s = Status::from_raw(USER_BASE + 999);
        assert!(s.is_user());
        assert_eq!(s.to_string(), "Unknown error (1999)");
    }

    #[test]
    fn user_formatter_is_consulted_for_user_codes_only() {
        fn fmt_echo(code: i32) -> String {
            format!("echo-ok({code})")
        }
        set_user_status_formatter(fmt_echo);
        let s = Status::from_raw(USER_BASE + 1);
        assert_eq!(s.to_string(), "echo-ok(1001)");
        // Built-in codes are never routed to the user formatter.
        assert_eq!(Status::SUCCESS.to_string(), "Success");
    }
}
