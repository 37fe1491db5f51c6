#![forbid(unsafe_code)]

use std::fmt;

/// Role of a participant inside a room.
///
/// Hosts and guests publish and subscribe; audience members only
/// subscribe and never own a peer connection of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
    Audience,
}

/// Why a join request was refused. The messages are part of the HTTP
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    HostExists,
    RoomFull,
}

impl JoinRejection {
    pub fn message(&self) -> &'static str {
        match self {
            JoinRejection::HostExists => "Host already exists",
            JoinRejection::RoomFull => "Room is full",
        }
    }
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Role::Host),
            "guest" => Some(Role::Guest),
            "audience" => Some(Role::Audience),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Guest => "guest",
            Role::Audience => "audience",
        }
    }

    /// Whether this role uploads media and takes part in the
    /// publishing-side fan-out.
    pub fn can_publish(&self) -> bool {
        !matches!(self, Role::Audience)
    }

    /// Join caps: one host per room, at most two participants before
    /// guests are refused, no cap for the audience.
    pub fn check_join(&self, participant_count: usize) -> Result<(), JoinRejection> {
        match self {
            Role::Host if participant_count > 0 => Err(JoinRejection::HostExists),
            Role::Guest if participant_count >= 2 => Err(JoinRejection::RoomFull),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
