use std::time::SystemTime;

use crate::command::Token;
use crate::inline::ArgPayload;

/// Reply status as carried on the wire (§6 Wire protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Status {
    Ok,
    Error,
    Nack,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::Error => "error",
            Status::Nack => "nack",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Status::Ok),
            "error" => Ok(Status::Error),
            "nack" => Ok(Status::Nack),
            _ => Err(()),
        }
    }
}

/// The matched reply to a [`crate::command::Command`]. Only valid when
/// `token` matches an in-flight command (§3 Data Model).
#[derive(Debug, Clone)]
pub struct Response {
    pub token: Token,
    pub status: Status,
    pub payload: Option<ArgPayload>,
    pub received_at: SystemTime,
}

/// The terminal outcome of a single dispatched [`crate::command::Command`],
/// as observed by its waiter. Exactly one of these is produced per command
/// (§8 Testable Properties, invariant 1).
#[derive(Debug, Clone)]
pub enum Outcome {
    Response(Response),
    Timeout,
    Cancelled,
    ChannelUnavailable,
}
