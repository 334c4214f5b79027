use serde::{Deserialize, Serialize};

/// Upper bound, in seconds, on each SMTP round trip.
///
/// A timeout always counts against the host, never the message.
///
/// ```ron
/// smtp_timeouts: (
///     connect_secs: 10,
///     body_secs: 600,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect, per candidate server.
    #[serde(default = "defaults::command")]
    pub connect_secs: u64,

    /// Greeting, EHLO and HELO.
    #[serde(default = "defaults::command")]
    pub ehlo_secs: u64,

    /// STARTTLS and the handshake that follows.
    #[serde(default = "defaults::command")]
    pub starttls_secs: u64,

    #[serde(default = "defaults::command")]
    pub mail_from_secs: u64,

    /// Per recipient.
    #[serde(default = "defaults::command")]
    pub rcpt_to_secs: u64,

    /// The DATA command up to the 354 go-ahead.
    #[serde(default = "defaults::data")]
    pub data_secs: u64,

    /// Streaming the body through to the final reply.
    #[serde(default = "defaults::body")]
    pub body_secs: u64,

    /// QUIT, and RSET between transactions.
    #[serde(default = "defaults::quit")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::command(),
            ehlo_secs: defaults::command(),
            starttls_secs: defaults::command(),
            mail_from_secs: defaults::command(),
            rcpt_to_secs: defaults::command(),
            data_secs: defaults::data(),
            body_secs: defaults::body(),
            quit_secs: defaults::quit(),
        }
    }
}

mod defaults {
    pub const fn command() -> u64 {
        30
    }

    pub const fn data() -> u64 {
        120
    }

    pub const fn body() -> u64 {
        300
    }

    pub const fn quit() -> u64 {
        10
    }
}
