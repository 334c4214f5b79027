//! Outbound SMTP for the carrier relay.
//!
//! Only the client side lives here: connecting to a remote exchanger,
//! negotiating EHLO/HELO and STARTTLS, and running mail transactions over a
//! session that may be reused for many messages.

pub mod client;

pub use client::{ClientError, Response, SmtpClient};
