//! SMTP client with opportunistic STARTTLS.
//!
//! ```no_run
//! use carrier_smtp::SmtpClient;
//!
//! # async fn example() -> Result<(), carrier_smtp::ClientError> {
//! let mut client = SmtpClient::connect("mx.example.com:25", "mx.example.com").await?;
//! client.read_greeting().await?.into_result()?;
//! let ehlo = client.ehlo("relay.example.org").await?.into_result()?;
//! if ehlo.has_extension("STARTTLS") {
//!     client.starttls().await?.into_result()?;
//!     client.ehlo("relay.example.org").await?.into_result()?;
//! }
//! client.mail_from("sender@example.org").await?.into_result()?;
//! client.rcpt_to("rcpt@example.com").await?.into_result()?;
//! client.data().await?.into_result()?;
//! client.send_body(&b"Subject: hi\r\n\r\nhello\r\n"[..]).await?.into_result()?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;
mod tls;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
