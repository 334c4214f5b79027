//! Opening SMTP sessions to a destination host.
//!
//! [`Connector::open`] walks the resolver's server list until one accepts
//! a TCP connection, then runs the greeting, EHLO (falling back to HELO)
//! and, when advertised, STARTTLS. Everything that goes wrong before a
//! session exists is host-level; a stop request during any of it surfaces
//! as [`DeliveryError::Cancelled`] instead.

use std::{future::Future, time::Duration};

use carrier_common::StopToken;
use carrier_smtp::{ClientError, Response, SmtpClient};
use tracing::{debug, warn};

use crate::{
    error::{DeliveryError, FailureLevel, HostError},
    timeouts::SmtpTimeouts,
};

/// Where a client error lands once a session exists. Replies in the 4xx
/// and 5xx range judge the message; anything else means the session is
/// broken.
#[must_use]
pub const fn classify(error: &ClientError) -> FailureLevel {
    match error.rejection_code() {
        Some(_) => FailureLevel::Message,
        None => FailureLevel::Host,
    }
}

/// Runs `future`, failing with [`HostError::Timeout`] after `secs`.
pub(crate) async fn bounded<F: Future>(
    operation: &'static str,
    secs: u64,
    future: F,
) -> Result<F::Output, HostError> {
    let after = Duration::from_secs(secs);
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| HostError::Timeout { operation, after })
}

#[derive(Debug, Clone)]
pub struct Connector {
    hostname: String,
    port: u16,
    accept_invalid_certs: bool,
    timeouts: SmtpTimeouts,
}

impl Connector {
    #[must_use]
    pub const fn new(
        hostname: String,
        port: u16,
        accept_invalid_certs: bool,
        timeouts: SmtpTimeouts,
    ) -> Self {
        Self {
            hostname,
            port,
            accept_invalid_certs,
            timeouts,
        }
    }

    #[must_use]
    pub const fn timeouts(&self) -> &SmtpTimeouts {
        &self.timeouts
    }

    /// Connects to the first reachable server and initialises the session.
    pub async fn open(
        &self,
        host: &str,
        servers: &[String],
        stop: &StopToken,
    ) -> Result<SmtpClient, DeliveryError> {
        let mut client = self.try_servers(host, servers, stop).await?;

        let handshake = tokio::select! {
            biased;
            () = stop.stopped() => Err(DeliveryError::Cancelled),
            result = self.init_session(&mut client) => result.map_err(DeliveryError::from),
        };

        handshake?;
        Ok(client)
    }

    /// Dials a single server.
    pub async fn connect(&self, server: &str, stop: &StopToken) -> Result<SmtpClient, DeliveryError> {
        let dial = bounded(
            "connect",
            self.timeouts.connect_secs,
            SmtpClient::connect((server, self.port), server),
        );

        let client = tokio::select! {
            biased;
            () = stop.stopped() => return Err(DeliveryError::Cancelled),
            result = dial => result?.map_err(HostError::Transport)?,
        };

        Ok(client.accept_invalid_certs(self.accept_invalid_certs))
    }

    /// Tries each server in order. Individual failures are logged and
    /// skipped; a stop aborts the whole walk.
    pub async fn try_servers(
        &self,
        host: &str,
        servers: &[String],
        stop: &StopToken,
    ) -> Result<SmtpClient, DeliveryError> {
        for server in servers {
            match self.connect(server, stop).await {
                Ok(client) => {
                    debug!("Connected to {server}:{} for {host}", self.port);
                    return Ok(client);
                }
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(err) => warn!("Unable to connect to {server}:{} for {host}: {err}", self.port),
            }
        }

        Err(HostError::Unreachable {
            host: host.to_string(),
        }
        .into())
    }

    /// Greeting, EHLO (or HELO), then STARTTLS if the server offers it.
    ///
    /// A STARTTLS failure is fatal to the session; there is no plaintext
    /// retry.
    pub async fn init_session(&self, client: &mut SmtpClient) -> Result<(), HostError> {
        let greeting = bounded("greeting", self.timeouts.ehlo_secs, client.read_greeting())
            .await?
            .map_err(HostError::Transport)?;
        accepted(client, &greeting)?;

        let Some(ehlo) = self.hello(client).await? else {
            return Ok(());
        };

        if client.is_tls() || !ehlo.has_extension("STARTTLS") {
            return Ok(());
        }

        let starttls = bounded("STARTTLS", self.timeouts.starttls_secs, client.starttls())
            .await?
            .map_err(HostError::Transport)?;
        accepted(client, &starttls)?;
        debug!("TLS established with {}", client.server_domain());

        let ehlo = bounded("EHLO", self.timeouts.ehlo_secs, client.ehlo(&self.hostname))
            .await?
            .map_err(HostError::Transport)?;
        accepted(client, &ehlo)
    }

    /// EHLO, falling back to HELO when the server does not know it.
    /// Returns the EHLO reply, or `None` if HELO was used.
    async fn hello(&self, client: &mut SmtpClient) -> Result<Option<Response>, HostError> {
        let ehlo = bounded("EHLO", self.timeouts.ehlo_secs, client.ehlo(&self.hostname))
            .await?
            .map_err(HostError::Transport)?;
        if ehlo.is_success() {
            return Ok(Some(ehlo));
        }

        debug!(
            "{} refused EHLO with {}, trying HELO",
            client.server_domain(),
            ehlo.code
        );
        let helo = bounded("HELO", self.timeouts.ehlo_secs, client.helo(&self.hostname))
            .await?
            .map_err(HostError::Transport)?;
        accepted(client, &helo)?;
        Ok(None)
    }
}

fn accepted(client: &SmtpClient, response: &Response) -> Result<(), HostError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(HostError::HandshakeRejected {
            server: client.server_domain().to_string(),
            code: response.code,
            message: response.message(),
        })
    }
}
