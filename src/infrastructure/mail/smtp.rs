use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    address::Envelope,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use tracing::debug;

use crate::{
    application::services::transport::{MailTransport, TransportSession},
    config::{SmtpConfig, SmtpSecurity},
};

pub struct SmtpMailTransport {
    config: SmtpConfig,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig) -> Arc<dyn MailTransport> {
        Arc::new(Self { config }) as Arc<dyn MailTransport>
    }

    fn build(&self) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.config.host.as_str();
        let builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host);
        let builder = match self.config.security {
            SmtpSecurity::StartTls => {
                builder.tls(Tls::Required(TlsParameters::new(host.to_string())?))
            }
            SmtpSecurity::Tls => builder.tls(Tls::Wrapper(TlsParameters::new(host.to_string())?)),
            SmtpSecurity::None => builder.tls(Tls::None),
        };

        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(self.config.timeout));
        if let Some((user, password)) = self.config.credentials() {
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn connect(&self) -> anyhow::Result<Box<dyn TransportSession>> {
        let transport = self.build()?;
        let connected = transport.test_connection().await.with_context(|| {
            format!("cannot reach SMTP server {}:{}", self.config.host, self.config.port)
        })?;
        if !connected {
            anyhow::bail!(
                "SMTP server {}:{} did not accept the session",
                self.config.host,
                self.config.port
            );
        }
        debug!(host = %self.config.host, port = self.config.port, "SMTP session established");
        Ok(Box::new(SmtpSession { transport }))
    }
}

/// Pooled transport reused for every message of one batch.
struct SmtpSession {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

#[async_trait]
impl TransportSession for SmtpSession {
    async fn send(
        &mut self,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> anyhow::Result<()> {
        let envelope = envelope(sender, recipients)?;
        self.transport.send_raw(&envelope, body).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        drop(self.transport);
        Ok(())
    }
}

/// An empty sender becomes the null reverse-path.
fn envelope(sender: &str, recipients: &[String]) -> anyhow::Result<Envelope> {
    let from = match sender.trim() {
        "" => None,
        sender => Some(
            sender
                .parse::<Address>()
                .with_context(|| format!("invalid sender address {sender:?}"))?,
        ),
    };
    let to = recipients
        .iter()
        .map(|recipient| {
            recipient
                .parse::<Address>()
                .with_context(|| format!("invalid recipient address {recipient:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Envelope::new(from, to)?)
}
