use async_trait::async_trait;

/// Outbound delivery capability.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Opens one session (connection, TLS, login) for a whole batch.
    ///
    /// An error here means nothing in the batch can be attempted.
    async fn connect(&self) -> anyhow::Result<Box<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportSession: Send {
    /// Hands one message to the relay. Errors are specific to this message.
    async fn send(&mut self, sender: &str, recipients: &[String], body: &[u8])
    -> anyhow::Result<()>;

    /// Ends the session once the batch is done.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}
