//! Outbound message delivery.
//!
//! The server only ever sees `Arc<dyn Sender>`, so a backend can be swapped
//! without touching the wiring in [`App`](crate::app::App).

use std::{
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    config::EmailConfig,
    server::error::{LockboxError, Result, Subsystem},
};

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Sender: Send + Sync {
    /// Short backend name, reported by `INFO`.
    fn backend(&self) -> &'static str;

    /// The email settings the backend was built from, if it has any.
    fn email_config(&self) -> Option<&EmailConfig> {
        None
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Delivers messages through an SMTP relay.
#[derive(Debug, Clone)]
pub struct EmailSender {
    config: EmailConfig,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Result<Self> {
        if !config.server.trim().is_empty() && config.port == 0 {
            return Err(LockboxError::construction(
                Subsystem::Sender,
                "email.port must be set when email.server is configured",
            ));
        }

        Ok(Self { config })
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    fn from_address(&self) -> String {
        let user = self.config.user.trim();
        if user.contains('@') {
            user.to_string()
        } else if user.is_empty() {
            format!("lockbox@{}", self.config.server.trim())
        } else {
            format!("{user}@{}", self.config.server.trim())
        }
    }

    async fn deliver(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.trim(), self.config.port);
        let stream = TcpStream::connect(&addr).await?;
        let mut smtp = SmtpSession::new(stream);

        smtp.expect(220).await?;
        smtp.command("EHLO lockbox", 250).await?;
        if !self.config.user.is_empty() {
            let credentials = format!("\0{}\0{}", self.config.user, self.config.password);
            smtp.command(&format!("AUTH PLAIN {}", STANDARD.encode(credentials)), 235)
                .await?;
        }

        let from = self.from_address();
        smtp.command(&format!("MAIL FROM:<{from}>"), 250).await?;
        smtp.command(&format!("RCPT TO:<{recipient}>"), 250).await?;
        smtp.command("DATA", 354).await?;
        smtp.command(&format_message(&from, recipient, subject, body), 250)
            .await?;
        smtp.command("QUIT", 221).await?;
        Ok(())
    }
}

#[async_trait]
impl Sender for EmailSender {
    fn backend(&self) -> &'static str {
        "email"
    }

    fn email_config(&self) -> Option<&EmailConfig> {
        Some(&self.config)
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        if self.config.server.trim().is_empty() {
            return Err(LockboxError::Send("email.server is not configured".into()));
        }

        timeout(SMTP_TIMEOUT, self.deliver(recipient, subject, body))
            .await
            .map_err(|_| LockboxError::Send("SMTP session timed out".into()))??;
        info!(recipient, subject, "email sent");
        Ok(())
    }
}

struct SmtpSession {
    stream: BufReader<TcpStream>,
}

impl SmtpSession {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn command(&mut self, line: &str, code: u16) -> Result<()> {
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        self.stream.get_mut().write_all(b"\r\n").await?;
        self.expect(code).await
    }

    /// Reads a possibly multi-line reply and checks its status code.
    async fn expect(&mut self, code: u16) -> Result<()> {
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(LockboxError::Send("SMTP server closed the connection".into()));
            }
            debug!(reply = line.trim_end(), "smtp");

            let status = line.get(..3).and_then(|s| s.parse::<u16>().ok());
            if status != Some(code) {
                return Err(LockboxError::Send(format!(
                    "expected {code}, got {:?}",
                    line.trim_end()
                )));
            }
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(());
            }
        }
    }
}

/// Headers plus dot-stuffed body, terminated for the DATA phase.
fn format_message(from: &str, recipient: &str, subject: &str, body: &str) -> String {
    let mut message = format!(
        "From: <{from}>\r\nTo: <{recipient}>\r\nSubject: {subject}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n"
    );
    for line in body.lines() {
        if line.starts_with('.') {
            message.push('.');
        }
        message.push_str(line);
        message.push_str("\r\n");
    }
    message.push('.');
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Keeps every message in memory instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordSender {
    messages: Mutex<Vec<RecordedMessage>>,
}

impl RecordSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<RecordedMessage> {
        self.messages().pop()
    }
}

#[async_trait]
impl Sender for RecordSender {
    fn backend(&self) -> &'static str {
        "record"
    }

    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| LockboxError::Send("recorder poisoned".into()))?;
        messages.push(RecordedMessage {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
