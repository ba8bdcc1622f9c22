use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use service_core::error::AppError;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::EmailConfig;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_verification_email(
        &self,
        to_email: &str,
        first_name: &str,
        verification_link: &str,
    ) -> Result<(), AppError>;

    async fn send_welcome_email(
        &self,
        to_email: &str,
        first_name: Option<&str>,
        organization_name: &str,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &EmailConfig) -> Result<Self, AppError> {
        let builder = if config.smtp_username.is_empty() {
            // Local relays (mailpit, mailhog) speak plain SMTP without auth.
            SmtpTransport::builder_dangerous(config.smtp_host.as_str())
        } else {
            SmtpTransport::starttls_relay(&config.smtp_host)
                .map_err(|e| AppError::EmailError(e.to_string()))?
                .credentials(Credentials::new(
                    config.smtp_username.clone(),
                    config.smtp_password.clone(),
                ))
        };

        let mailer = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.smtp_host, port = config.smtp_port, "Email service initialized");

        Ok(Self {
            mailer,
            from_email: config.from_address.clone(),
        })
    }

    async fn send_email(&self, to_email: &str, subject: &str, body: String) -> Result<(), AppError> {
        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?,
            )
            .to(to_email
                .parse()
                .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| AppError::EmailError(e.to_string()))?;

        // SmtpTransport is blocking
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, to = %to_email, "Failed to send email");
                Err(AppError::EmailError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        first_name: &str,
        verification_link: &str,
    ) -> Result<(), AppError> {
        let body = format!(
            "Hi {},\n\nThanks for signing up. Please verify your email address by visiting:\n\n{}\n\nThis link expires in 24 hours. If you didn't create an account, you can ignore this email.",
            first_name, verification_link
        );

        self.send_email(to_email, "Verify Your Email Address", body)
            .await
    }

    async fn send_welcome_email(
        &self,
        to_email: &str,
        first_name: Option<&str>,
        organization_name: &str,
    ) -> Result<(), AppError> {
        let greeting = first_name
            .map(|name| format!("Hi {},", name))
            .unwrap_or_else(|| "Hi,".to_string());
        let body = format!(
            "{}\n\nYou have joined {}. You can sign in with the email address this message was sent to.",
            greeting, organization_name
        );

        self.send_email(to_email, &format!("Welcome to {}", organization_name), body)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentEmailKind {
    Verification,
    Welcome,
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub kind: SentEmailKind,
    /// Verification link or organization name.
    pub detail: String,
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MockEmailService {
    sent: Mutex<Vec<SentEmail>>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    fn record(&self, email: SentEmail) -> Result<(), AppError> {
        self.sent
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Mock mailer mutex poisoned: {}", e)))?
            .push(email);
        Ok(())
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        _first_name: &str,
        verification_link: &str,
    ) -> Result<(), AppError> {
        tracing::info!(to = %to_email, "Mock: verification email");
        self.record(SentEmail {
            to: to_email.to_string(),
            kind: SentEmailKind::Verification,
            detail: verification_link.to_string(),
        })
    }

    async fn send_welcome_email(
        &self,
        to_email: &str,
        _first_name: Option<&str>,
        organization_name: &str,
    ) -> Result<(), AppError> {
        tracing::info!(to = %to_email, "Mock: welcome email");
        self.record(SentEmail {
            to: to_email.to_string(),
            kind: SentEmailKind::Welcome,
            detail: organization_name.to_string(),
        })
    }
}
