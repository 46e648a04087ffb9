use async_trait::async_trait;

use crate::config::SiteConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> anyhow::Result<()>;
}

/// Hands messages to the log instead of a mail server. Link tokens are
/// omitted from the log line.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> anyhow::Result<()> {
        tracing::info!(
            from = %message.from,
            to = %message.to,
            subject = %message.subject,
            "email dispatched"
        );
        Ok(())
    }
}

pub fn password_reset_email(
    site: &SiteConfig,
    username: &str,
    to: &str,
    uid: &str,
    token: &str,
) -> EmailMessage {
    EmailMessage {
        from: site.email_from.clone(),
        to: to.to_string(),
        subject: format!("Password reset on {}", site.name),
        body: format!(
            "Hi {username},\n\n\
             You're receiving this email because you requested a password reset \
             for your account at {name}.\n\n\
             Please go to the following page and choose a new password:\n\
             {url}/reset-password/confirm?uid={uid}&token={token}\n\n\
             If you didn't request this, you can ignore this email.\n",
            name = site.name,
            url = site.url,
        ),
    }
}

pub fn password_changed_email(site: &SiteConfig, username: &str, to: &str) -> EmailMessage {
    EmailMessage {
        from: site.email_from.clone(),
        to: to.to_string(),
        subject: format!("Your {} password was changed", site.name),
        body: format!(
            "Hi {username},\n\n\
             The password for your account at {name} was just changed. \
             If this wasn't you, reset your password at {url} right away.\n",
            name = site.name,
            url = site.url,
        ),
    }
}

pub fn email_verification_email(
    site: &SiteConfig,
    username: &str,
    to: &str,
    uid: &str,
    token: &str,
) -> EmailMessage {
    EmailMessage {
        from: site.email_from.clone(),
        to: to.to_string(),
        subject: format!("Verify your email address on {}", site.name),
        body: format!(
            "Hi {username},\n\n\
             Please confirm this email address for your account at {name}:\n\
             {url}/verify-email/confirm?uid={uid}&token={token}\n",
            name = site.name,
            url = site.url,
        ),
    }
}
