use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub url: String,
    pub email_from: String,
}

/// Requests allowed per window for each throttled endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThrottleRate {
    pub requests: u32,
    pub per: Duration,
}

impl ThrottleRate {
    /// Parses `"<count>/<period>"` where period starts with s, m, h or d.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (count, period) = raw
            .split_once('/')
            .with_context(|| format!("throttle rate {raw:?} must look like 3/hour"))?;
        let requests = count.trim().parse::<u32>().context("throttle request count")?;
        anyhow::ensure!(requests > 0, "throttle request count must be positive");
        let secs = match period.trim().chars().next() {
            Some('s') => 1,
            Some('m') => 60,
            Some('h') => 60 * 60,
            Some('d') => 60 * 60 * 24,
            _ => anyhow::bail!("unknown throttle period in {raw:?}"),
        };
        Ok(Self {
            requests,
            per: Duration::from_secs(secs),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub site: SiteConfig,
    pub confirm_token_max_age_secs: i64,
    pub throttle: ThrottleRate,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL")?;
        let secret = std::env::var("SECRET_KEY").context("SECRET_KEY")?;
        let site_url =
            std::env::var("SITE_URL").unwrap_or_else(|_| "https://example.com".into());

        let jwt = JwtConfig {
            secret,
            issuer: site_url.clone(),
            ttl_minutes: std::env::var("TOKEN_EXPIRE_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(5),
        };
        let site = SiteConfig {
            name: std::env::var("SITE_NAME").unwrap_or_else(|_| "example.com".into()),
            url: site_url,
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "admin@example.com".into()),
        };
        let confirm_token_max_age_secs = std::env::var("CONFIRM_TOKEN_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(60 * 60 * 24);
        let throttle = ThrottleRate::parse(
            &std::env::var("THROTTLE_RATE").unwrap_or_else(|_| "3/hour".into()),
        )?;

        Ok(Self {
            database_url,
            jwt,
            site,
            confirm_token_max_age_secs,
            throttle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_drf_style_rates() {
        let rate = ThrottleRate::parse("3/hour").unwrap();
        assert_eq!(rate.requests, 3);
        assert_eq!(rate.per, Duration::from_secs(3600));

        let rate = ThrottleRate::parse("100/day").unwrap();
        assert_eq!(rate.per, Duration::from_secs(86_400));

        assert_eq!(ThrottleRate::parse("10/s").unwrap().per, Duration::from_secs(1));
    }

    #[test]
    fn rejects_garbage_rates() {
        assert!(ThrottleRate::parse("often").is_err());
        assert!(ThrottleRate::parse("0/hour").is_err());
        assert!(ThrottleRate::parse("3/fortnight").is_err());
    }
}
