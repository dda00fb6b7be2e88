use std::env;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use identity_core::{JwtConfig, KeyPaths, SessionConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub jwt: JwtConfig,
    pub keys: KeyPaths,
    pub session: SessionConfig,
    pub redis: RedisConfig,
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub request_timeout: Duration,
    pub cors_origins: Vec<String>,
}

pub fn load_service_config() -> Result<ServiceConfig> {
    ServiceConfig::from_lookup(|key| env::var(key).ok())
}

impl ServiceConfig {
    /// Builds the config from any key lookup; `load_service_config` passes
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(|value| normalize_optional(&value));

        let access_ttl = get("JWT_TOKEN_EXPIRY")
            .map(|value| parse_duration(&value).context("Failed to parse JWT_TOKEN_EXPIRY"))
            .transpose()?
            .unwrap_or(Duration::from_secs(15 * 60));
        let refresh_ttl = get("JWT_REFRESH_EXPIRY")
            .map(|value| parse_duration(&value).context("Failed to parse JWT_REFRESH_EXPIRY"))
            .transpose()?
            .unwrap_or(Duration::from_secs(24 * 60 * 60));
        if access_ttl.is_zero() || refresh_ttl.is_zero() {
            bail!("token lifetimes must be positive");
        }

        let jwt = JwtConfig::new(get("JWT_ISSUER").unwrap_or_else(|| "identity-service".to_string()))
            .with_access_ttl(access_ttl)
            .with_refresh_ttl(refresh_ttl);

        let keys = KeyPaths::new(
            get("JWT_PRIVATE_KEY_PATH").unwrap_or_else(|| "./private.pem".to_string()),
            get("JWT_PUBLIC_KEY_PATH").unwrap_or_else(|| "./public.pem".to_string()),
        );

        let session = match get("SESSION_KEY_PREFIX") {
            Some(key_prefix) => SessionConfig { key_prefix },
            None => SessionConfig::default(),
        };

        let redis = RedisConfig {
            host: get("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or("REDIS_PORT", get("REDIS_PORT"), 6379)?,
            password: get("REDIS_PASSWORD"),
            db: parse_or("REDIS_DB", get("REDIS_DB"), 0)?,
        };

        let database_url = get("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let ip: IpAddr = host
            .parse()
            .with_context(|| format!("Failed to parse HOST '{host}'"))?;
        let port: u16 = parse_or("PORT", get("PORT"), 8085)?;

        let timeout_ms: u64 = parse_or("REQUEST_TIMEOUT_MS", get("REQUEST_TIMEOUT_MS"), 5000)?;

        let cors_origins = get("CORS_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .filter_map(normalize_optional)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]);

        Ok(Self {
            jwt,
            keys,
            session,
            redis,
            database_url,
            listen_addr: SocketAddr::from((ip, port)),
            request_timeout: Duration::from_millis(timeout_ms),
            cors_origins,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|err| anyhow!("Failed to parse {key} '{raw}': {err}")),
        None => Ok(default),
    }
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses Go-style durations such as `15m`, `1h30m`, `1.5h` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        bail!("empty duration");
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("missing unit in duration '{input}'"))?;
        if number_len == 0 {
            bail!("invalid duration '{input}'");
        }
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .with_context(|| format!("invalid number in duration '{input}'"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, remaining) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => bail!("unknown unit '{other}' in duration '{input}'"),
        };
        total_nanos += value * scale;
        rest = remaining;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        bail!("duration '{input}' out of range");
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
