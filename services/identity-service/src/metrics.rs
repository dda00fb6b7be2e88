use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct IdentityMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    token_rejections: IntCounterVec,
}

impl IdentityMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            login_attempts: counter(
                &registry,
                "identity_login_attempts_total",
                "Login attempts by outcome (success, reused or error kind)",
                "outcome",
            )?,
            token_rejections: counter(
                &registry,
                "identity_token_rejections_total",
                "Bearer tokens denied by the auth middleware, by reason",
                "reason",
            )?,
            registry,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn token_rejected(&self, reason: &str) {
        self.token_rejections.with_label_values(&[reason]).inc();
    }

    /// Prometheus text exposition of every registered counter.
    pub fn encode(&self) -> Result<String> {
        let mut text = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut text)
            .context("encoding identity metrics")?;
        String::from_utf8(text).context("metrics text is not utf-8")
    }
}

fn counter(registry: &Registry, name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry
        .register(Box::new(counter.clone()))
        .with_context(|| format!("registering {name}"))?;
    Ok(counter)
}
