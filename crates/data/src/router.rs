//! Resolution of logical series to tier-qualified physical keys.
//!
//! Physical keys look like `{tier}:{exchange-or-tenant}:{symbol}:{timeframe}`. The shared
//! tier is namespaced by exchange, the overflow tier by tenant. Readers consult the shared
//! tier first and fall back to the tenant's overflow tier, so writers can move between
//! tiers ahead of readers.

use std::fmt;

use candle_sync_core::{SeriesId, StoreConfig, Tier, Timeframe, ValidationError};

/// Physical storage key for one series in one tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub tier: Tier,
    /// Exchange id for the shared tier, tenant id for the overflow tier.
    pub namespace: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.tier, self.namespace, self.symbol, self.timeframe
        )
    }
}

#[derive(Debug, Clone)]
pub struct KeyRouter {
    tenant: Option<String>,
    write_tier: Tier,
}

impl KeyRouter {
    /// # Errors
    /// Returns an error if `write_tier` is overflow and no tenant is given.
    pub fn new(tenant: Option<String>, write_tier: Tier) -> Result<Self, ValidationError> {
        let tenant = tenant.filter(|t| !t.trim().is_empty());
        if let Some(t) = &tenant {
            if t.contains(':') {
                return Err(ValidationError::config("store.tenant", "must not contain ':'"));
            }
        }
        if write_tier == Tier::Overflow && tenant.is_none() {
            return Err(ValidationError::config(
                "store.write_tier",
                "overflow tier requires store.tenant",
            ));
        }
        Ok(Self { tenant, write_tier })
    }

    /// Router that only ever touches the shared tier.
    #[must_use]
    pub const fn shared() -> Self {
        Self {
            tenant: None,
            write_tier: Tier::Shared,
        }
    }

    /// # Errors
    /// Returns an error if the tier/tenant combination is invalid.
    pub fn from_config(config: &StoreConfig) -> Result<Self, ValidationError> {
        Self::new(config.tenant.clone(), config.write_tier)
    }

    #[must_use]
    pub const fn write_tier(&self) -> Tier {
        self.write_tier
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Key new writes for `series` land in.
    #[must_use]
    pub fn write_key(&self, series: &SeriesId) -> SeriesKey {
        self.key_in(self.write_tier, series)
            .unwrap_or_else(|| self.shared_key(series))
    }

    /// Keys to consult for reads, in fallback order.
    #[must_use]
    pub fn read_keys(&self, series: &SeriesId) -> Vec<SeriesKey> {
        let mut keys = vec![self.shared_key(series)];
        if let Some(overflow) = self.key_in(Tier::Overflow, series) {
            keys.push(overflow);
        }
        keys
    }

    /// Publish channel for closed-candle notifications of `series`.
    #[must_use]
    pub fn closed_channel(&self, series: &SeriesId) -> String {
        format!(
            "{}:{}:{}:{}:closed",
            self.write_tier, series.exchange, series.symbol, series.timeframe
        )
    }

    fn shared_key(&self, series: &SeriesId) -> SeriesKey {
        SeriesKey {
            tier: Tier::Shared,
            namespace: series.exchange.clone(),
            symbol: series.symbol.clone(),
            timeframe: series.timeframe,
        }
    }

    fn key_in(&self, tier: Tier, series: &SeriesId) -> Option<SeriesKey> {
        match tier {
            Tier::Shared => Some(self.shared_key(series)),
            Tier::Overflow => self.tenant.as_ref().map(|tenant| SeriesKey {
                tier: Tier::Overflow,
                namespace: tenant.clone(),
                symbol: series.symbol.clone(),
                timeframe: series.timeframe,
            }),
        }
    }
}
