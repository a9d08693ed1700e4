// Cooldown registry
// Last honoured detection per (pattern, instrument)

use chrono::{DateTime, Duration, Utc};
use common::{Instrument, PatternType};
use std::collections::HashMap;

use crate::config::CooldownConfig;

pub struct CooldownRegistry {
    default_cooldown: Duration,
    cooldowns: HashMap<PatternType, Duration>,
    last_fired: HashMap<(PatternType, Instrument), DateTime<Utc>>,
}

impl CooldownRegistry {
    pub fn new(config: &CooldownConfig) -> Self {
        Self {
            default_cooldown: Duration::seconds(config.default_secs as i64),
            cooldowns: config
                .patterns
                .iter()
                .map(|(pattern, secs)| (*pattern, Duration::seconds(*secs as i64)))
                .collect(),
            last_fired: HashMap::new(),
        }
    }

    pub fn cooldown_for(&self, pattern: PatternType) -> Duration {
        self.cooldowns.get(&pattern).copied().unwrap_or(self.default_cooldown)
    }

    /// True when nothing was recorded or the cooldown has elapsed
    pub fn allow(&self, pattern: PatternType, instrument: Instrument, now: DateTime<Utc>) -> bool {
        match self.last_fired.get(&(pattern, instrument)) {
            Some(last) => now - *last >= self.cooldown_for(pattern),
            None => true,
        }
    }

    pub fn record(&mut self, pattern: PatternType, instrument: Instrument, now: DateTime<Utc>) {
        self.last_fired.insert((pattern, instrument), now);
    }

    pub fn last_fired(&self, pattern: PatternType, instrument: Instrument) -> Option<DateTime<Utc>> {
        self.last_fired.get(&(pattern, instrument)).copied()
    }

    /// Time left before the key may fire again
    pub fn remaining(&self, pattern: PatternType, instrument: Instrument, now: DateTime<Utc>) -> Duration {
        self.last_fired(pattern, instrument)
            .map(|last| (last + self.cooldown_for(pattern) - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_cooldown_gates_reemission() {
        let mut registry = CooldownRegistry::new(&CooldownConfig::default());
        let pattern = PatternType::Pressure;

        assert!(registry.allow(pattern, Instrument::Wdo, ts(0)));
        registry.record(pattern, Instrument::Wdo, ts(0));

        assert!(!registry.allow(pattern, Instrument::Wdo, ts(14)));
        assert!(registry.allow(pattern, Instrument::Wdo, ts(15)));
        // keys are independent
        assert!(registry.allow(pattern, Instrument::Dol, ts(1)));
        assert!(registry.allow(PatternType::Iceberg, Instrument::Wdo, ts(1)));
        assert_eq!(registry.remaining(pattern, Instrument::Wdo, ts(10)), Duration::seconds(5));
    }

    #[test]
    fn test_default_cooldown_fallback() {
        let registry = CooldownRegistry::new(&CooldownConfig::default());
        assert_eq!(registry.cooldown_for(PatternType::CalculatedConfluence), Duration::seconds(30));
        assert_eq!(registry.cooldown_for(PatternType::FlashOrder), Duration::seconds(5));
    }
}
