//! Driver Registry
//!
//! Static name-to-factory map. Each backend module adds itself through an
//! explicit `register` call; nothing is discovered at runtime.

use super::TimeSeriesDriver;
use crate::config::Config;
use crate::error::{TimeseriesError, TimeseriesResult};
use std::collections::BTreeMap;

/// Builds a driver from configuration
pub type DriverFactory = fn(&Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>>;

/// Enumerable set of driver factories
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with influxdb, graphite, rrdtool and prometheus
    pub fn with_builtin() -> TimeseriesResult<Self> {
        let mut registry = Self::new();
        super::influxdb::register(&mut registry)?;
        super::graphite::register(&mut registry)?;
        super::rrdtool::register(&mut registry)?;
        super::prometheus::register(&mut registry)?;
        Ok(registry)
    }

    /// Add a factory; names are unique
    pub fn register(&mut self, name: &'static str, factory: DriverFactory) -> TimeseriesResult<()> {
        if self.factories.contains_key(name) {
            return Err(TimeseriesError::Driver(format!(
                "driver '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        tracing::debug!(driver = name, "Registered driver");
        Ok(())
    }

    /// Build a driver by name
    pub fn create(&self, name: &str, config: &Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            TimeseriesError::Driver(format!(
                "unknown driver '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = DriverRegistry::with_builtin().unwrap();
        assert_eq!(
            registry.names(),
            vec!["graphite", "influxdb", "prometheus", "rrdtool"]
        );
        assert!(registry.contains("rrdtool"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = DriverRegistry::with_builtin().unwrap();
        let result = super::super::graphite::register(&mut registry);
        assert!(matches!(result, Err(TimeseriesError::Driver(_))));
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::with_builtin().unwrap();
        let result = registry.create("opentsdb", &Config::default());
        match result {
            Err(TimeseriesError::Driver(msg)) => assert!(msg.contains("opentsdb")),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("opentsdb should not exist"),
        }
    }

    #[test]
    fn test_create_builds_named_driver() {
        let registry = DriverRegistry::with_builtin().unwrap();
        let mut config = Config::default();
        config.rrdtool.data_dir = std::env::temp_dir().to_string_lossy().to_string();

        let driver = registry.create("rrdtool", &config).unwrap();
        assert_eq!(driver.name(), "rrdtool");

        let driver = registry.create("prometheus", &config).unwrap();
        assert_eq!(driver.name(), "prometheus");
    }
}
