use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Renders a config value without leaking secrets, mirroring the pattern
/// used across the ambient service layer: nested configs implement this
/// instead of relying on `Debug`, so logging a config at startup never
/// prints a token or key.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    pub hostname: Option<String>,
    pub api_url: String,

    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sync_power_state_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub check_provision_state_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub deploy_callback_timeout: Duration,
    pub force_power_state_during_sync: bool,
    pub power_state_sync_max_retries: u32,
    pub periodic_max_workers: usize,
    pub workers_pool_size: usize,
    pub node_locked_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub node_locked_retry_interval: Duration,
    pub send_sensor_data: bool,
    #[serde(with = "humantime_serde")]
    pub send_sensor_data_interval: Duration,
    pub send_sensor_data_types: Vec<String>,
    /// Negative disables the loop; modeled as an `Option` rather than a
    /// signed duration.
    #[serde(with = "humantime_serde_opt")]
    pub sync_local_state_interval: Option<Duration>,
    pub ring_replica_count: usize,
    pub metrics_port: u16,
}

mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => humantime_serde::serialize(d, s),
            None => s.serialize_str("disabled"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw == "disabled" {
            Ok(None)
        } else {
            Ok(Some(
                humantime::parse_duration(&raw).map_err(serde::de::Error::custom)?,
            ))
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            api_url: "http://localhost:6385".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            sync_power_state_interval: Duration::from_secs(60),
            check_provision_state_interval: Duration::from_secs(60),
            deploy_callback_timeout: Duration::from_secs(1800),
            force_power_state_during_sync: true,
            power_state_sync_max_retries: 3,
            periodic_max_workers: 8,
            workers_pool_size: 100,
            node_locked_retry_attempts: 3,
            node_locked_retry_interval: Duration::from_secs(1),
            send_sensor_data: false,
            send_sensor_data_interval: Duration::from_secs(600),
            send_sensor_data_types: vec!["ALL".to_string()],
            sync_local_state_interval: Some(Duration::from_secs(180)),
            ring_replica_count: 1,
            metrics_port: 9090,
        }
    }
}

impl SafeDisplay for ConductorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "hostname: {:?}", self.hostname);
        let _ = writeln!(&mut result, "api url: {}", self.api_url);
        let _ = writeln!(&mut result, "heartbeat interval: {:?}", self.heartbeat_interval);
        let _ = writeln!(&mut result, "heartbeat timeout: {:?}", self.heartbeat_timeout);
        let _ = writeln!(
            &mut result,
            "sync power state interval: {:?}",
            self.sync_power_state_interval
        );
        let _ = writeln!(
            &mut result,
            "check provision state interval: {:?}",
            self.check_provision_state_interval
        );
        let _ = writeln!(
            &mut result,
            "deploy callback timeout: {:?}",
            self.deploy_callback_timeout
        );
        let _ = writeln!(
            &mut result,
            "force power state during sync: {}",
            self.force_power_state_during_sync
        );
        let _ = writeln!(
            &mut result,
            "power state sync max retries: {}",
            self.power_state_sync_max_retries
        );
        let _ = writeln!(&mut result, "periodic max workers: {}", self.periodic_max_workers);
        let _ = writeln!(&mut result, "workers pool size: {}", self.workers_pool_size);
        let _ = writeln!(
            &mut result,
            "node locked retry attempts: {}",
            self.node_locked_retry_attempts
        );
        let _ = writeln!(
            &mut result,
            "node locked retry interval: {:?}",
            self.node_locked_retry_interval
        );
        let _ = writeln!(&mut result, "send sensor data: {}", self.send_sensor_data);
        let _ = writeln!(
            &mut result,
            "send sensor data interval: {:?}",
            self.send_sensor_data_interval
        );
        let _ = writeln!(
            &mut result,
            "send sensor data types: {:?}",
            self.send_sensor_data_types
        );
        let _ = writeln!(
            &mut result,
            "sync local state interval: {:?}",
            self.sync_local_state_interval
        );
        let _ = writeln!(&mut result, "metrics port: {}", self.metrics_port);
        result
    }
}

/// Layered config loader: built-in defaults, then an optional TOML file,
/// then environment variables (`CONDUCTOR__` prefix, `__` as nesting
/// separator), following the figment-based loading idiom used throughout
/// the ambient service layer.
pub struct ConfigLoader<T> {
    file: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    pub fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.file))
            .merge(Env::prefixed("CONDUCTOR__").split("__"))
            .extract()
    }
}

pub fn make_config_loader() -> ConfigLoader<ConductorConfig> {
    ConfigLoader::new(Path::new("config/conductor.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use test_r::test;

    #[test]
    fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("failed to set current directory");

        make_config_loader().load().expect("failed to load config");
    }

    #[test]
    fn defaults_round_trip_through_figment() {
        let loaded: ConductorConfig = Figment::from(Serialized::defaults(ConductorConfig::default()))
            .extract()
            .unwrap();
        assert_eq!(loaded.workers_pool_size, 100);
        assert_eq!(loaded.sync_local_state_interval, Some(Duration::from_secs(180)));
    }
}
