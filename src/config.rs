use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Fixed intervals and timeouts used by every role.
///
/// Timeouts only ever bound connection establishment and health checks;
/// work running on a worker is never timed out.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// How often the coordinator tries to hand work to idle clients
    pub schedule_interval_ms: u64,
    /// How often the drop directory is scanned
    pub ingest_interval_ms: u64,
    /// How often the lock holder refreshes its heartbeat
    pub lock_heartbeat_interval_ms: u64,
    /// Age after which a lock heartbeat is considered stale
    pub lock_stale_after_ms: u64,
    /// Delay between role negotiation attempts
    pub reconnect_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
    /// How often a worker flushes its latest progress value
    pub progress_flush_interval_ms: u64,
    /// Time a fresh coordinator waits for workers to reconnect before
    /// resetting their in-progress allocations
    pub orphan_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 1000,
            ingest_interval_ms: 2000,
            lock_heartbeat_interval_ms: 5000,
            lock_stale_after_ms: 15000,
            reconnect_backoff_ms: 3000,
            connect_timeout_ms: 5000,
            health_check_timeout_ms: 2000,
            progress_flush_interval_ms: 1000,
            orphan_grace_ms: 10000,
        }
    }
}

impl TimingConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn ingest_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_interval_ms)
    }

    pub fn lock_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.lock_heartbeat_interval_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn progress_flush_interval(&self) -> Duration {
        Duration::from_millis(self.progress_flush_interval_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }
}

#[derive(Debug, Clone)]
pub struct FarmConfig {
    /// Display name of this machine; unique among connected peers
    pub name: String,
    /// Address the coordinator endpoint binds to when this node wins the lock
    pub listen_addr: SocketAddr,
    /// Address other nodes dial; written into the coordinator lock row
    pub advertise_addr: String,
    /// Shared SQLite database. `None` means this node can never coordinate.
    pub db_path: Option<PathBuf>,
    /// Directory polled for job descriptor files
    pub drop_dir: PathBuf,
    /// Shared secret every peer hashes into its passkey
    pub secret: String,
    /// Server address to health-check before touching the lock
    pub last_known_server: Option<String>,
    pub timing: TimingConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9440)),
            advertise_addr: "127.0.0.1:9440".to_string(),
            db_path: Some(PathBuf::from("framefarm.db")),
            drop_dir: PathBuf::from("dropbox"),
            secret: String::new(),
            last_known_server: None,
            timing: TimingConfig::default(),
        }
    }
}

impl FarmConfig {
    pub fn new(name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            ..Default::default()
        }
    }

    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = addr.into();
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn without_db(mut self) -> Self {
        self.db_path = None;
        self
    }

    pub fn with_drop_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.drop_dir = dir.into();
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_last_known_server(mut self, addr: impl Into<String>) -> Self {
        self.last_known_server = Some(addr.into());
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_config_default() {
        let cfg = TimingConfig::default();
        assert_eq!(cfg.schedule_interval(), Duration::from_secs(1));
        assert_eq!(cfg.ingest_interval(), Duration::from_secs(2));
        assert_eq!(cfg.lock_heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.lock_stale_after(), Duration::from_secs(15));
        assert!(cfg.lock_stale_after_ms > cfg.lock_heartbeat_interval_ms);
    }

    #[test]
    fn farm_config_default() {
        let cfg = FarmConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:9440");
        assert_eq!(cfg.db_path, Some(PathBuf::from("framefarm.db")));
        assert!(cfg.last_known_server.is_none());
    }

    #[test]
    fn farm_config_new_advertises_listen_addr() {
        let addr: SocketAddr = "10.0.0.5:7000".parse().unwrap();
        let cfg = FarmConfig::new("render07", addr);
        assert_eq!(cfg.name, "render07");
        assert_eq!(cfg.advertise_addr, "10.0.0.5:7000");
    }

    #[test]
    fn farm_config_builders() {
        let cfg = FarmConfig::default()
            .with_advertise_addr("farm.local:9440")
            .with_db_path("/mnt/farm/farm.db")
            .with_drop_dir("/mnt/farm/drop")
            .with_secret("s3cret")
            .with_last_known_server("farm.local:9440");
        assert_eq!(cfg.advertise_addr, "farm.local:9440");
        assert_eq!(cfg.db_path, Some(PathBuf::from("/mnt/farm/farm.db")));
        assert_eq!(cfg.drop_dir, PathBuf::from("/mnt/farm/drop"));
        assert_eq!(cfg.secret, "s3cret");
        assert_eq!(cfg.last_known_server.as_deref(), Some("farm.local:9440"));

        let cfg = cfg.without_db();
        assert!(cfg.db_path.is_none());
    }
}
