//! Runtime knobs, read from `YOKE_*` environment variables with defaults.

use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub flight_timeout: Duration,
    pub flight_fuel: u64,
    pub flight_max_memory_bytes: usize,
    pub max_module_bytes: usize,
    pub max_output_bytes: usize,
    pub max_parallel: usize,
    pub fail_fast: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            flight_timeout: Duration::from_secs(60),
            flight_fuel: 10_000_000_000,
            flight_max_memory_bytes: 512 * 1024 * 1024,
            max_module_bytes: 256 * 1024 * 1024,
            max_output_bytes: 64 * 1024 * 1024,
            max_parallel: 8,
            fail_fast: 1,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: std::env::var_os("YOKE_DB_PATH").map(PathBuf::from).unwrap_or(d.db_path),
            flight_timeout: env_parse::<u64>("YOKE_FLIGHT_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.flight_timeout),
            flight_fuel: env_parse("YOKE_FLIGHT_FUEL").unwrap_or(d.flight_fuel),
            flight_max_memory_bytes: env_parse::<usize>("YOKE_FLIGHT_MAX_MEMORY_MB")
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(d.flight_max_memory_bytes),
            max_module_bytes: env_parse("YOKE_MAX_MODULE_BYTES").unwrap_or(d.max_module_bytes),
            max_output_bytes: env_parse("YOKE_MAX_OUTPUT_BYTES").unwrap_or(d.max_output_bytes),
            max_parallel: env_parse::<usize>("YOKE_MAX_PARALLEL").unwrap_or(d.max_parallel).max(1),
            fail_fast: env_parse::<usize>("YOKE_FAIL_FAST").unwrap_or(d.fail_fast).max(1),
        }
    }
}

fn default_db_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".yoke");
        p.push("yoke.db");
        return p;
    }
    // Fallback to current directory
    PathBuf::from("yoke.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded() {
        let s = Settings::default();
        assert!(s.max_parallel >= 1);
        assert!(s.fail_fast >= 1);
        assert!(s.flight_timeout > Duration::ZERO);
        assert!(s.db_path.ends_with("yoke.db"));
    }
}
