//! Layered configuration (§6.4 expansion): compiled-in defaults, overridden
//! by environment variables, overridden by `run`'s CLI flags. Mirrors
//! `bhumi-device::identity::bhumi_home`'s "env var, else `dirs`, else
//! default" shape but returns a `Result` instead of panicking, since a bad
//! config directory here is the `ConfigDirInaccessible` fatal error (§7),
//! not a CLI bug.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub config_dir: PathBuf,
    pub log_level: String,
    pub reset_gpio_pin: u8,
    pub reset_hold_secs: u64,
    pub setup_timeout_secs: u64,
    pub lockout_duration_secs: u64,
    pub max_failed_attempts: u32,
    pub pairing_secret_path: PathBuf,
    pub display_device: PathBuf,
    pub probe_endpoint: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory and no PROVISION_CONFIG_DIR set")]
    NoConfigDir,
    #[error("{var} is not a valid {kind}: {value}")]
    BadValue { var: &'static str, kind: &'static str, value: String },
}

/// CLI overrides accepted by `provisiond run`, applied on top of env vars.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub reset_gpio_pin: Option<u8>,
    #[arg(long)]
    pub pairing_secret_path: Option<PathBuf>,
    #[arg(long)]
    pub probe_endpoint: Option<String>,
}

fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir().map(|d| d.join("rockpi-provisiond")).ok_or(ConfigError::NoConfigDir)
}

fn env_parsed<T: std::str::FromStr>(var: &'static str, kind: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map(Some).map_err(|_| ConfigError::BadValue { var, kind, value }),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let config_dir = if let Some(dir) = overrides.config_dir.clone() {
            dir
        } else if let Ok(dir) = std::env::var("PROVISION_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            default_config_dir()?
        };

        let log_level = overrides
            .log_level
            .clone()
            .or_else(|| std::env::var("PROVISION_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string());

        let reset_gpio_pin = match overrides.reset_gpio_pin {
            Some(pin) => pin,
            None => env_parsed("PROVISION_RESET_GPIO_PIN", "pin number")?.unwrap_or(provision_gpio::DEFAULT_PIN),
        };

        let reset_hold_secs =
            env_parsed("PROVISION_RESET_HOLD_SEC", "integer")?.unwrap_or(5);
        let setup_timeout_secs =
            env_parsed("PROVISION_SETUP_TIMEOUT_SEC", "integer")?.unwrap_or(600);
        let lockout_duration_secs =
            env_parsed("PROVISION_LOCKOUT_DURATION_SEC", "integer")?.unwrap_or(3600);
        let max_failed_attempts =
            env_parsed("PROVISION_MAX_FAILED_ATTEMPTS", "integer")?.unwrap_or(3);

        let pairing_secret_path = overrides
            .pairing_secret_path
            .clone()
            .or_else(|| std::env::var("PROVISION_PAIRING_SECRET_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| config_dir.join("pairing_secret"));

        let probe_endpoint = overrides
            .probe_endpoint
            .clone()
            .or_else(|| std::env::var("PROVISION_PROBE_ENDPOINT").ok())
            .unwrap_or_else(|| "1.1.1.1:443".to_string());

        let display_device = std::env::var("PROVISION_DISPLAY_DEVICE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/dev/fb0"));

        Ok(Self {
            config_dir,
            log_level,
            reset_gpio_pin,
            reset_hold_secs,
            setup_timeout_secs,
            lockout_duration_secs,
            max_failed_attempts,
            pairing_secret_path,
            display_device,
            probe_endpoint,
        })
    }

    /// Rendered for `provisiond config`; the pairing secret path is shown,
    /// its contents never are.
    pub fn render_redacted(&self) -> String {
        format!(
            "config_dir: {}\nlog_level: {}\nreset_gpio_pin: {}\nreset_hold_secs: {}\nsetup_timeout_secs: {}\nlockout_duration_secs: {}\nmax_failed_attempts: {}\npairing_secret_path: {} (contents redacted)\ndisplay_device: {}\nprobe_endpoint: {}\n",
            self.config_dir.display(),
            self.log_level,
            self.reset_gpio_pin,
            self.reset_hold_secs,
            self.setup_timeout_secs,
            self.lockout_duration_secs,
            self.max_failed_attempts,
            self.pairing_secret_path.display(),
            self.display_device.display(),
            self.probe_endpoint,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_render_never_contains_secret_bytes() {
        let cfg = Config {
            config_dir: PathBuf::from("/tmp/x"),
            log_level: "info".into(),
            reset_gpio_pin: 18,
            reset_hold_secs: 5,
            setup_timeout_secs: 600,
            lockout_duration_secs: 3600,
            max_failed_attempts: 3,
            pairing_secret_path: PathBuf::from("/tmp/x/pairing_secret"),
            display_device: PathBuf::from("/dev/fb0"),
            probe_endpoint: "1.1.1.1:443".into(),
        };
        let rendered = cfg.render_redacted();
        assert!(rendered.contains("redacted"));
        assert!(rendered.contains("pairing_secret"));
    }
}
