// src/config/validate.rs

use crate::config::model::{ConfigFile, GridmanagerSection, RawConfigFile};
use crate::errors::{GridflowError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::GridflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.dagman, raw.gridmanager))
    }
}

/// Re-run validation on an already constructed config (e.g. after CLI
/// overrides were applied).
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    validate_raw_config(&RawConfigFile {
        dagman: cfg.dagman.clone(),
        gridmanager: cfg.gridmanager.clone(),
    })
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_dagman(cfg)?;
    validate_gridmanager(&cfg.gridmanager)?;
    Ok(())
}

fn validate_dagman(cfg: &RawConfigFile) -> Result<()> {
    let d = &cfg.dagman;
    if d.max_submit_attempts == 0 {
        return Err(GridflowError::ConfigError(
            "[dagman].max_submit_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if d.log_poll_interval_ms == 0 {
        return Err(GridflowError::ConfigError(
            "[dagman].log_poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if d.submit_command.trim().is_empty() {
        return Err(GridflowError::ConfigError(
            "[dagman].submit_command must not be empty".to_string(),
        ));
    }
    if d.max_rescue_num == 0 || d.max_rescue_num > 999 {
        return Err(GridflowError::ConfigError(format!(
            "[dagman].max_rescue_num must be within 1..=999 (got {})",
            d.max_rescue_num
        )));
    }
    Ok(())
}

fn validate_gridmanager(g: &GridmanagerSection) -> Result<()> {
    if g.max_submit_attempts == 0 {
        return Err(GridflowError::ConfigError(
            "[gridmanager].max_submit_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if g.max_submits_per_resource == 0 {
        return Err(GridflowError::ConfigError(
            "[gridmanager].max_submits_per_resource must be >= 1 (got 0)".to_string(),
        ));
    }

    let intervals = [
        ("probe_interval_secs", g.probe_interval_secs),
        ("periodic_expr_interval_secs", g.periodic_expr_interval_secs),
        ("rpc_timeout_secs", g.rpc_timeout_secs),
        ("schedd_poll_interval_secs", g.schedd_poll_interval_secs),
        ("job_lifetime_secs", g.job_lifetime_secs),
    ];
    for (name, value) in intervals {
        if value == 0 {
            return Err(GridflowError::ConfigError(format!(
                "[gridmanager].{name} must be >= 1 (got 0)"
            )));
        }
    }

    if g.min_proxy_lifetime_secs >= g.job_lifetime_secs {
        return Err(GridflowError::ConfigError(format!(
            "[gridmanager].min_proxy_lifetime_secs ({}) must be smaller than job_lifetime_secs ({})",
            g.min_proxy_lifetime_secs, g.job_lifetime_secs
        )));
    }
    if g.lifetime_refresh_margin_secs >= g.job_lifetime_secs {
        return Err(GridflowError::ConfigError(format!(
            "[gridmanager].lifetime_refresh_margin_secs ({}) must be smaller than job_lifetime_secs ({})",
            g.lifetime_refresh_margin_secs, g.job_lifetime_secs
        )));
    }
    if g.helper_command.trim().is_empty() {
        return Err(GridflowError::ConfigError(
            "[gridmanager].helper_command must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_valid_with_defaults() {
        let raw: RawConfigFile = toml::from_str("").unwrap();
        let cfg = ConfigFile::try_from(raw).unwrap();
        assert_eq!(cfg.gridmanager.max_submits_per_resource, 5);
        assert_eq!(cfg.gridmanager.periodic_expr_interval_secs, 30);
        assert_eq!(cfg.dagman.max_jobs, 0);
        assert_eq!(cfg.dagman.submit_command, "condor_submit");
    }

    #[test]
    fn rejects_zero_submit_slots() {
        let raw: RawConfigFile =
            toml::from_str("[gridmanager]\nmax_submits_per_resource = 0\n").unwrap();
        let err = ConfigFile::try_from(raw).unwrap_err();
        assert!(matches!(err, GridflowError::ConfigError(_)));
    }

    #[test]
    fn rejects_proxy_margin_longer_than_lifetime() {
        let raw: RawConfigFile = toml::from_str(
            "[gridmanager]\njob_lifetime_secs = 100\nmin_proxy_lifetime_secs = 100\n",
        )
        .unwrap();
        assert!(ConfigFile::try_from(raw).is_err());
    }
}
