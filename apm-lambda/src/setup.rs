use anyhow::Result;
use apm_lambda_config::Config;

/// Validates settings that cannot be checked while parsing.
pub fn check_config(config: &Config) -> Result<()> {
    if config.runtime_api().is_none() {
        anyhow::bail!(
            "the Lambda runtime API address is not set. \
             The extension must be started by the Lambda runtime, or AWS_LAMBDA_RUNTIME_API set.",
        );
    }

    if config.server_url().is_none() {
        anyhow::bail!("no backend configured, set APM_LAMBDA_SERVER_URL");
    }

    if config.batch_max_size() == 0 {
        anyhow::bail!("batch.max_size must be at least 1");
    }

    Ok(())
}

/// Initialize the logging system.
pub fn init_logging(config: &Config) {
    apm_lambda_log::init(config.logging());
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        apm_lambda_log::info!("launching extension without config file");
    } else {
        apm_lambda_log::info!(
            "launching extension from config file {}",
            config.path().display()
        );
    }

    match config.server_url() {
        Some(url) => apm_lambda_log::info!("  backend: {url}"),
        None => apm_lambda_log::info!("  backend: -"),
    };
    apm_lambda_log::info!("  send strategy: {:?}", config.send_strategy());
    apm_lambda_log::info!("  intake: http://{}/", config.listen_addr());
    apm_lambda_log::info!("  platform logs: {}", config.logs_enabled());
    apm_lambda_log::info!("  log level: {}", config.logging().level);
}

#[cfg(test)]
mod tests {
    use apm_lambda_config::OverridableConfig;

    use super::*;

    #[test]
    fn test_check_config() {
        let mut config = Config::default();
        assert!(check_config(&config).is_err());

        config
            .apply_override(OverridableConfig {
                runtime_api: Some("127.0.0.1:9001".to_owned()),
                ..Default::default()
            })
            .unwrap();
        assert!(check_config(&config).is_err());

        config
            .apply_override(OverridableConfig {
                server_url: Some("https://apm.example.com".to_owned()),
                ..Default::default()
            })
            .unwrap();
        assert!(check_config(&config).is_ok());
    }
}
