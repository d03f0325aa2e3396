use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_allowed_keys(config)?;
    validate_chat_config(config)?;
    validate_web_search_config(config)?;
    validate_image_config(config)?;
    validate_client_config(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    let base_path = server.base_path.trim();
    if !base_path.is_empty() && !base_path.starts_with('/') {
        return Err(validation_err("server.base_path must start with '/'"));
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    for key in &config.client_authentication.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    Ok(())
}

fn validate_chat_config(config: &AppConfig) -> Result<(), ConfigError> {
    let chat = &config.chat;
    validate_http_url("chat.base_url", &chat.base_url)?;
    if chat.model.trim().is_empty() {
        return Err(validation_err("chat.model cannot be empty"));
    }
    if chat.api_key_env.trim().is_empty() {
        return Err(validation_err("chat.api_key_env cannot be empty"));
    }
    if !(0.0..=2.0).contains(&chat.temperature) {
        return Err(validation_err("chat.temperature must be within 0.0..=2.0"));
    }
    if !(chat.top_p > 0.0 && chat.top_p <= 1.0) {
        return Err(validation_err("chat.top_p must be within (0.0, 1.0]"));
    }
    Ok(())
}

fn validate_web_search_config(config: &AppConfig) -> Result<(), ConfigError> {
    let search = &config.web_search;
    validate_http_url("web_search.url", &search.url)?;
    if search.engine.trim().is_empty() {
        return Err(validation_err("web_search.engine cannot be empty"));
    }
    if search.count == 0 || search.count > 50 {
        return Err(validation_err("web_search.count must be within 1..=50"));
    }
    if !matches!(search.content_size.as_str(), "medium" | "high") {
        return Err(validation_err(
            "web_search.content_size must be one of [\"medium\", \"high\"]",
        ));
    }
    Ok(())
}

const MAX_IMAGE_SIDE: u32 = 4096;

fn validate_image_config(config: &AppConfig) -> Result<(), ConfigError> {
    let image = &config.image;
    validate_http_url("image.url", &image.url)?;
    if image.model.trim().is_empty() {
        return Err(validation_err("image.model cannot be empty"));
    }
    if image.api_key_env.trim().is_empty() {
        return Err(validation_err("image.api_key_env cannot be empty"));
    }
    for (field, value) in [
        ("image.default_width", image.default_width),
        ("image.default_height", image.default_height),
    ] {
        if value == 0 || value > MAX_IMAGE_SIDE {
            return Err(validation_err(format!(
                "{field} must be within 1..={MAX_IMAGE_SIDE}"
            )));
        }
    }
    Ok(())
}

fn validate_client_config(config: &AppConfig) -> Result<(), ConfigError> {
    let client = &config.client;
    validate_http_url("client.base_url", &client.base_url)?;
    if client.timeout == 0 {
        return Err(validation_err("client.timeout must be greater than 0"));
    }
    if client.stream.max_carry_bytes == 0 {
        return Err(validation_err(
            "client.stream.max_carry_bytes must be greater than 0",
        ));
    }
    if let Some(key) = client.publishable_key.as_deref() {
        if key.trim().is_empty() {
            return Err(validation_err(
                "client.publishable_key cannot be empty when set",
            ));
        }
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(validation_err(format!("{field_name} cannot be empty")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
