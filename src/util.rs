const SENTINEL_CONFIG: &str = "SENTINEL_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./sentinel.json";

/// Config file path from the environment, falling back to `./sentinel.json`
pub fn get_config_path() -> String {
    std::env::var(SENTINEL_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

const HOSTNAME: &str = "HOSTNAME";

const DEFAULT_HOSTNAME: &str = "localhost";

/// Name of this machine for notification texts
pub fn get_hostname() -> String {
    std::env::var(HOSTNAME)
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string())
}
