// agent/src/config.rs

use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    // 🛡️ SLA Boundary: Socket & Identity
    pub socket_path: PathBuf,
    pub expected_api_uid: u32,

    // 📂 Registry persistence
    pub state_file: PathBuf,

    // 📂 Platform Agnostic Paths
    pub home_root: PathBuf,
    pub sites_available_dir: PathBuf,
    pub sites_enabled_dir: PathBuf,
    pub cert_live_root: PathBuf,
    pub php_socket_dir: PathBuf,

    // ⚙️ Tenant defaults
    pub default_shell: String,

    // ⏱️ Deadlines for privileged commands
    pub command_timeout_secs: u64,
    pub issuance_timeout_secs: u64,
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .unwrap_or_else(|_| panic!("CONFIG FATAL: {} must be a positive integer", key)),
        Err(_) => default,
    }
}

impl AgentConfig {
    pub fn load() -> Self {
        // 🛡️ Zero-Trust Identity Parsing
        // The peer UID is parsed strictly: a non-numeric value in the
        // environment refuses startup rather than silently disabling the
        // SO_PEERCRED check. Defaults to 1001 (first non-system account).
        let expected_api_uid = env::var("ARBOR_API_UID")
            .unwrap_or_else(|_| "1001".to_string())
            .parse::<u32>()
            .expect("SECURITY FATAL: ARBOR_API_UID must be a valid numeric User ID");

        Self {
            socket_path: env_path("ARBOR_SOCKET_PATH", "/var/run/arbor/agent.sock"),
            expected_api_uid,

            state_file: env_path("ARBOR_STATE_FILE", "/var/lib/arbor/registry.json"),

            home_root: env_path("ARBOR_HOME_ROOT", "/home"),
            sites_available_dir: env_path("ARBOR_SITES_AVAILABLE", "/etc/nginx/sites-available"),
            sites_enabled_dir: env_path("ARBOR_SITES_ENABLED", "/etc/nginx/sites-enabled"),
            cert_live_root: env_path("ARBOR_CERT_LIVE_ROOT", "/etc/letsencrypt/live"),
            php_socket_dir: env_path("ARBOR_PHP_SOCKET_DIR", "/var/run/php"),

            default_shell: env::var("ARBOR_DEFAULT_SHELL")
                .unwrap_or_else(|_| "/bin/bash".to_string()),

            command_timeout_secs: env_u64("ARBOR_COMMAND_TIMEOUT", 30),
            // Issuance talks to an external CA and can legitimately take minutes.
            issuance_timeout_secs: env_u64("ARBOR_ISSUANCE_TIMEOUT", 300),
        }
    }

    /// Sandbox configuration rooted under a throwaway directory.
    #[cfg(test)]
    pub fn for_test(root: &std::path::Path) -> Self {
        Self {
            socket_path: root.join("agent.sock"),
            expected_api_uid: 1001,
            state_file: root.join("registry.json"),
            home_root: root.join("home"),
            sites_available_dir: root.join("nginx/sites-available"),
            sites_enabled_dir: root.join("nginx/sites-enabled"),
            cert_live_root: root.join("letsencrypt/live"),
            php_socket_dir: root.join("php"),
            default_shell: "/bin/bash".to_string(),
            command_timeout_secs: 5,
            issuance_timeout_secs: 5,
        }
    }
}
