//! C8 — ConfigModel (spec.md §4.8). A layered `Option<T>`-overlay file
//! struct resolved against fixed defaults, merged defaults < file < env
//! < CLI, the way `shpool`'s `libshpool/src/config.rs` represents its
//! TOML file as all-`Option` fields and only resolves them at load time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::GatewayError;

#[derive(Parser, Debug, Default)]
#[command(name = "webssh-gateway", about = "Browser-to-SSH gateway")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "WEBSSH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `listen.port`.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileListen {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileHttp {
    pub origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileUser {
    pub name: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileAlgorithms {
    pub cipher: Option<Vec<String>>,
    pub kex: Option<Vec<String>>,
    pub hmac: Option<Vec<String>>,
    pub compress: Option<Vec<String>>,
    pub server_host_key: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileHostKeyVerification {
    pub enabled: Option<bool>,
    pub mode: Option<String>,
    pub unknown_key_action: Option<String>,
    pub trusted_fingerprints: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileSsh {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub term: Option<String>,
    pub ready_timeout_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_count_max: Option<u32>,
    pub allowed_subnets: Option<Vec<String>>,
    pub allowed_auth_methods: Option<Vec<String>>,
    pub max_exec_output_bytes: Option<u64>,
    pub output_rate_limit_bytes_per_sec: Option<u64>,
    pub socket_high_water_mark: Option<usize>,
    pub algorithms: Option<FileAlgorithms>,
    pub always_send_keyboard_interactive_prompts: Option<bool>,
    pub disable_interactive_auth: Option<bool>,
    pub host_key_verification: Option<FileHostKeyVerification>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileOptions {
    pub challenge_button: Option<bool>,
    pub auto_log: Option<bool>,
    pub allow_reauth: Option<bool>,
    pub allow_reconnect: Option<bool>,
    pub allow_replay: Option<bool>,
    pub replay_crlf: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileSession {
    pub name: Option<String>,
    pub secret: Option<String>,
    pub session_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileHeaderMapping {
    pub username: Option<String>,
    pub password: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileSso {
    pub enabled: Option<bool>,
    pub csrf_protection: Option<bool>,
    pub trusted_proxies: Option<Vec<String>>,
    pub header_mapping: Option<FileHeaderMapping>,
}

/// The on-disk shape: every field optional, resolved against
/// [`Config::defaults`] at load time. Deliberately mirrors
/// `ConfigModel`'s slices in spec.md §4.8 one-for-one.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub listen: FileListen,
    pub http: FileHttp,
    pub user: FileUser,
    pub ssh: FileSsh,
    pub options: FileOptions,
    pub session: FileSession,
    pub sso: FileSso,
}

#[derive(Debug, Clone)]
pub struct Algorithms {
    pub cipher: Vec<String>,
    pub kex: Vec<String>,
    pub hmac: Vec<String>,
    pub compress: Vec<String>,
    pub server_host_key: Vec<String>,
}

impl Default for Algorithms {
    fn default() -> Self {
        // spec.md §4.3: "defaults include modern primitives".
        Algorithms {
            cipher: vec!["chacha20-poly1305@openssh.com".into(), "aes256-gcm@openssh.com".into()],
            kex: vec!["curve25519-sha256".into(), "curve25519-sha256@libssh.org".into()],
            hmac: vec!["hmac-sha2-256".into(), "hmac-sha2-512".into()],
            compress: vec![],
            server_host_key: vec!["ssh-ed25519".into(), "rsa-sha2-512".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostKeyVerification {
    pub enabled: bool,
    pub mode: String,
    pub unknown_key_action: String,
    pub trusted_fingerprints: HashMap<String, String>,
}

impl Default for HostKeyVerification {
    fn default() -> Self {
        HostKeyVerification {
            enabled: false,
            mode: "strict".into(),
            unknown_key_action: "reject".into(),
            trusted_fingerprints: HashMap::new(),
        }
    }
}

/// Resolved, concrete settings passed to [`crate::ssh::client::SshClient`].
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: u32,
    pub algorithms: Algorithms,
    pub max_exec_output_bytes: u64,
    pub output_rate_limit_bytes_per_sec: u64,
    pub socket_high_water_mark: usize,
    pub always_send_keyboard_interactive_prompts: bool,
    pub disable_interactive_auth: bool,
    pub host_key_verification: HostKeyVerification,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub challenge_button: bool,
    pub auto_log: bool,
    pub allow_reauth: bool,
    pub allow_reconnect: bool,
    pub allow_replay: bool,
    pub replay_crlf: bool,
}

#[derive(Debug, Clone)]
pub struct HeaderMapping {
    pub username: String,
    pub password: String,
    pub session: String,
}

#[derive(Debug, Clone)]
pub struct Sso {
    pub enabled: bool,
    pub csrf_protection: bool,
    pub trusted_proxies: Vec<String>,
    pub header_mapping: HeaderMapping,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub secret: String,
    pub session_timeout: Duration,
}

/// Fully resolved configuration: defaults < file < env < CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub http_origins: Vec<String>,
    pub default_user: FileUser,
    pub ssh_host: Option<String>,
    pub ssh_port: u16,
    pub ssh_term: String,
    pub ssh: SshSettings,
    pub allowed_subnets: Vec<String>,
    pub allowed_auth_methods: Vec<String>,
    pub options: Options,
    pub session: SessionConfig,
    pub sso: Sso,
}

impl Config {
    /// Loads from `path` (if given), layers the `PORT` env var and any
    /// CLI flags on top, and validates the result (spec.md §6: "exit
    /// code 1" on malformed config).
    pub fn load(cli: &Cli) -> Result<Self, GatewayError> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| GatewayError::Config(format!("reading {}: {e}", path.display())))?;
                toml::from_str::<FileConfig>(&text)
                    .map_err(|e| GatewayError::Config(format!("parsing {}: {e}", path.display())))?
            }
            None => FileConfig::default(),
        };

        let mut config = Self::from_file(file);

        if let Ok(port) = std::env::var("PORT") {
            config.listen_port = port
                .parse()
                .map_err(|_| GatewayError::Config(format!("PORT is not a valid port: {port}")))?;
        }
        if let Some(port) = cli.port {
            config.listen_port = port;
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(f: FileConfig) -> Self {
        let algorithms = f.ssh.algorithms.unwrap_or_default();
        let defaults = Algorithms::default();
        let hkv = f.ssh.host_key_verification.unwrap_or_default();
        let hkv_defaults = HostKeyVerification::default();

        Config {
            listen_ip: f.listen.ip.unwrap_or([0, 0, 0, 0].into()),
            listen_port: f.listen.port.unwrap_or(2222),
            http_origins: f.http.origins.unwrap_or_default(),
            default_user: f.user,
            ssh_host: f.ssh.host,
            ssh_port: f.ssh.port.unwrap_or(crate::validator::DEFAULT_SSH_PORT),
            ssh_term: f.ssh.term.unwrap_or_else(|| "xterm-color".to_string()),
            ssh: SshSettings {
                ready_timeout: Duration::from_millis(f.ssh.ready_timeout_ms.unwrap_or(20_000)),
                keepalive_interval: Duration::from_millis(f.ssh.keepalive_interval_ms.unwrap_or(120_000)),
                keepalive_count_max: f.ssh.keepalive_count_max.unwrap_or(10),
                algorithms: Algorithms {
                    cipher: algorithms.cipher.unwrap_or(defaults.cipher),
                    kex: algorithms.kex.unwrap_or(defaults.kex),
                    hmac: algorithms.hmac.unwrap_or(defaults.hmac),
                    compress: algorithms.compress.unwrap_or(defaults.compress),
                    server_host_key: algorithms.server_host_key.unwrap_or(defaults.server_host_key),
                },
                max_exec_output_bytes: f.ssh.max_exec_output_bytes.unwrap_or(10 * 1024 * 1024),
                output_rate_limit_bytes_per_sec: f.ssh.output_rate_limit_bytes_per_sec.unwrap_or(u64::MAX),
                socket_high_water_mark: f.ssh.socket_high_water_mark.unwrap_or(16 * 1024),
                always_send_keyboard_interactive_prompts: f
                    .ssh
                    .always_send_keyboard_interactive_prompts
                    .unwrap_or(false),
                disable_interactive_auth: f.ssh.disable_interactive_auth.unwrap_or(false),
                host_key_verification: HostKeyVerification {
                    enabled: hkv.enabled.unwrap_or(hkv_defaults.enabled),
                    mode: hkv.mode.unwrap_or(hkv_defaults.mode),
                    unknown_key_action: hkv.unknown_key_action.unwrap_or(hkv_defaults.unknown_key_action),
                    trusted_fingerprints: hkv.trusted_fingerprints.unwrap_or_default(),
                },
            },
            allowed_subnets: f.ssh.allowed_subnets.unwrap_or_default(),
            allowed_auth_methods: f
                .ssh
                .allowed_auth_methods
                .unwrap_or_else(|| vec!["password".to_string(), "keyboard-interactive".to_string(), "publickey".to_string()]),
            options: Options {
                challenge_button: f.options.challenge_button.unwrap_or(false),
                auto_log: f.options.auto_log.unwrap_or(false),
                allow_reauth: f.options.allow_reauth.unwrap_or(true),
                allow_reconnect: f.options.allow_reconnect.unwrap_or(true),
                allow_replay: f.options.allow_replay.unwrap_or(false),
                replay_crlf: f.options.replay_crlf.unwrap_or(false),
            },
            session: SessionConfig {
                name: f.session.name.unwrap_or_else(|| "webssh2.sid".to_string()),
                secret: f
                    .session
                    .secret
                    .or_else(|| std::env::var("WEBSSH_SESSION_SECRET").ok())
                    .unwrap_or_else(generate_session_secret),
                session_timeout: Duration::from_millis(f.session.session_timeout_ms.unwrap_or(3_600_000)),
            },
            sso: Sso {
                enabled: f.sso.enabled.unwrap_or(false),
                csrf_protection: f.sso.csrf_protection.unwrap_or(true),
                trusted_proxies: f.sso.trusted_proxies.unwrap_or_default(),
                header_mapping: {
                    let hm = f.sso.header_mapping.unwrap_or_default();
                    HeaderMapping {
                        username: hm.username.unwrap_or_else(|| "X-SSO-User".to_string()),
                        password: hm.password.unwrap_or_else(|| "X-SSO-Password".to_string()),
                        session: hm.session.unwrap_or_else(|| "X-SSO-Session".to_string()),
                    }
                },
            },
        }
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.allowed_auth_methods.is_empty() {
            return Err(GatewayError::Config("allowedAuthMethods must not be empty".into()));
        }
        if self.listen_port == 0 {
            return Err(GatewayError::Config("listen.port must be nonzero".into()));
        }
        if self.ssh.socket_high_water_mark == 0 {
            return Err(GatewayError::Config("ssh.socketHighWaterMark must be nonzero".into()));
        }
        Ok(())
    }
}

fn generate_session_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The public shape of `GET /ssh/config` (SPEC_FULL §3 item 4): a pure
/// projection of [`Config`], kept separate so the endpoint can never leak
/// more than this view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConfigView {
    pub allowed_auth_methods: Vec<String>,
    pub host_key_verification_enabled: bool,
    pub host_key_verification_mode: String,
}

pub fn config_view(config: &Config) -> ConfigView {
    ConfigView {
        allowed_auth_methods: config.allowed_auth_methods.clone(),
        host_key_verification_enabled: config.ssh.host_key_verification.enabled,
        host_key_verification_mode: config.ssh.host_key_verification.mode.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_fixed_values() {
        let config = Config::from_file(FileConfig::default());
        assert_eq!(config.listen_port, 2222);
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.ssh_term, "xterm-color");
        assert_eq!(config.ssh.ready_timeout, Duration::from_secs(20));
        assert_eq!(config.ssh.keepalive_interval, Duration::from_millis(120_000));
        assert_eq!(config.ssh.keepalive_count_max, 10);
        assert_eq!(config.session.name, "webssh2.sid");
        assert_eq!(config.ssh.max_exec_output_bytes, 10 * 1024 * 1024);
        assert_eq!(config.ssh.socket_high_water_mark, 16 * 1024);
    }

    #[test]
    fn validate_rejects_empty_auth_methods() {
        let mut config = Config::from_file(FileConfig::default());
        config.allowed_auth_methods.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = Config::from_file(FileConfig::default());
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_view_projects_only_public_fields() {
        let config = Config::from_file(FileConfig::default());
        let view = config_view(&config);
        assert_eq!(view.allowed_auth_methods, config.allowed_auth_methods);
        assert!(!view.host_key_verification_enabled);
    }

    #[test]
    fn session_secret_falls_back_to_random_when_unset() {
        std::env::remove_var("WEBSSH_SESSION_SECRET");
        let config = Config::from_file(FileConfig::default());
        assert_eq!(config.session.secret.len(), 64); // 32 bytes hex-encoded
    }
}
