use std::{fs, path::Path};

use rand_core::{OsRng, TryRngCore};
use serde::{Deserialize, Serialize};

pub const SMUX_BUFFER: u32 = 4194304;
pub const STREAM_BUFFER: u32 = 2097152;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        return match self {
            Role::Client => "client",
            Role::Server => "server",
        };
    }
}

mod defaults {
    use super::Role;

    pub fn role() -> Role {
        Role::Client
    }
    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn local_ip() -> String {
        "0.0.0.0".to_string()
    }
    pub fn local_port() -> String {
        "0".to_string()
    }
    pub fn port_9999() -> String {
        "9999".to_string()
    }
    pub fn kcp_mode() -> String {
        "fast".to_string()
    }
    pub fn kcp_block() -> String {
        "aes".to_string()
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn socks5_listen() -> String {
        "127.0.0.1".to_string()
    }
    pub fn socks5_port() -> String {
        "1080".to_string()
    }
    pub fn tcp_flags() -> Vec<String> {
        vec!["PA".to_string()]
    }
}

/// One flat snapshot of the form state. Translation reads it, never writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub role: Role,
    pub log_level: String,
    pub interface: String,
    pub guid: String,
    pub local_ip: String,
    pub local_port: String,
    pub router_mac: String,
    pub server_ip: String,
    pub server_port: String,
    pub listen_port: String,
    pub kcp_mode: String,
    pub kcp_block: String,
    pub kcp_key: String,
    pub kcp_mtu: String,
    pub kcp_rcvwnd: String,
    pub kcp_sndwnd: String,
    pub socks5_enabled: bool,
    pub socks5_listen: String,
    pub socks5_port: String,
    pub socks5_username: String,
    pub socks5_password: String,
    pub tcp_local_flags: Vec<String>,
    pub tcp_remote_flags: Vec<String>,
}

impl Default for Settings {
    fn default() -> Settings {
        return Settings {
            role: defaults::role(),
            log_level: defaults::log_level(),
            interface: String::new(),
            guid: String::new(),
            local_ip: defaults::local_ip(),
            local_port: defaults::local_port(),
            router_mac: String::new(),
            server_ip: String::new(),
            server_port: defaults::port_9999(),
            listen_port: defaults::port_9999(),
            kcp_mode: defaults::kcp_mode(),
            kcp_block: defaults::kcp_block(),
            kcp_key: String::new(),
            kcp_mtu: String::new(),
            kcp_rcvwnd: String::new(),
            kcp_sndwnd: String::new(),
            socks5_enabled: defaults::enabled(),
            socks5_listen: defaults::socks5_listen(),
            socks5_port: defaults::socks5_port(),
            socks5_username: String::new(),
            socks5_password: String::new(),
            tcp_local_flags: defaults::tcp_flags(),
            tcp_remote_flags: defaults::tcp_flags(),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ipv4Section {
    pub addr: String,
    pub router_mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSection {
    pub local_flag: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_flag: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub ipv4: Ipv4Section,
    pub tcp: TcpSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KcpSection {
    pub mode: String,
    pub mtu: u32,
    pub rcvwnd: u32,
    pub sndwnd: u32,
    pub block: String,
    pub key: String,
    pub smuxbuf: u32,
    pub streambuf: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSection {
    pub protocol: String,
    pub conn: u32,
    pub kcp: KcpSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socks5Section {
    pub listen: String,
    pub username: String,
    pub password: String,
}

/// The document handed to the paqet binary. Field order is the key order
/// written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub role: Role,
    pub log: LogSection,
    pub network: NetworkSection,
    pub transport: TransportSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<Endpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socks5: Option<Vec<Socks5Section>>,
}

fn parse_or(text: &str, fallback: u32) -> u32 {
    return text.trim().parse::<u32>().unwrap_or(fallback);
}

/// Pure settings-to-config translation. Never touches disk, never generates
/// key material.
pub fn build(settings: &Settings) -> TunnelConfig {
    let is_client = settings.role == Role::Client;

    let mut local_port = settings.local_port.clone();
    if !is_client && local_port == "0" {
        local_port = settings.listen_port.clone();
    }

    return TunnelConfig {
        role: settings.role,
        log: LogSection {
            level: settings.log_level.clone(),
        },
        network: NetworkSection {
            interface: settings.interface.clone(),
            guid: if settings.guid.is_empty() {
                None
            } else {
                Some(settings.guid.clone())
            },
            ipv4: Ipv4Section {
                addr: format!("{}:{}", settings.local_ip, local_port),
                router_mac: settings.router_mac.clone(),
            },
            tcp: TcpSection {
                local_flag: settings.tcp_local_flags.clone(),
                remote_flag: if is_client {
                    Some(settings.tcp_remote_flags.clone())
                } else {
                    None
                },
            },
        },
        transport: TransportSection {
            protocol: "kcp".to_string(),
            conn: 1,
            kcp: KcpSection {
                mode: settings.kcp_mode.clone(),
                mtu: parse_or(&settings.kcp_mtu, 1350),
                rcvwnd: parse_or(&settings.kcp_rcvwnd, if is_client { 512 } else { 1024 }),
                sndwnd: parse_or(&settings.kcp_sndwnd, if is_client { 512 } else { 1024 }),
                block: settings.kcp_block.clone(),
                key: settings.kcp_key.clone(),
                smuxbuf: SMUX_BUFFER,
                streambuf: STREAM_BUFFER,
            },
        },
        server: if is_client {
            Some(Endpoint {
                addr: format!("{}:{}", settings.server_ip, settings.server_port),
            })
        } else {
            None
        },
        listen: if is_client {
            None
        } else {
            Some(Endpoint {
                addr: format!(":{}", settings.listen_port),
            })
        },
        socks5: if is_client && settings.socks5_enabled {
            Some(vec![Socks5Section {
                listen: format!("{}:{}", settings.socks5_listen, settings.socks5_port),
                username: settings.socks5_username.clone(),
                password: settings.socks5_password.clone(),
            }])
        } else {
            None
        },
    };
}

impl Settings {
    /// Inverse of `build`, used when a saved configuration is loaded back
    /// into the form.
    pub fn from_config(config: &TunnelConfig) -> Settings {
        let mut settings = Settings::default();
        settings.role = config.role;
        settings.log_level = config.log.level.clone();
        settings.interface = config.network.interface.clone();
        settings.guid = config.network.guid.clone().unwrap_or_default();

        if let Some((ip, port)) = config.network.ipv4.addr.rsplit_once(':') {
            settings.local_ip = ip.to_string();
            settings.local_port = port.to_string();
        }
        settings.router_mac = config.network.ipv4.router_mac.clone();

        settings.tcp_local_flags = config.network.tcp.local_flag.clone();
        if let Some(remote) = &config.network.tcp.remote_flag {
            settings.tcp_remote_flags = remote.clone();
        }

        let kcp = &config.transport.kcp;
        settings.kcp_mode = kcp.mode.clone();
        settings.kcp_mtu = kcp.mtu.to_string();
        settings.kcp_rcvwnd = kcp.rcvwnd.to_string();
        settings.kcp_sndwnd = kcp.sndwnd.to_string();
        settings.kcp_block = kcp.block.clone();
        settings.kcp_key = kcp.key.clone();

        if let Some(server) = &config.server {
            if let Some((ip, port)) = server.addr.rsplit_once(':') {
                settings.server_ip = ip.to_string();
                settings.server_port = port.to_string();
            }
        }
        if let Some(listen) = &config.listen {
            settings.listen_port = listen.addr.trim_start_matches(':').to_string();
        }

        match &config.socks5 {
            Some(entries) if !entries.is_empty() => {
                settings.socks5_enabled = true;
                if let Some((ip, port)) = entries[0].listen.rsplit_once(':') {
                    settings.socks5_listen = ip.to_string();
                    settings.socks5_port = port.to_string();
                }
                settings.socks5_username = entries[0].username.clone();
                settings.socks5_password = entries[0].password.clone();
            }
            _ => {
                if config.role == Role::Client {
                    settings.socks5_enabled = false;
                }
            }
        }

        return settings;
    }
}

/// 32 random bytes from the OS, hex-encoded. Called only when the user asks
/// for a fresh key.
pub fn generate_secret_key() -> String {
    let mut key = [0u8; 32];
    OsRng.try_fill_bytes(&mut key).unwrap();
    return hex::encode(key);
}

pub fn save_config(config: &TunnelConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_yaml::to_string(config)?;
    fs::write(path, text)?;
    return Ok(());
}

pub fn load_config(path: &Path) -> Result<TunnelConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    return Ok(serde_yaml::from_str(&text)?);
}
