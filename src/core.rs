use std::{
    collections::VecDeque,
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread,
};

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::config::{self, Settings, TunnelConfig};
use crate::paqet::{LogLine, Paqet, Severity};
use crate::store::{Database, RecentConfig};

const LOG_LINES: usize = 500;

#[cfg(windows)]
pub const BUNDLED_BINARY: &str = "paqet_windows_amd64.exe";
#[cfg(not(windows))]
pub const BUNDLED_BINARY: &str = "paqet";

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub time: String,
    pub level: &'static str,
    pub message: String,
}

fn push_entry(logs: &Mutex<VecDeque<LogEntry>>, level: &'static str, message: String) {
    let mut logs = logs.lock();
    if logs.len() == LOG_LINES {
        logs.pop_front();
    }
    logs.push_back(LogEntry {
        time: Local::now().format("%H:%M:%S").to_string(),
        level: level,
        message: message,
    });
}

/// Everything the control API works against: the store, the supervisor, the
/// session log ring and the resolved binary path.
pub struct App {
    data_dir: PathBuf,
    pub db: Database,
    paqet: Paqet,
    logs: Arc<Mutex<VecDeque<LogEntry>>>,
    binary: Mutex<PathBuf>,
}

impl App {
    pub async fn new(data_dir: PathBuf) -> App {
        let db = Database::open(data_dir.join("paqet_gui.db")).await;

        let logs: Arc<Mutex<VecDeque<LogEntry>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (sender, receiver) = mpsc::channel::<LogLine>();

        let drain = logs.clone();
        thread::spawn(move || {
            for line in receiver {
                push_entry(&drain, line.severity.as_str(), line.message);
            }
        });

        let binary = match find_binary() {
            Some(path) => {
                db.set("binary_path", &json!(path.to_string_lossy())).await;
                path
            }
            None => {
                let saved = db.get("binary_path", Value::Null).await;
                saved
                    .as_str()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(BUNDLED_BINARY))
            }
        };
        logging!("Core", "Using paqet binary at {}.", binary.to_string_lossy());

        return App {
            data_dir: data_dir,
            db: db,
            paqet: Paqet::new(sender),
            logs: logs,
            binary: Mutex::new(binary),
        };
    }

    #[cfg(test)]
    pub async fn for_tests(data_dir: PathBuf) -> App {
        let mut app = App::new(data_dir).await;
        app.paqet = {
            let (sender, _receiver) = mpsc::channel::<LogLine>();
            Paqet::new(sender).elevate(false)
        };
        return app;
    }

    pub fn config_path(&self) -> PathBuf {
        return self.data_dir.join("config.yaml");
    }

    pub fn binary_path(&self) -> PathBuf {
        return self.binary.lock().clone();
    }

    pub fn set_binary_path(&self, path: PathBuf) -> bool {
        if !path.is_file() {
            return false;
        }
        *self.binary.lock() = path;
        return true;
    }

    pub fn log(&self, severity: Severity, message: String) {
        logging!("Session", "{}", message);
        push_entry(&self.logs, severity.as_str(), message);
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        return self.logs.lock().iter().cloned().collect();
    }

    pub fn clear_logs(&self) {
        self.logs.lock().clear();
    }

    pub fn state_json(&self) -> Value {
        return json!({
            "state": self.paqet.state().as_str(),
            "binary": self.binary_path().to_string_lossy(),
            "config": self.config_path().to_string_lossy(),
        });
    }

    /// Validate, translate, write the YAML, hand it to the supervisor, and on
    /// success record the run. Any validation failure blocks the launch.
    pub async fn start_tunnel(&self, settings: Settings) -> Result<(), Vec<String>> {
        let binary = self.binary_path();
        if !binary.is_file() {
            let message = format!("paqet binary not found at {}", binary.to_string_lossy());
            self.log(Severity::Error, message.clone());
            return Err(vec![message]);
        }

        let errors = validate(&settings);
        if !errors.is_empty() {
            for error in errors.iter() {
                self.log(Severity::Error, error.clone());
            }
            return Err(errors);
        }

        let config = config::build(&settings);
        let path = self.config_path();
        if let Err(e) = config::save_config(&config, &path) {
            let message = format!("cannot write configuration: {}", e);
            self.log(Severity::Error, message.clone());
            return Err(vec![message]);
        }

        if !self.paqet.start(&binary, &path) {
            return Err(vec!["tunnel is already running".to_string()]);
        }

        self.record_file(&path, &config).await;
        self.db
            .set(
                "form_vars",
                &serde_json::to_value(&settings).unwrap_or(Value::Null),
            )
            .await;
        self.db
            .set("binary_path", &json!(binary.to_string_lossy()))
            .await;

        self.log(Severity::Info, "Tunnel successfully started.".to_string());
        return Ok(());
    }

    /// Blocks for up to the stop grace period.
    pub fn stop_tunnel(&self) {
        self.paqet.stop();
        self.log(Severity::Info, "Tunnel stopped.".to_string());
    }

    pub async fn import_config(&self, path: &Path) -> Result<Settings, String> {
        let config = config::load_config(path).map_err(|e| e.to_string())?;
        self.record_file(path, &config).await;

        let settings = Settings::from_config(&config);
        self.log(
            Severity::Info,
            format!("Imported configuration from {}.", path.to_string_lossy()),
        );
        return Ok(settings);
    }

    pub async fn export_config(&self, path: &Path, settings: &Settings) -> Result<(), String> {
        let config = config::build(settings);
        config::save_config(&config, path).map_err(|e| e.to_string())?;
        self.record_file(path, &config).await;

        self.log(
            Severity::Info,
            format!("Exported configuration to {}.", path.to_string_lossy()),
        );
        return Ok(());
    }

    async fn record_file(&self, path: &Path, config: &TunnelConfig) {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "config.yaml".to_string());
        self.db.add_recent(&name, path, config).await;
    }

    /// Loads a recent entry back into form settings and refreshes its
    /// recency.
    pub async fn apply_recent(&self, id: i64) -> Result<Settings, String> {
        let rows = self.db.recent().await;
        let Some(row) = rows.into_iter().find(|row| row.id == id) else {
            return Err(format!("no recent configuration with id {}", id));
        };

        let config: TunnelConfig =
            serde_json::from_str(&row.config_json).map_err(|e| e.to_string())?;
        self.db.touch_recent(&row.filepath).await;
        return Ok(Settings::from_config(&config));
    }

    pub async fn recent(&self) -> Vec<RecentConfig> {
        return self.db.recent().await;
    }
}

/// Required-field checks mirroring what the paqet binary itself rejects.
pub fn validate(settings: &Settings) -> Vec<String> {
    let mut errors = vec![];

    // Interface capture needs the device name and adapter guid only on
    // windows; elsewhere the binary resolves the interface itself.
    if cfg!(windows) {
        if settings.interface.is_empty() {
            errors.push("network interface is required".to_string());
        } else if settings.guid.is_empty() {
            errors.push("guid is required on windows".to_string());
        }
    }

    if settings.router_mac.is_empty() {
        errors.push("MAC address is required".to_string());
    }
    if settings.kcp_key.is_empty() {
        errors.push("KCP encryption key is required".to_string());
    }

    match settings.role {
        config::Role::Client => {
            if settings.server_ip.is_empty() {
                errors.push("server IP address is required".to_string());
            }
        }
        config::Role::Server => {
            if settings.listen_port.is_empty() {
                errors.push("listen port is required".to_string());
            }
        }
    }

    return errors;
}

/// Looks for the bundled binary next to the executable and in the working
/// directory before giving up.
pub fn find_binary() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = vec![];

    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join(BUNDLED_BINARY));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join(BUNDLED_BINARY));
        if let Some(parent) = cwd.parent() {
            candidates.push(parent.join(BUNDLED_BINARY));
        }
    }

    for candidate in candidates.into_iter() {
        if fs::metadata(&candidate)
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Some(candidate);
        }
    }
    return None;
}
