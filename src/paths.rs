use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("WARDEN_DATA_DIR") {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("warden"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("warden.pid")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("warden.sock")
    }

    pub fn port_file(&self) -> PathBuf {
        self.data_dir.join("warden.port")
    }

    /// Watchdog-persisted state: last-known-good commit and crash counter.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("watchdog.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.data_dir.join("logs").join(format!("{name}-out.log"))
    }

    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.data_dir.join("logs").join(format!("{name}-err.log"))
    }
}
