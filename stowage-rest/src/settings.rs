//! Server settings.

use std::{
    fmt::Debug,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use stowage::{driver::LocalDriver, protocol::UploadSettings, Config};

use crate::AppContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory the local driver stores objects under.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Scratch area for chunk staging.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Slice size for the disk-staged engine, in MiB.
    #[serde(default = "default_chunk_mib")]
    pub chunked_upload_chunk_size: u64,

    /// Slice size for the pipe-streamed engine, in MiB.
    #[serde(default = "default_chunk_mib")]
    pub stream_upload_chunk_size: u64,

    /// Drop `.DS_Store`-style junk files at ingest time.
    #[serde(default)]
    pub ignore_system_files: bool,

    /// Shared secret checked against the `Password` header, when set.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_ip")]
    pub ip: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("stowage")
}

const fn default_chunk_mib() -> u64 {
    95
}

const fn default_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: default_root(),
            temp_dir: default_temp_dir(),
            chunked_upload_chunk_size: default_chunk_mib(),
            stream_upload_chunk_size: default_chunk_mib(),
            ignore_system_files: false,
            password: None,
            ip: default_ip(),
            port: default_port(),
        }
    }
}

/// Failure to read or parse the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read settings file")]
    Io(#[from] std::io::Error),
    #[error("cannot parse settings file")]
    Toml(#[from] toml::de::Error),
}

impl Settings {
    /// Load settings from the TOML file named by `STOWAGE_CONFIG`
    /// (default `stowage.toml`), falling back to defaults when the
    /// file does not exist. `STOWAGE_ROOT` and `STOWAGE_PASSWORD`
    /// override their file counterparts.
    ///
    /// # Errors
    ///
    /// An unreadable or unparsable settings file.
    pub fn load() -> Result<Self, SettingsError> {
        let path: PathBuf = env_opt("STOWAGE_CONFIG").unwrap_or_else(|| "stowage.toml".into());

        let mut settings: Settings = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };

        if let Some(root) = env_opt::<PathBuf>("STOWAGE_ROOT") {
            settings.root = root;
        }

        if let Some(password) = env_opt::<String>("STOWAGE_PASSWORD") {
            settings.password = Some(password);
        }

        Ok(settings)
    }

    pub fn engine_config(&self) -> Config {
        let mut config = Config::new(&self.temp_dir);
        config.ignore_system_files = self.ignore_system_files;

        config
    }

    pub fn to_ctx(&self) -> AppContext {
        AppContext::new(LocalDriver::new(&self.root), self.engine_config())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The slice-size settings splitter clients ask for.
    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            chunked_upload_chunk_size: self.chunked_upload_chunk_size,
            stream_upload_chunk_size: self.stream_upload_chunk_size,
        }
    }
}

/// Get an environment variable, or return `None` if it isn't set.
///
/// # Panics
///
/// If the environment variable exists but cannot be parsed, this
/// function panics.
pub fn env_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
    <T as FromStr>::Err: Debug,
{
    dotenv::var(key).ok().map(|s| {
        s.parse()
            .unwrap_or_else(|e| panic!("`{key}` was defined but could not be parsed: {e:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let settings: Settings = toml::from_str(r#"root = "/srv/objects""#).unwrap();

        assert_eq!(settings.root, PathBuf::from("/srv/objects"));
        assert_eq!(settings.chunked_upload_chunk_size, 95);
        assert_eq!(settings.stream_upload_chunk_size, 95);
        assert_eq!(settings.port, 8000);
        assert!(!settings.ignore_system_files);
        assert!(settings.password.is_none());
    }
}
