use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VidqConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    pub extractor: ExtractorSection,
    pub download: DownloadSection,
}

impl VidqConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.media_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub media_dir: String,
    pub data_dir: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorSection {
    pub binary: String,
    pub metadata_timeout_seconds: u64,
    pub retries: u32,
    pub fragment_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    pub max_height: u32,
    pub container: String,
    pub timeout_seconds: u64,
    pub stall_warning_seconds: u64,
    pub max_concurrent: usize,
}

pub fn load_vidq_config<P: AsRef<Path>>(path: P) -> Result<VidqConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/vidq.toml");
        let config = load_vidq_config(path).expect("config should parse");
        assert_eq!(config.system.node_name, "vidq-primary");
        assert_eq!(config.download.max_height, 720);
        assert_eq!(config.download.container, "mp4");
        assert!(config.download.timeout_seconds >= 60);
    }

    #[test]
    fn resolve_path_anchors_relative_at_base_dir() {
        let config = VidqConfig {
            system: SystemSection {
                node_name: "test".into(),
                environment: "test".into(),
            },
            paths: PathsSection {
                base_dir: "/srv/vidq".into(),
                media_dir: "media".into(),
                data_dir: "data".into(),
                logs_dir: "logs".into(),
            },
            extractor: ExtractorSection {
                binary: "yt-dlp".into(),
                metadata_timeout_seconds: 20,
                retries: 3,
                fragment_retries: 3,
            },
            download: DownloadSection {
                max_height: 720,
                container: "mp4".into(),
                timeout_seconds: 300,
                stall_warning_seconds: 60,
                max_concurrent: 2,
            },
        };
        assert_eq!(config.media_dir(), PathBuf::from("/srv/vidq/media"));
        assert_eq!(config.resolve_path("/abs"), PathBuf::from("/abs"));
    }
}
