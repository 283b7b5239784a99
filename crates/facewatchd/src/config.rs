use facewatch_core::{
    Durability, DEFAULT_FRAME_SCALE, DEFAULT_LABEL_CAPACITY, DEFAULT_MATCH_THRESHOLD,
};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum L2 distance (exclusive) for a face to be labelled as known.
    pub match_threshold: f32,
    /// Downscale factor applied to live frames before detection.
    pub frame_scale: f32,
    /// Maximum embeddings kept per label.
    pub label_capacity: usize,
    /// Embedding dimensionality produced by the extractor.
    pub embedding_dim: usize,
    /// Delay between capture cycles, in milliseconds.
    pub frame_interval_ms: u64,
    /// External detect+embed program, split on whitespace.
    pub extractor_cmd: Vec<String>,
    /// Commit ordering between the in-memory store and the database.
    pub durability: Durability,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        let db_path = get("FACEWATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("faces.db"));

        let durability = match get("FACEWATCH_STRICT_COMMIT").as_deref() {
            Some("0") => Durability::BestEffort,
            _ => Durability::Strict,
        };

        Self {
            camera_device: get("FACEWATCH_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            db_path,
            match_threshold: parse_or(&get, "FACEWATCH_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            frame_scale: parse_or(&get, "FACEWATCH_FRAME_SCALE", DEFAULT_FRAME_SCALE),
            label_capacity: parse_or(&get, "FACEWATCH_LABEL_CAPACITY", DEFAULT_LABEL_CAPACITY),
            embedding_dim: parse_or(&get, "FACEWATCH_EMBEDDING_DIM", 128),
            frame_interval_ms: parse_or(&get, "FACEWATCH_FRAME_INTERVAL_MS", 33),
            extractor_cmd: get("FACEWATCH_EXTRACTOR_CMD")
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            durability,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config_from(&[("HOME", "/home/op")]);
        assert_eq!(cfg.camera_device, "/dev/video0");
        assert_eq!(cfg.db_path, PathBuf::from("/home/op/.local/share/facewatch/faces.db"));
        assert_eq!(cfg.match_threshold, 0.4);
        assert_eq!(cfg.frame_scale, 0.5);
        assert_eq!(cfg.label_capacity, 10);
        assert_eq!(cfg.embedding_dim, 128);
        assert!(cfg.extractor_cmd.is_empty());
        assert_eq!(cfg.durability, Durability::Strict);
    }

    #[test]
    fn test_overrides() {
        let cfg = config_from(&[
            ("XDG_DATA_HOME", "/data"),
            ("FACEWATCH_MATCH_THRESHOLD", "0.55"),
            ("FACEWATCH_LABEL_CAPACITY", "3"),
            ("FACEWATCH_EXTRACTOR_CMD", "python3 embed.py --cpu"),
            ("FACEWATCH_STRICT_COMMIT", "0"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/data/facewatch/faces.db"));
        assert_eq!(cfg.match_threshold, 0.55);
        assert_eq!(cfg.label_capacity, 3);
        assert_eq!(cfg.extractor_cmd, vec!["python3", "embed.py", "--cpu"]);
        assert_eq!(cfg.durability, Durability::BestEffort);
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = config_from(&[("FACEWATCH_FRAME_SCALE", "half")]);
        assert_eq!(cfg.frame_scale, 0.5);
    }
}
