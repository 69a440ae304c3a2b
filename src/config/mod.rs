use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Longest honoured session lifetime (ten years). Keeps expiry arithmetic in range.
const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Which backend keeps upload session records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreKind {
    Memory,
    File,
}

impl SessionStoreKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "file" | "disk" => Some(Self::File),
            _ => None,
        }
    }
}

/// Configuration for the chunk receiver and assembler
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Chunk size advertised to clients in bytes (default: 5 MB)
    pub chunk_size: usize,

    /// Largest chunk body accepted in bytes (default: 10 MB)
    pub max_chunk_size: usize,

    /// Upper bound on chunks per session (default: 4096)
    pub max_total_chunks: u32,

    /// Session lifetime in seconds, counted from init (default: 24 hours)
    pub session_ttl_secs: u64,

    /// Pending sessions a single user may hold at once (default: 20)
    pub max_sessions_per_user: usize,

    /// Seconds between reaper sweeps (default: 300)
    pub reaper_interval_secs: u64,

    /// Root for temporary chunk files
    pub temp_dir: PathBuf,

    /// Root for assembled artifacts
    pub storage_dir: PathBuf,

    /// Session record backend: "memory" or "file" (default: "file")
    pub session_store: SessionStoreKind,

    /// Directory for the file-backed session store
    pub session_store_dir: PathBuf,

    /// Prefix prepended to artifact paths to form asset locators (default: "/media")
    pub public_base_url: String,

    /// JSON catalog of lecture slots and their owners. Unset means every well-formed
    /// destination is accepted.
    pub catalog_path: Option<PathBuf>,

    /// JWT Secret Key (Required)
    pub jwt_secret: String,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,      // 5 MB
            max_chunk_size: 10 * 1024 * 1024, // 10 MB
            max_total_chunks: 4096,
            session_ttl_secs: 24 * 60 * 60,
            max_sessions_per_user: 20,
            reaper_interval_secs: 300,
            temp_dir: PathBuf::from("uploads/chunks"),
            storage_dir: PathBuf::from("uploads/media"),
            session_store: SessionStoreKind::File,
            session_store_dir: PathBuf::from("uploads/sessions"),
            public_base_url: "/media".to_string(),
            catalog_path: None,
            jwt_secret: "secret".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(), // Vite default
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            chunk_size: parse_var("CHUNK_SIZE").unwrap_or(default.chunk_size),
            max_chunk_size: parse_var("MAX_CHUNK_SIZE").unwrap_or(default.max_chunk_size),
            max_total_chunks: parse_var("MAX_TOTAL_CHUNKS").unwrap_or(default.max_total_chunks),
            session_ttl_secs: parse_var("SESSION_TTL_SECS").unwrap_or(default.session_ttl_secs),
            max_sessions_per_user: parse_var("MAX_SESSIONS_PER_USER")
                .unwrap_or(default.max_sessions_per_user),
            reaper_interval_secs: parse_var("REAPER_INTERVAL_SECS")
                .unwrap_or(default.reaper_interval_secs),
            temp_dir: env::var("UPLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),
            storage_dir: env::var("UPLOAD_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.storage_dir),
            session_store: env::var("SESSION_STORE")
                .ok()
                .and_then(|v| SessionStoreKind::parse(&v))
                .unwrap_or(default.session_store),
            session_store_dir: env::var("SESSION_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.session_store_dir),
            public_base_url: env::var("PUBLIC_BASE_URL").unwrap_or(default.public_base_url),
            catalog_path: env::var("CATALOG_PATH").ok().map(PathBuf::from),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(default.jwt_secret),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Create config for development and tests: in-memory sessions rooted at `root`
    pub fn development(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            temp_dir: root.join("chunks"),
            storage_dir: root.join("media"),
            session_store: SessionStoreKind::Memory,
            session_store_dir: root.join("sessions"),
            ..Self::default()
        }
    }

    /// Session lifetime, capped at ten years.
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs.min(MAX_SESSION_TTL_SECS) as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.session_ttl_secs, 86_400);
        assert_eq!(config.max_sessions_per_user, 20);
        assert_eq!(config.session_store, SessionStoreKind::File);
    }

    #[test]
    fn test_development_config() {
        let config = UploadConfig::development("/tmp/dev");
        assert_eq!(config.session_store, SessionStoreKind::Memory);
        assert_eq!(config.temp_dir, PathBuf::from("/tmp/dev/chunks"));
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/dev/media"));
    }

    #[test]
    fn test_huge_ttl_is_capped() {
        let config = UploadConfig {
            session_ttl_secs: u64::MAX,
            ..UploadConfig::default()
        };
        let ttl = config.session_ttl();
        assert_eq!(ttl.num_seconds(), MAX_SESSION_TTL_SECS as i64);
        assert!(chrono::Utc::now() + ttl > chrono::Utc::now());

        let config = UploadConfig {
            session_ttl_secs: 90,
            ..UploadConfig::default()
        };
        assert_eq!(config.session_ttl().num_seconds(), 90);
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!(SessionStoreKind::parse("Memory"), Some(SessionStoreKind::Memory));
        assert_eq!(SessionStoreKind::parse("disk"), Some(SessionStoreKind::File));
        assert_eq!(SessionStoreKind::parse("redis"), None);
    }

    #[test]
    fn test_from_env_cors_fallback() {
        unsafe { env::remove_var("ALLOWED_ORIGINS") };
        let config = UploadConfig::from_env();
        let default_config = UploadConfig::default();
        assert_eq!(config.allowed_origins, default_config.allowed_origins);
        assert!(!config.allowed_origins.contains(&"*".to_string()));
    }
}
