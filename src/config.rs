use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub schema: SchemaConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    /// Deployment flag for installs that have not run the schema-enhancement
    /// migrations. When set, the newer optional columns start out unsupported
    /// instead of being discovered through query failures.
    pub legacy_schema: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?;
        let redis_url = env::var("REDIS_URL").ok();
        let legacy_schema = env::var("STUDIO_LEGACY_SCHEMA")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig { url },
            cache: CacheConfig { redis_url },
            schema: SchemaConfig { legacy_schema },
        })
    }
}
