use crate::types::{AppError, AppResult};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub agent: AgentConfig,
    pub tasks: TaskConfig,
    pub logging: LoggingConfig,
}

/// Deployment profile, only changes defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Testing,
}

impl Environment {
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Environment::Development | Environment::Testing => {
                "research_agent_api=debug,tower_http=debug,axum=info"
            }
            Environment::Production => "research_agent_api=warn,tower_http=warn",
        }
    }
}

impl FromStr for Environment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "testing" | "test" => Ok(Environment::Testing),
            other => Err(AppError::Config(format!("unknown ENVIRONMENT '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub url: String,
    pub connection_timeout: Duration,
    /// Interval of the liveness ping that keeps `broker_connected` honest
    pub heartbeat: Duration,
    pub exchange_name: String,
    pub research_queue: String,
    pub results_queue: String,
    pub consumer_name: String,
    pub max_retries: u32,
    /// Run a queue consumer inside the API process
    pub consumer_embedded: bool,
    /// Deliveries idle longer than this are reclaimed from dead consumers
    pub reclaim_idle: Duration,
}

impl BrokerConfig {
    /// Stream that plays the role of the direct exchange bound to the research queue
    pub fn task_stream(&self) -> String {
        format!("{}:{}", self.exchange_name, self.research_queue)
    }

    pub fn results_stream(&self) -> String {
        format!("{}:{}", self.exchange_name, self.results_queue)
    }

    /// Periods that drive timers must be non-zero
    pub fn validate(&self) -> AppResult<()> {
        if self.heartbeat.is_zero() {
            return Err(AppError::Config("BROKER_HEARTBEAT must be at least 1 second".to_string()));
        }
        if self.reclaim_idle.is_zero() {
            return Err(AppError::Config(
                "BROKER_RECLAIM_IDLE_SECONDS must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub provider_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub reports_dir: String,
    pub default_max_iterations: u32,
}

impl AgentConfig {
    pub fn is_available(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Size of the inline worker pool used when the broker is unavailable
    pub max_concurrent: usize,
    pub timeout: Option<Duration>,
    pub retention: Option<Duration>,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub log_dir: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: &str) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(key, default);
    raw.trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{} has invalid value '{}': {}", key, raw, e)))
}

fn optional_secs(key: &str) -> AppResult<Option<Duration>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("{} has invalid value '{}': {}", key, raw, e)))?;
            Ok((secs > 0).then(|| Duration::from_secs(secs)))
        }
        _ => Ok(None),
    }
}

fn redis_url() -> AppResult<String> {
    if let Ok(url) = env::var("REDIS_URL") {
        return Ok(url);
    }

    let host = var_or("REDIS_HOST", "localhost");
    let port: u16 = parse_var("REDIS_PORT", "6379")?;
    let db: u32 = parse_var("REDIS_DB", "0")?;
    let url = match env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()) {
        Some(password) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
        None => format!("redis://{}:{}/{}", host, port, db),
    };
    Ok(url)
}

fn default_consumer_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "consumer".to_string());
    format!("{}-{}", host, std::process::id())
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let environment: Environment = parse_var("ENVIRONMENT", "development")?;

        let config = Self {
            environment,
            server: ServerConfig {
                port: parse_var("PORT", "8000")?,
                host: var_or("HOST", "0.0.0.0"),
                cors_allowed_origins: var_or("ALLOWED_ORIGINS", "*")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            broker: BrokerConfig {
                enabled: parse_var("BROKER_ENABLED", "true")?,
                url: redis_url()?,
                connection_timeout: Duration::from_secs(parse_var("BROKER_CONNECTION_TIMEOUT", "30")?),
                heartbeat: Duration::from_secs(parse_var("BROKER_HEARTBEAT", "60")?),
                exchange_name: var_or("EXCHANGE_NAME", "research_exchange"),
                research_queue: var_or("RESEARCH_QUEUE", "research_tasks"),
                results_queue: var_or("RESULTS_QUEUE", "research_results"),
                consumer_name: env::var("CONSUMER_NAME").unwrap_or_else(|_| default_consumer_name()),
                max_retries: parse_var("BROKER_MAX_RETRIES", "5")?,
                consumer_embedded: parse_var("CONSUMER_EMBEDDED", "true")?,
                reclaim_idle: Duration::from_secs(parse_var("BROKER_RECLAIM_IDLE_SECONDS", "300")?),
            },
            agent: AgentConfig {
                provider_url: var_or("LLM_PROVIDER_URL", "https://api.openai.com/v1"),
                api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
                model: var_or("LLM_MODEL", "gpt-4o-mini"),
                reports_dir: var_or("REPORTS_DIR", "reports"),
                default_max_iterations: parse_var("DEFAULT_MAX_ITERATIONS", "10")?,
            },
            tasks: TaskConfig {
                max_concurrent: parse_var("MAX_CONCURRENT_TASKS", "10")?,
                timeout: optional_secs("TASK_TIMEOUT_SECONDS")?,
                retention: optional_secs("TASK_RETENTION_SECONDS")?,
                poll_interval: Duration::from_millis(parse_var("WS_POLL_INTERVAL_MS", "2000")?),
                shutdown_grace: Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECONDS", "30")?),
            },
            logging: LoggingConfig {
                filter: env::var("RUST_LOG")
                    .unwrap_or_else(|_| environment.default_log_filter().to_string()),
                log_dir: env::var("LOG_DIR").ok().filter(|d| !d.is_empty()),
            },
        };
        config.broker.validate()?;
        Ok(config)
    }

    /// Defaults with the broker switched off, used by tests and local runs
    pub fn local() -> Self {
        Self {
            environment: Environment::Testing,
            server: ServerConfig {
                port: 8000,
                host: "127.0.0.1".to_string(),
                cors_allowed_origins: vec!["*".to_string()],
            },
            broker: BrokerConfig {
                enabled: false,
                url: "redis://localhost:6379/0".to_string(),
                connection_timeout: Duration::from_secs(30),
                heartbeat: Duration::from_secs(60),
                exchange_name: "research_exchange".to_string(),
                research_queue: "research_tasks".to_string(),
                results_queue: "research_results".to_string(),
                consumer_name: default_consumer_name(),
                max_retries: 5,
                consumer_embedded: true,
                reclaim_idle: Duration::from_secs(300),
            },
            agent: AgentConfig {
                provider_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                reports_dir: "reports".to_string(),
                default_max_iterations: 10,
            },
            tasks: TaskConfig {
                max_concurrent: 10,
                timeout: None,
                retention: None,
                poll_interval: Duration::from_secs(2),
                shutdown_grace: Duration::from_secs(30),
            },
            logging: LoggingConfig {
                filter: Environment::Testing.default_log_filter().to_string(),
                log_dir: None,
            },
        }
    }
}

/// Reference printed by `research-agent-api env-docs`
pub const ENV_VARS_DOCS: &str = "\
Environment variables for the research agent API:

# Profile
ENVIRONMENT=development          # development, production, testing
RUST_LOG=                        # overrides the profile's log filter
LOG_DIR=                         # also write daily-rolling log files here

# Server
HOST=0.0.0.0
PORT=8000
ALLOWED_ORIGINS=*

# Broker (Redis streams)
BROKER_ENABLED=true
REDIS_URL=                       # or REDIS_HOST / REDIS_PORT / REDIS_PASSWORD / REDIS_DB
BROKER_CONNECTION_TIMEOUT=30
BROKER_HEARTBEAT=60              # seconds, at least 1
BROKER_MAX_RETRIES=5
BROKER_RECLAIM_IDLE_SECONDS=300  # at least 1
EXCHANGE_NAME=research_exchange
RESEARCH_QUEUE=research_tasks
RESULTS_QUEUE=research_results
CONSUMER_NAME=                   # defaults to <hostname>-<pid>
CONSUMER_EMBEDDED=true

# Agent
LLM_PROVIDER_URL=https://api.openai.com/v1
LLM_API_KEY=
LLM_MODEL=gpt-4o-mini
REPORTS_DIR=reports
DEFAULT_MAX_ITERATIONS=10

# Tasks
MAX_CONCURRENT_TASKS=10
TASK_TIMEOUT_SECONDS=            # unset: no timeout
TASK_RETENTION_SECONDS=          # unset: keep finished tasks for the process lifetime
WS_POLL_INTERVAL_MS=2000
SHUTDOWN_GRACE_SECONDS=30
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("DEV".parse::<Environment>().unwrap(), Environment::Development);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_stream_names() {
        let config = Config::local();
        assert_eq!(config.broker.task_stream(), "research_exchange:research_tasks");
        assert_eq!(config.broker.results_stream(), "research_exchange:research_results");
    }

    #[test]
    fn test_zero_broker_periods_rejected() {
        let mut config = Config::local();
        assert!(config.broker.validate().is_ok());

        config.broker.heartbeat = Duration::ZERO;
        assert!(matches!(config.broker.validate(), Err(AppError::Config(msg)) if msg.contains("BROKER_HEARTBEAT")));

        config.broker.heartbeat = Duration::from_secs(60);
        config.broker.reclaim_idle = Duration::ZERO;
        assert!(matches!(config.broker.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_agent_availability() {
        let mut config = Config::local();
        assert!(!config.agent.is_available());
        config.agent.api_key = Some(String::new());
        assert!(!config.agent.is_available());
        config.agent.api_key = Some("sk-test".to_string());
        assert!(config.agent.is_available());
    }
}
