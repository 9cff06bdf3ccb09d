use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_bounded_i32, parse_channel_list,
    parse_cors_origins, parse_environment, parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, ProgressSettings, RedisSettings, RuntimeSettings,
    S3Settings, ServerHost, ServerPort, ServerSettings, Settings, SqsSettings, TelemetrySettings,
    TopicSettings,
};

const DEFAULT_TOPIC_CHANNELS: &[&str] = &["id-result", "answer-result", "answer-fallback"];

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("GRADI_HOST", "0.0.0.0");
        let port = env_or_default("GRADI_PORT", "8080");

        let environment =
            parse_environment(env_optional("GRADI_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADI_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Gradi Progress API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_prefix = env_or_default("API_V1_STR", "/api");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let topic_enabled =
            env_optional("TOPIC_ENABLED").map(|value| parse_bool(&value)).unwrap_or(true);
        let topic_channels =
            parse_channel_list(env_optional("TOPIC_CHANNELS"), DEFAULT_TOPIC_CHANNELS);
        let topic_reconnect_seconds = parse_u64(
            "TOPIC_RECONNECT_SECONDS",
            env_or_default("TOPIC_RECONNECT_SECONDS", "5"),
        )?;

        let sqs_enabled =
            env_optional("SQS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);
        let sqs_queue_url = env_or_default("SQS_QUEUE_URL", "");
        let sqs_region = env_or_default("SQS_REGION", "ap-northeast-2");
        let sqs_endpoint = env_optional("SQS_ENDPOINT");
        let sqs_max_messages = parse_bounded_i32(
            "SQS_MAX_MESSAGES",
            env_or_default("SQS_MAX_MESSAGES", "10"),
            1,
            10,
        )?;
        let sqs_wait_seconds = parse_bounded_i32(
            "SQS_WAIT_SECONDS",
            env_or_default("SQS_WAIT_SECONDS", "5"),
            0,
            20,
        )?;
        let sqs_poll_interval_ms =
            parse_u64("SQS_POLL_INTERVAL_MS", env_or_default("SQS_POLL_INTERVAL_MS", "1000"))?;
        let sqs_max_failures =
            parse_u32("SQS_MAX_FAILURES", env_or_default("SQS_MAX_FAILURES", "10"))?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://s3.ap-northeast-2.amazonaws.com");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "mlpa-gradi");
        let s3_region = env_or_default("S3_REGION", "ap-northeast-2");
        let presigned_url_expire_minutes = parse_u64(
            "PRESIGNED_URL_EXPIRE_MINUTES",
            env_or_default("PRESIGNED_URL_EXPIRE_MINUTES", "60"),
        )?;

        let heartbeat_seconds =
            parse_u64("SSE_HEARTBEAT_SECONDS", env_or_default("SSE_HEARTBEAT_SECONDS", "5"))?;
        let idle_timeout_seconds = parse_u64(
            "SESSION_IDLE_TIMEOUT_SECONDS",
            env_or_default("SESSION_IDLE_TIMEOUT_SECONDS", "600"),
        )?;
        let channel_capacity =
            parse_usize("SSE_CHANNEL_CAPACITY", env_or_default("SSE_CHANNEL_CAPACITY", "64"))?;
        let dedup_ttl_seconds =
            parse_u64("DEDUP_TTL_SECONDS", env_or_default("DEDUP_TTL_SECONDS", "86400"))?;
        let dedup_max_entries =
            parse_usize("DEDUP_MAX_ENTRIES", env_or_default("DEDUP_MAX_ENTRIES", "100000"))?;

        let log_level = env_or_default("GRADI_LOG_LEVEL", "info");
        let json = env_optional("GRADI_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_prefix },
            cors: CorsSettings { origins: cors_origins },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            topic: TopicSettings {
                enabled: topic_enabled,
                channels: topic_channels,
                reconnect_seconds: topic_reconnect_seconds,
            },
            sqs: SqsSettings {
                enabled: sqs_enabled,
                queue_url: sqs_queue_url,
                region: sqs_region,
                endpoint: sqs_endpoint,
                max_messages: sqs_max_messages,
                wait_seconds: sqs_wait_seconds,
                poll_interval_ms: sqs_poll_interval_ms,
                max_failures: sqs_max_failures,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
                presigned_url_expire_minutes,
            },
            progress: ProgressSettings {
                heartbeat_seconds,
                idle_timeout_seconds,
                channel_capacity,
                dedup_ttl_seconds,
                dedup_max_entries,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn topic(&self) -> &TopicSettings {
        &self.topic
    }

    pub(crate) fn sqs(&self) -> &SqsSettings {
        &self.sqs
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn progress(&self) -> &ProgressSettings {
        &self.progress
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("SSE_HEARTBEAT_SECONDS", self.progress.heartbeat_seconds),
            ("SESSION_IDLE_TIMEOUT_SECONDS", self.progress.idle_timeout_seconds),
            ("SSE_CHANNEL_CAPACITY", self.progress.channel_capacity as u64),
            ("DEDUP_TTL_SECONDS", self.progress.dedup_ttl_seconds),
            ("DEDUP_MAX_ENTRIES", self.progress.dedup_max_entries as u64),
            ("SQS_MAX_FAILURES", u64::from(self.sqs.max_failures)),
            ("TOPIC_RECONNECT_SECONDS", self.topic.reconnect_seconds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, value: "0".to_string() });
            }
        }

        if self.topic.enabled && self.topic.channels.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "TOPIC_CHANNELS",
                value: String::from("<empty>"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.sqs.enabled && self.sqs.queue_url.is_empty() {
            return Err(ConfigError::MissingSetting("SQS_QUEUE_URL"));
        }
        if !self.s3.is_configured() {
            return Err(ConfigError::MissingSetting("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, Settings};
    use crate::test_support;

    #[tokio::test]
    async fn load_uses_defaults_in_test_env() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.progress().heartbeat_seconds, 5);
        assert_eq!(settings.progress().idle_timeout_seconds, 600);
        assert_eq!(settings.sqs().max_messages, 10);
        assert_eq!(settings.sqs().max_failures, 10);
        assert_eq!(settings.topic().channels.len(), 3);
        assert!(!settings.s3().is_configured());
    }

    #[tokio::test]
    async fn load_rejects_zero_heartbeat() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("SSE_HEARTBEAT_SECONDS", "0");

        let result = Settings::load();
        std::env::remove_var("SSE_HEARTBEAT_SECONDS");

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "SSE_HEARTBEAT_SECONDS", .. })
        ));
    }

    #[tokio::test]
    async fn strict_mode_requires_queue_url_when_sqs_enabled() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("GRADI_STRICT_CONFIG", "1");
        std::env::set_var("SQS_ENABLED", "1");

        let result = Settings::load();
        std::env::set_var("GRADI_STRICT_CONFIG", "0");
        std::env::remove_var("SQS_ENABLED");

        assert!(matches!(result, Err(ConfigError::MissingSetting("SQS_QUEUE_URL"))));
    }
}
