use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use etl_common::kafka::KafkaConfig;
use etl_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "order-stream")]
    pub order_topic: String,

    #[envconfig(default = "order-enriched-stream")]
    pub enriched_topic: String,

    #[envconfig(default = "order-etl-dead-letter")]
    pub dead_letter_topic: String,

    /// Partitions of both the order and the enriched stream; one worker each.
    #[envconfig(default = "2")]
    pub partition_count: u32,

    /// Upper bound on records pulled per fetch from one partition.
    #[envconfig(default = "100")]
    pub fetch_max: usize,

    #[envconfig(default = "250")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub consumer_poll_timeout: EnvMsDuration,

    #[envconfig(default = "retry-after-delay")]
    pub miss_policy: MissPolicy,

    #[envconfig(default = "dead-letter")]
    pub malformed_policy: MalformedPolicy,

    /// Lookup retries after the first miss, before dead-lettering.
    #[envconfig(default = "2")]
    pub lookup_max_retries: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "60")]
    pub refresh_interval_secs: u64,

    pub products_bucket: String,

    #[envconfig(default = "products/products.json")]
    pub products_key: String,

    #[envconfig(default = "5")]
    pub worker_restart_secs: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .maximum_interval(self.retry_policy.maximum_interval.0)
        .max_attempts(self.lookup_max_retries + 1)
        .provide()
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// What to do with an ITEM record whose product key is not in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    DropAndLog,
    EmitWithNullFields,
    RetryAfterDelay,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMissPolicyError(pub String);

impl FromStr for MissPolicy {
    type Err = ParseMissPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-and-log" => Ok(MissPolicy::DropAndLog),
            "emit-with-null-fields" => Ok(MissPolicy::EmitWithNullFields),
            "retry-after-delay" => Ok(MissPolicy::RetryAfterDelay),
            invalid => Err(ParseMissPolicyError(invalid.to_owned())),
        }
    }
}

/// What to do with a record the schema mapper rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    DeadLetter,
    AbortBatch,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMalformedPolicyError(pub String);

impl FromStr for MalformedPolicy {
    type Err = ParseMalformedPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dead-letter" => Ok(MalformedPolicy::DeadLetter),
            "abort-batch" => Ok(MalformedPolicy::AbortBatch),
            invalid => Err(ParseMalformedPolicyError(invalid.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "retry-after-delay".parse::<MissPolicy>().unwrap(),
            MissPolicy::RetryAfterDelay
        );
        assert_eq!(
            "drop-and-log".parse::<MissPolicy>().unwrap(),
            MissPolicy::DropAndLog
        );
        assert!("keep".parse::<MissPolicy>().is_err());

        assert_eq!(
            "abort-batch".parse::<MalformedPolicy>().unwrap(),
            MalformedPolicy::AbortBatch
        );
        assert!("ignore".parse::<MalformedPolicy>().is_err());
    }

    #[test]
    fn test_env_ms_duration_parsing() {
        assert_eq!(
            "250".parse::<EnvMsDuration>().unwrap().0,
            time::Duration::from_millis(250)
        );
        assert!("banana".parse::<EnvMsDuration>().is_err());
    }
}
