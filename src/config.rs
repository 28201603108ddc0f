use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::TrainerError,
    eval::EvalConfig,
    optimize::OptimizerConfig,
    session::{HttpBackendConfig, SessionConfig},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub endpoint: HttpBackendConfig,
    #[serde(flatten)]
    pub session: SessionConfig,
}

/// Everything a run needs besides the suite and the template selector.
///
/// ```yaml
/// server:
///   base_url: http://127.0.0.1:8080
///   readiness_retries: 20
/// evaluation:
///   mode: completion
///   request_timeout_ms: 30000
/// optimizer:
///   generations: 8
///   seed: 42
/// success_threshold: 0.8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub server: ServerConfig,
    pub evaluation: EvalConfig,
    pub optimizer: OptimizerConfig,
    /// Overall score in [0, 1] needed for a zero exit code.
    pub success_threshold: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            evaluation: EvalConfig::default(),
            optimizer: OptimizerConfig::default(),
            success_threshold: 0.8,
        }
    }
}

impl TrainerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainerError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: TrainerConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn apply_env(mut self) -> Self {
        self.server.endpoint = self.server.endpoint.apply_env();
        if let Ok(timeout_ms) = env::var("TEMPLATE_TRAINER_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                self.evaluation.request_timeout_ms = ms;
            }
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: HttpBackendConfig) -> Self {
        self.server.endpoint = endpoint;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.server.session = session;
        self
    }

    pub fn with_evaluation(mut self, evaluation: EvalConfig) -> Self {
        self.evaluation = evaluation;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_success_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), TrainerError> {
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(TrainerError::Config(format!(
                "success_threshold must be within [0, 1], got {}",
                self.success_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.evaluation.partial_threshold) {
            return Err(TrainerError::Config(format!(
                "evaluation.partial_threshold must be within [0, 1], got {}",
                self.evaluation.partial_threshold
            )));
        }
        if self.evaluation.request_timeout_ms == 0 {
            return Err(TrainerError::Config(
                "evaluation.request_timeout_ms must be positive".to_string(),
            ));
        }
        self.optimizer.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EndpointMode;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.yaml");
        fs::write(
            &path,
            "server:\n  base_url: http://10.0.0.2:8081\n  readiness_retries: 3\nevaluation:\n  mode: chat\noptimizer:\n  seed: 42\n",
        )
        .unwrap();

        let config = TrainerConfig::load(&path).unwrap();
        assert_eq!(config.server.endpoint.base_url, "http://10.0.0.2:8081");
        assert_eq!(config.server.session.readiness_retries, 3);
        assert_eq!(config.server.session.max_backoff_ms, 5_000);
        assert_eq!(config.evaluation.mode, EndpointMode::Chat);
        assert_eq!(config.evaluation.max_tokens, 256);
        assert_eq!(config.optimizer.seed, 42);
        assert_eq!(config.optimizer.generations, 5);
        assert_eq!(config.success_threshold, 0.8);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.yaml");
        fs::write(&path, "success_threshold: 80\n").unwrap();
        assert!(matches!(
            TrainerConfig::load(&path),
            Err(TrainerError::Config(_))
        ));
    }

    #[test]
    fn invalid_optimizer_settings_fail_validation() {
        let config = TrainerConfig::default()
            .with_optimizer(OptimizerConfig::default().with_survivors(0));
        assert!(matches!(config.validate(), Err(TrainerError::Optimize(_))));
    }
}
