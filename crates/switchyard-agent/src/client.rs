// ABOUTME: Factory function for creating generation engines from a provider name.
// ABOUTME: Resolves provider + optional model into a configured Arc<dyn GenerationEngine>.

use std::env;
use std::sync::Arc;

use crate::providers::{ApiFlavor, OpenAiEngine};
use crate::runtime::GenerationEngine;

/// Create a generation engine for the given provider name.
///
/// The model is resolved from:
/// 1. The explicit `model` parameter (if Some)
/// 2. A provider-specific environment variable (e.g. OPENAI_MODEL)
/// 3. A sensible default for that provider
pub fn create_engine(
    provider: &str,
    model: Option<&str>,
) -> Result<Arc<dyn GenerationEngine>, anyhow::Error> {
    match provider {
        "openai" => {
            let api_key = env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
            let base_url =
                env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".to_string());
            let resolved_model = resolve_model(model, "OPENAI_MODEL", ApiFlavor::OpenAi);
            Ok(Arc::new(OpenAiEngine::new(api_key, base_url, resolved_model)))
        }
        "fireworks" => {
            let api_key = env::var("FIREWORKS_API_KEY")
                .map_err(|_| anyhow::anyhow!("FIREWORKS_API_KEY environment variable not set"))?;
            let base_url = env::var("FIREWORKS_BASE_URL")
                .unwrap_or_else(|_| "https://api.fireworks.ai/inference".to_string());
            let resolved_model = resolve_model(model, "FIREWORKS_MODEL", ApiFlavor::Fireworks);
            Ok(Arc::new(
                OpenAiEngine::new(api_key, base_url, resolved_model)
                    .with_flavor(ApiFlavor::Fireworks),
            ))
        }
        unknown => Err(anyhow::anyhow!("unsupported generation provider: {}", unknown)),
    }
}

fn resolve_model(model: Option<&str>, env_key: &str, flavor: ApiFlavor) -> String {
    model
        .map(String::from)
        .or_else(|| env::var(env_key).ok())
        .unwrap_or_else(|| OpenAiEngine::default_model(flavor).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all tests that read/write env vars to prevent race conditions.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Arc<dyn GenerationEngine> doesn't impl Debug, so unwrap_err() is unavailable.
    fn expect_err(result: Result<Arc<dyn GenerationEngine>, anyhow::Error>) -> String {
        match result {
            Err(e) => e.to_string(),
            Ok(engine) => panic!("expected error, got engine for model {}", engine.model_name()),
        }
    }

    fn expect_ok(result: Result<Arc<dyn GenerationEngine>, anyhow::Error>) -> Arc<dyn GenerationEngine> {
        match result {
            Ok(engine) => engine,
            Err(e) => panic!("expected Ok, got Err: {}", e),
        }
    }

    #[test]
    fn unknown_provider_returns_error() {
        let err = expect_err(create_engine("unknown", None));
        assert!(
            err.contains("unsupported generation provider"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn openai_missing_api_key_returns_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe { env::remove_var("OPENAI_API_KEY") };
        let err = expect_err(create_engine("openai", None));
        assert!(err.contains("OPENAI_API_KEY"), "unexpected error: {}", err);
    }

    #[test]
    fn fireworks_missing_api_key_returns_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe { env::remove_var("FIREWORKS_API_KEY") };
        let err = expect_err(create_engine("fireworks", None));
        assert!(err.contains("FIREWORKS_API_KEY"), "unexpected error: {}", err);
    }

    #[test]
    fn explicit_model_param_overrides_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-key-456");
            env::set_var("OPENAI_MODEL", "gpt-4o-mini");
        }

        let result = create_engine("openai", Some("gpt-4.1"));

        unsafe {
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("OPENAI_MODEL");
        }

        let engine = expect_ok(result);
        assert_eq!(engine.model_name(), "gpt-4.1");
        assert_eq!(engine.provider_name(), "openai");
    }

    #[test]
    fn fireworks_success_returns_default_model() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("FIREWORKS_API_KEY", "test-key-123");
            env::remove_var("FIREWORKS_MODEL");
        }

        let result = create_engine("fireworks", None);

        unsafe { env::remove_var("FIREWORKS_API_KEY") };

        let engine = expect_ok(result);
        assert_eq!(engine.provider_name(), "fireworks");
        assert_eq!(
            engine.model_name(),
            OpenAiEngine::default_model(ApiFlavor::Fireworks)
        );
    }
}
