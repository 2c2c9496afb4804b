//! A demo stage uppercasing a config-supplied text, depending on
//! `word-count` for the word total it logs alongside its own output.

use async_trait::async_trait;
use pipeline_core::config::ConfigValue;
use pipeline_core::error::ExecutorError;
use pipeline_core::stage::{ExecuteContext, Require, Stage, StageValue, VerifyContext};

/// Bumped whenever the uppercasing rule itself changes, so existing caches
/// become stale without anything in `text`/`word-count` having changed.
const RULE_VERSION: &str = "v1";

#[derive(Default)]
pub struct UppercaseStage;

#[async_trait]
impl Stage for UppercaseStage {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn configure(&self, require: &mut Require) {
        require.config("text", None);
        require.stage("word-count");
    }

    fn verify(&self, _ctx: &VerifyContext<'_>) -> Result<Option<String>, ExecutorError> {
        Ok(Some(RULE_VERSION.to_string()))
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let text = match ctx.config("text")? {
            ConfigValue::String(s) => s.clone(),
            other => return Err(format!("'text' must be a string, got {other:?}").into()),
        };

        let word_count: usize = ctx.stage("word-count")?;
        log::info!("uppercasing {word_count} word(s)");

        Ok(StageValue::new(&text.to_uppercase())?)
    }
}
