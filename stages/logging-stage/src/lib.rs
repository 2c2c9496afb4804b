//! A demo stage counting words in a config-supplied text, logging its
//! progress via the engine's Progress Service as it goes.

use async_trait::async_trait;
use pipeline_core::config::ConfigValue;
use pipeline_core::stage::{ExecuteContext, Require, Stage, StageValue};

#[derive(Default)]
pub struct WordCountStage;

#[async_trait]
impl Stage for WordCountStage {
    fn name(&self) -> &str {
        "word-count"
    }

    fn configure(&self, require: &mut Require) {
        require.config("text", None);
    }

    // No separate version axis: counting logic lives entirely in `execute`,
    // so the default `verify` (`Ok(None)`) is used.

    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let text = match ctx.config("text")? {
            ConfigValue::String(s) => s.clone(),
            other => return Err(format!("'text' must be a string, got {other:?}").into()),
        };

        let words: Vec<&str> = text.split_whitespace().collect();
        let mut progress = ctx.progress(Some("counting words".to_string()), Some(words.len() as u64), Some(0.0))?;

        for word in &words {
            log::debug!("counted word: {word}");
            progress.update(Some(1))?;
        }

        Ok(StageValue::new(&words.len())?)
    }
}
