//! Generation options, finish reasons and usage accounting

use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelSignal;
use crate::config::GenerationDefaults;
use crate::runtime::{SamplerParams, Token};

/// Per-request generation overrides. `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(default)]
pub struct GenerationOverrides {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_k: Option<i32>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub repeat_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub penalty_last_n: Option<i32>,
    pub seed: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub prefix_caching: Option<bool>,
    /// Number of choices to generate
    pub n: Option<u32>,
}

/// What a generated token looks like to the per-token hook
#[derive(Debug, Clone, Copy)]
pub struct TokenEvent<'a> {
    pub choice: u32,
    pub token: Token,
    /// Text completed by this token, before stop filtering
    pub piece: &'a str,
}

/// Per-token hook; `Break` ends the choice as if a stop sequence matched.
pub type TokenCallback = Box<dyn FnMut(TokenEvent<'_>) -> ControlFlow<()> + Send>;

/// Fully resolved options for one generation call
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub sampler: SamplerParams,
    pub stop: Vec<String>,
    pub prefix_caching: bool,
    pub n: u32,
    pub on_token: Option<TokenCallback>,
    pub cancel: Option<CancelSignal>,
}

impl GenerationOptions {
    /// Layers request overrides onto the configured defaults.
    pub fn from_overrides(defaults: &GenerationDefaults, overrides: &GenerationOverrides) -> Self {
        let sampler = SamplerParams {
            temperature: overrides.temperature.unwrap_or(defaults.temperature).max(0.0),
            top_k: overrides.top_k.unwrap_or(defaults.top_k).max(0),
            top_p: overrides.top_p.unwrap_or(defaults.top_p).clamp(0.0, 1.0),
            min_p: overrides.min_p.unwrap_or(defaults.min_p).clamp(0.0, 1.0),
            seed: overrides.seed.unwrap_or(defaults.seed),
            repeat_penalty: overrides.repeat_penalty.unwrap_or(defaults.repeat_penalty),
            frequency_penalty: overrides.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: overrides.presence_penalty.unwrap_or(defaults.presence_penalty),
            penalty_last_n: overrides.penalty_last_n.unwrap_or(defaults.penalty_last_n),
        };

        let stop = overrides
            .stop
            .clone()
            .unwrap_or_else(|| defaults.stop.clone())
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            max_tokens: overrides.max_tokens.unwrap_or(defaults.max_tokens).max(1),
            sampler,
            stop,
            prefix_caching: overrides.prefix_caching.unwrap_or(defaults.prefix_caching),
            n: overrides.n.unwrap_or(1).max(1),
            on_token: None,
            cancel: None,
        }
    }

    pub fn with_token_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(TokenEvent<'_>) -> ControlFlow<()> + Send + 'static,
    {
        self.on_token = Some(Box::new(callback));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from_overrides(&GenerationDefaults::default(), &GenerationOverrides::default())
    }
}

impl fmt::Debug for GenerationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationOptions")
            .field("max_tokens", &self.max_tokens)
            .field("sampler", &self.sampler)
            .field("stop", &self.stop)
            .field("prefix_caching", &self.prefix_caching)
            .field("n", &self.n)
            .field("on_token", &self.on_token.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Why a choice ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Token budget or context exhausted
    MaxTokens,
    /// Stop sequence matched or the token hook asked to stop
    Stop,
    /// The model produced an end-of-generation token
    Eos,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::MaxTokens => "max_tokens",
            FinishReason::Stop => "stop",
            FinishReason::Eos => "eos",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority: max tokens, then stop, then end of sequence. A choice that ended
/// for none of these ran out of context and counts as max tokens.
pub fn finish_reason(n_out: u32, max_tokens: u32, stop_hit: bool, eog: bool) -> FinishReason {
    if n_out >= max_tokens {
        FinishReason::MaxTokens
    } else if stop_hit {
        FinishReason::Stop
    } else if eog {
        FinishReason::Eos
    } else {
        FinishReason::MaxTokens
    }
}

/// Token counts and timings for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub prompt_ms: f64,
    pub generation_ms: f64,
    pub tokens_per_second: f64,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, prompt_ms: f64, generation_ms: f64) -> Self {
        let tokens_per_second = if generation_ms > 0.0 {
            completion_tokens as f64 * 1000.0 / generation_ms
        } else {
            0.0
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_ms,
            generation_ms,
            tokens_per_second,
        }
    }
}

/// Random seed from process entropy, for requests that leave seed at 0
pub(crate) fn random_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_layer_onto_defaults() {
        let defaults = GenerationDefaults {
            stop: vec!["</s>".to_string()],
            ..GenerationDefaults::default()
        };

        let options = GenerationOptions::from_overrides(&defaults, &GenerationOverrides::default());
        assert_eq!(options.max_tokens, 512);
        assert!((options.sampler.temperature - 0.7).abs() < 0.001);
        assert_eq!(options.stop, vec!["</s>".to_string()]);
        assert!(options.prefix_caching);
        assert_eq!(options.n, 1);

        let overrides = GenerationOverrides {
            max_tokens: Some(16),
            temperature: Some(0.0),
            stop: Some(vec!["\n".to_string(), String::new()]),
            prefix_caching: Some(false),
            n: Some(3),
            ..GenerationOverrides::default()
        };
        let options = GenerationOptions::from_overrides(&defaults, &overrides);
        assert_eq!(options.max_tokens, 16);
        assert!(options.sampler.is_greedy());
        assert_eq!(options.stop, vec!["\n".to_string()]);
        assert!(!options.prefix_caching);
        assert_eq!(options.n, 3);
        assert_eq!(options.sampler.top_k, 40);
    }

    #[test]
    fn test_present_empty_stop_list_overrides() {
        let defaults = GenerationDefaults {
            stop: vec!["</s>".to_string()],
            ..GenerationDefaults::default()
        };
        let overrides = GenerationOverrides {
            stop: Some(vec![]),
            ..GenerationOverrides::default()
        };
        assert!(GenerationOptions::from_overrides(&defaults, &overrides).stop.is_empty());
    }

    #[test]
    fn test_overrides_deserialize_with_missing_fields() {
        let overrides: GenerationOverrides = serde_json::from_str(r#"{"max_tokens": 8}"#).unwrap();
        assert_eq!(overrides.max_tokens, Some(8));
        assert!(overrides.temperature.is_none());
        assert!(overrides.stop.is_none());
    }

    #[test]
    fn test_finish_reason_priority() {
        assert_eq!(finish_reason(5, 5, true, false), FinishReason::MaxTokens);
        assert_eq!(finish_reason(5, 5, false, true), FinishReason::MaxTokens);
        assert_eq!(finish_reason(3, 5, true, true), FinishReason::Stop);
        assert_eq!(finish_reason(3, 5, false, true), FinishReason::Eos);
        assert_eq!(finish_reason(3, 5, false, false), FinishReason::MaxTokens);
    }

    #[test]
    fn test_finish_reason_serde_names() {
        assert_eq!(serde_json::to_string(&FinishReason::MaxTokens).unwrap(), "\"max_tokens\"");
        assert_eq!(serde_json::to_string(&FinishReason::Stop).unwrap(), "\"stop\"");
        assert_eq!(serde_json::to_string(&FinishReason::Eos).unwrap(), "\"eos\"");
        assert_eq!(FinishReason::Eos.to_string(), "eos");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(10, 20, 5.0, 2000.0);
        assert_eq!(usage.total_tokens, 30);
        assert!((usage.tokens_per_second - 10.0).abs() < 1e-9);
        assert_eq!(Usage::new(1, 0, 0.0, 0.0).tokens_per_second, 0.0);
    }
}
