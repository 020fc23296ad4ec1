use super::{parse_score, Scorer, ScoringError};
use crate::config::types::HttpScorerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Scorer backed by a completion-style HTTP endpoint.
///
/// The prompt asks for a single number and the first completion choice is
/// parsed as the score.
#[derive(Debug)]
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stop: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
}

pub fn build_prompt(text: &str) -> String {
    format!(
        "You are a sentiment analysis tool. Given the text below, output only a single numeric \
         sentiment score on a scale from -10.0 to 10.0, where -10.0 represents extremely negative \
         sentiment, 0 is neutral, and 10.0 represents extremely positive sentiment.\n\n\
         Text: {}\n\nSentiment score:",
        text
    )
}

impl HttpScorer {
    pub fn new(config: &HttpScorerConfig) -> Result<Self, ScoringError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/completions", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, text: &str) -> Result<f64, ScoringError> {
        let body = CompletionRequest {
            model: &self.model,
            prompt: build_prompt(text),
            max_tokens: 20,
            temperature: 0.2,
            top_p: 1.0,
            stop: ["\n"],
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ScoringError::Service {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let completion: CompletionResponse = response.json().await?;
        let choice = completion
            .choices
            .first()
            .ok_or_else(|| ScoringError::Malformed("no completion choices".to_string()))?;
        parse_score(&choice.text)
    }
}
