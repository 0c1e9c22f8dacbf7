//! Style analyzer (C12): characterizes an organization's writing voice from
//! sample documents so future generations (C11) can be prompted to match it.

use std::time::Instant;

use crate::config::LlmConfig;
use crate::error::{ArchivistError, FieldError, Result};
use crate::llm::{self, LlmMessage, LlmProvider};
use crate::models::StyleType;

const MIN_SAMPLES: usize = 3;
const MAX_SAMPLES: usize = 7;
const MIN_WORDS_PER_SAMPLE: usize = 200;
const ANALYSIS_MAX_TOKENS: u32 = 8192;
const ANALYSIS_TEMPERATURE: f64 = 0.4;

const CATEGORIES: &[&str] = &[
    "vocabulary",
    "sentence structure",
    "thought composition",
    "paragraph structure",
    "transitions",
    "tone",
    "perspective",
    "data integration",
];

#[derive(Debug, Clone)]
pub struct StyleAnalysis {
    pub analysis_metadata: serde_json::Value,
    pub prompt_content: String,
    pub word_count: usize,
    pub generation_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

fn validate_samples(samples: &[String]) -> Result<()> {
    if samples.len() < MIN_SAMPLES || samples.len() > MAX_SAMPLES {
        return Err(ArchivistError::InsufficientSamples(format!(
            "need {}-{} samples, got {}",
            MIN_SAMPLES,
            MAX_SAMPLES,
            samples.len()
        )));
    }
    for (i, sample) in samples.iter().enumerate() {
        let words = sample.split_whitespace().count();
        if words < MIN_WORDS_PER_SAMPLE {
            return Err(ArchivistError::InsufficientSamples(format!(
                "sample {} has {} words, need at least {}",
                i + 1,
                words,
                MIN_WORDS_PER_SAMPLE
            )));
        }
    }
    Ok(())
}

fn build_analysis_prompt(style_type: StyleType, samples: &[String]) -> Vec<LlmMessage> {
    let mut user = format!(
        "Analyze the writing style across these {} sample {} documents. Characterize each of the \
         following categories: {}.\n\n\
         Respond with a single JSON object whose keys are exactly these category names and whose \
         values are short strings describing that category's emphasis, followed by a prose section \
         titled \"STYLE GUIDE:\" containing a 1500-2000 word description of the voice, suitable for \
         prepending to future generation prompts so the model can write in this style.\n\n",
        samples.len(),
        style_type.as_str(),
        CATEGORIES.join(", "),
    );
    for (i, sample) in samples.iter().enumerate() {
        user.push_str(&format!("--- Sample {} ---\n{}\n\n", i + 1, sample));
    }

    vec![
        LlmMessage::system(
            "You are a writing style analyst. You characterize voice precisely and produce style \
             guides other writers can follow.",
        ),
        LlmMessage::user(user),
    ]
}

/// Locates the first balanced `{...}` span in `response` and parses only
/// that span as JSON, tolerating leading/trailing prose. The text outside
/// the span (or a clearly delimited section within it) becomes
/// `prompt_content`.
fn parse_analysis_response(response: &str) -> Option<(serde_json::Value, String)> {
    let chars: Vec<char> = response.chars().collect();
    let start = chars.iter().position(|&c| c == '{')?;

    let mut depth = 0i32;
    let mut end = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;

    let span: String = chars[start..=end].iter().collect();
    let metadata: serde_json::Value = serde_json::from_str(&span).ok()?;

    let remainder: String = chars[end + 1..].iter().collect();
    let prompt_content = match remainder.find("STYLE GUIDE:") {
        Some(idx) => remainder[idx + "STYLE GUIDE:".len()..].trim().to_string(),
        None => {
            let before: String = chars[..start].iter().collect();
            let combined = format!("{}\n{}", before.trim(), remainder.trim());
            combined.trim().to_string()
        }
    };

    Some((metadata, prompt_content))
}

/// Runs the full analysis pipeline. Persisting the result as a
/// [`crate::models::WritingStyle`] is the caller's responsibility (C2).
pub async fn analyze(
    provider: &dyn LlmProvider,
    llm_config: &LlmConfig,
    style_type: StyleType,
    samples: &[String],
) -> Result<StyleAnalysis> {
    validate_samples(samples)?;

    let messages = build_analysis_prompt(style_type, samples);
    let mut config = llm_config.clone();
    config.max_tokens = ANALYSIS_MAX_TOKENS;
    config.temperature = ANALYSIS_TEMPERATURE;

    let started = Instant::now();
    let result = llm::generate(provider, &config, &messages).await?;

    let (analysis_metadata, prompt_content) = parse_analysis_response(&result.content)
        .ok_or_else(|| ArchivistError::CorruptDocument("style analysis response had no parseable JSON span".to_string()))?;

    Ok(StyleAnalysis {
        word_count: prompt_content.split_whitespace().count(),
        analysis_metadata,
        prompt_content,
        generation_ms: started.elapsed().as_millis() as u64,
        input_tokens: result.input_tokens,
        output_tokens: result.output_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn sample(word: &str, count: usize) -> String {
        std::iter::repeat(word).take(count).collect::<Vec<_>>().join(" ")
    }

    fn cfg() -> LlmConfig {
        LlmConfig {
            provider: "mock".to_string(),
            model: Some("mock".to_string()),
            api_base: None,
            temperature: 0.3,
            max_tokens: 100,
            timeout_secs: 10,
            max_retries: 1,
        }
    }

    #[test]
    fn rejects_too_few_samples() {
        let samples = vec![sample("word", 250), sample("word", 250)];
        assert!(matches!(
            validate_samples(&samples),
            Err(ArchivistError::InsufficientSamples(_))
        ));
    }

    #[test]
    fn rejects_too_many_samples() {
        let samples = vec![sample("word", 250); 8];
        assert!(matches!(
            validate_samples(&samples),
            Err(ArchivistError::InsufficientSamples(_))
        ));
    }

    #[test]
    fn rejects_short_sample() {
        let samples = vec![sample("word", 250), sample("word", 250), sample("word", 50)];
        assert!(matches!(
            validate_samples(&samples),
            Err(ArchivistError::InsufficientSamples(_))
        ));
    }

    #[test]
    fn accepts_valid_sample_set() {
        let samples = vec![sample("word", 250), sample("word", 250), sample("word", 250)];
        assert!(validate_samples(&samples).is_ok());
    }

    #[test]
    fn parse_analysis_response_extracts_json_and_trailing_guide() {
        let response = r#"Here you go:
{"vocabulary": "plain", "tone": "warm"}
STYLE GUIDE: This organization writes with direct, warm language that centers the people served."#;
        let (metadata, prompt_content) = parse_analysis_response(response).unwrap();
        assert_eq!(metadata["vocabulary"], "plain");
        assert!(prompt_content.contains("centers the people served"));
    }

    #[test]
    fn parse_analysis_response_handles_braces_inside_strings() {
        let response = r#"{"tone": "uses { and } in examples"} STYLE GUIDE: guide text here"#;
        let (metadata, prompt_content) = parse_analysis_response(response).unwrap();
        assert_eq!(metadata["tone"], "uses { and } in examples");
        assert_eq!(prompt_content, "guide text here");
    }

    #[test]
    fn parse_analysis_response_none_when_no_json() {
        assert!(parse_analysis_response("no json here at all").is_none());
    }

    #[tokio::test]
    async fn analyze_returns_parsed_metadata_and_prompt_content() {
        let response = r#"{"vocabulary": "formal"} STYLE GUIDE: Write formally and precisely."#;
        let provider = MockLlm::new(response);
        let samples = vec![sample("word", 250), sample("word", 250), sample("word", 250)];

        let analysis = analyze(&provider, &cfg(), StyleType::Grant, &samples).await.unwrap();
        assert_eq!(analysis.analysis_metadata["vocabulary"], "formal");
        assert!(analysis.prompt_content.contains("Write formally"));
    }
}
