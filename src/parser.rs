use crate::error::DecodeError;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Keys whose repeated occurrences are all kept, joined with `", "`.
/// stable-diffusion.cpp writes one `TE:` entry per text encoder.
const REPEATABLE_KEYS: &[&str] = &["te"];

fn pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([^:,]+): ([^,]+)").expect("valid key/value pattern"))
}

fn lora_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<lora:[^>]+>").expect("valid lora pattern"))
}

/// Recovers the flat key/value map from an A1111-style caption.
///
/// Format: `{prompt}\nNegative prompt: {neg}\nSteps: N, Sampler: X, ...`
///
/// - Newlines are flattened to commas first, so line breaks inside the
///   prompt are not preserved.
/// - Everything before the first `Key: value` pair is the `prompt`.
/// - Keys are lowercased with spaces replaced by underscores; the first
///   occurrence of a key wins.
/// - The negative prompt is re-sliced up to the next pair so commas inside
///   it survive.
/// - Inline `<lora:...>` tags in the prompt are collected into `loras`.
///
/// JSON input is rejected: that belongs to the structured decoders.
pub fn parse_a1111_fields(raw: &str) -> Result<BTreeMap<String, String>, DecodeError> {
    if serde_json::from_str::<serde_json::Value>(raw).is_ok() {
        return Err(DecodeError::StructuredInput);
    }

    let flattened = raw.replace('\n', ",");
    let mut fields = BTreeMap::new();
    let mut previous: Option<(String, usize)> = None;

    for (index, captures) in pair_pattern().captures_iter(&flattened).enumerate() {
        let (Some(whole), Some(key), Some(value)) = (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let before_match = slice_before(&flattened, whole.start());

        if index == 0 && whole.start() > 0 {
            fields.insert("prompt".to_string(), before_match.trim().to_string());
        }

        if let Some((ref previous_key, value_start)) = previous {
            if previous_key == "negative_prompt" {
                let negative = before_match.get(value_start..).unwrap_or_default();
                fields.insert("negative_prompt".to_string(), negative.trim().to_string());
            }
        }

        let value_start = value.start();
        let key = normalize_key(key.as_str());
        let value = value.as_str().trim();

        if REPEATABLE_KEYS.contains(&key.as_str()) {
            fields
                .entry(key.clone())
                .and_modify(|joined: &mut String| {
                    joined.push_str(", ");
                    joined.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        } else {
            fields.entry(key.clone()).or_insert_with(|| value.to_string());
        }

        previous = Some((key, value_start));
    }

    let loras = fields
        .get("prompt")
        .map(|prompt| {
            lora_pattern()
                .find_iter(prompt)
                .map(|tag| tag.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|joined| !joined.is_empty());
    if let Some(loras) = loras {
        fields.insert("loras".to_string(), loras);
    }

    Ok(fields)
}

/// `"Model hash"` -> `"model_hash"`
fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_")
}

/// Text up to, but excluding, the delimiter that precedes `start`.
fn slice_before(text: &str, start: usize) -> &str {
    let end = start.saturating_sub(1);
    text.get(..end).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
        fields.get(key).map(String::as_str)
    }

    #[test]
    fn test_parse_with_negative_prompt() {
        let fields = parse_a1111_fields("A cat\nNegative prompt: a, b\nSteps: 20, Seed: 42").unwrap();
        assert_eq!(field(&fields, "prompt"), Some("A cat"));
        assert_eq!(field(&fields, "negative_prompt"), Some("a, b"));
        assert_eq!(field(&fields, "steps"), Some("20"));
        assert_eq!(field(&fields, "seed"), Some("42"));
    }

    #[test]
    fn test_parse_prompt_with_commas_and_weights() {
        let raw = "(cords, antenna:1.1), (chrome:1.3), masterpiece\nSteps: 20, Sampler: DPM++ 2M Karras, CFG scale: 7";
        let fields = parse_a1111_fields(raw).unwrap();
        assert_eq!(
            field(&fields, "prompt"),
            Some("(cords, antenna:1.1), (chrome:1.3), masterpiece")
        );
        assert_eq!(field(&fields, "sampler"), Some("DPM++ 2M Karras"));
        assert_eq!(field(&fields, "cfg_scale"), Some("7"));
    }

    #[test]
    fn test_parse_keys_are_normalized() {
        let raw = "prompt\nSteps: 20, Model hash: 1f69731261, Hires upscaler: Latent (antialiased)";
        let fields = parse_a1111_fields(raw).unwrap();
        assert_eq!(field(&fields, "model_hash"), Some("1f69731261"));
        assert_eq!(field(&fields, "hires_upscaler"), Some("Latent (antialiased)"));
    }

    #[test]
    fn test_parse_first_occurrence_wins() {
        let raw = "p\nSteps: 20, Sampler: Euler a, Steps: 99";
        let fields = parse_a1111_fields(raw).unwrap();
        assert_eq!(field(&fields, "steps"), Some("20"));
    }

    #[test]
    fn test_parse_repeated_text_encoders_are_joined() {
        let raw = "Person\nSteps: 30, TE: clip_l.safetensors, TE: t5xxl.gguf, Unet: flux.gguf";
        let fields = parse_a1111_fields(raw).unwrap();
        assert_eq!(field(&fields, "te"), Some("clip_l.safetensors, t5xxl.gguf"));
        assert_eq!(field(&fields, "unet"), Some("flux.gguf"));
    }

    #[test]
    fn test_parse_collects_inline_loras() {
        let raw = "sunflower field, (poppy seeds:1.2) \n<lora:Agriculture_V1:1> <lora:SDXL/size_slider_v1:1.7>\nNegative prompt: corn\nSteps: 30";
        let fields = parse_a1111_fields(raw).unwrap();
        assert_eq!(
            field(&fields, "prompt"),
            Some("sunflower field, (poppy seeds:1.2) ,<lora:Agriculture_V1:1> <lora:SDXL/size_slider_v1:1.7>")
        );
        assert_eq!(
            field(&fields, "loras"),
            Some("<lora:Agriculture_V1:1>, <lora:SDXL/size_slider_v1:1.7>")
        );
        assert_eq!(field(&fields, "negative_prompt"), Some("corn"));
    }

    #[test]
    fn test_parse_without_prompt() {
        let fields = parse_a1111_fields("\nSteps: 20, Seed: 42").unwrap();
        assert_eq!(field(&fields, "prompt"), Some(""));
        assert_eq!(field(&fields, "steps"), Some("20"));
    }

    #[test]
    fn test_parse_match_at_start_has_no_prompt() {
        let fields = parse_a1111_fields("Steps: 20, Seed: 42").unwrap();
        assert_eq!(field(&fields, "prompt"), None);
        assert!(!fields.contains_key("loras"));
    }

    #[test]
    fn test_parse_skips_empty_values() {
        let fields = parse_a1111_fields("p\nSteps: 20, Model: , RNG: cuda").unwrap();
        assert_eq!(field(&fields, "model"), None);
        assert_eq!(field(&fields, "rng"), Some("cuda"));
    }

    #[test]
    fn test_parse_rejects_json() {
        let raw = r#"{"adm_guidance": "(1.5, 0.8, 0.3)", "base_model": "juggernautXL_v8Rundiffusion", "clip_skip": 2}"#;
        assert!(matches!(parse_a1111_fields(raw), Err(DecodeError::StructuredInput)));
    }

    #[test]
    fn test_parse_plain_text_without_pairs() {
        let fields = parse_a1111_fields("just some words").unwrap();
        assert!(fields.is_empty());
    }
}
