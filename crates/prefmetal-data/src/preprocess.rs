//! Pairwise preprocessing of preference records.
//!
//! One record becomes three rendered strings (prompt, prompt+chosen,
//! prompt+rejected), each tokenized under a shared truncation bound. The two
//! completion rows get turn-boundary label masks, then every position covered
//! by the prompt tokenization is forced to ignore so the loss compares only
//! the continuations.

use crate::conversation::{ConvTemplate, PreferenceRecord};
use crate::masking::{mask_labels, TokenEncoder, IGNORE_TOKEN_ID};
use prefmetal_core::Result;

/// A fully tokenized preference pair.
#[derive(Debug, Clone)]
pub struct TokenizedExample {
    /// Tokenization of the prompt-only rendering.
    pub prompt_input_ids: Vec<u32>,
    /// Tokenization of prompt + chosen.
    pub chosen_input_ids: Vec<u32>,
    /// All-ones mask for the chosen row (padding happens at collation).
    pub chosen_attention_mask: Vec<u32>,
    /// Labels for the chosen row.
    pub chosen_labels: Vec<i64>,
    /// Tokenization of prompt + rejected.
    pub rejected_input_ids: Vec<u32>,
    /// All-ones mask for the rejected row.
    pub rejected_attention_mask: Vec<u32>,
    /// Labels for the rejected row.
    pub rejected_labels: Vec<i64>,
}

/// Render the three transcript views of a record.
///
/// Role alternation is checked here, before any tokenization.
pub fn format_views(
    record: &PreferenceRecord,
    template: &ConvTemplate,
) -> Result<(String, String, String)> {
    let mut conv = template.clone();
    conv.clear_messages();
    conv.append_turns(&record.prompt)?;
    let prompt = conv.render();

    let mut chosen_conv = conv.clone();
    chosen_conv.append_turns(&record.chosen)?;
    let chosen = chosen_conv.render();

    let mut rejected_conv = conv;
    rejected_conv.append_turns(&record.rejected)?;
    let rejected = rejected_conv.render();

    Ok((prompt, chosen, rejected))
}

/// Tokenize and mask one preference record.
pub fn preprocess_record<E: TokenEncoder>(
    record: &PreferenceRecord,
    template: &ConvTemplate,
    encoder: &E,
    model_max_length: usize,
) -> Result<TokenizedExample> {
    let (prompt, chosen, rejected) = format_views(record, template)?;

    let mut prompt_input_ids = encoder.encode(&prompt, true)?;
    prompt_input_ids.truncate(model_max_length);
    let mut chosen_input_ids = encoder.encode(&chosen, true)?;
    chosen_input_ids.truncate(model_max_length);
    let mut rejected_input_ids = encoder.encode(&rejected, true)?;
    rejected_input_ids.truncate(model_max_length);

    let mut chosen_labels = mask_labels(
        &chosen,
        &chosen_input_ids,
        encoder,
        template,
        model_max_length,
    )?;
    let mut rejected_labels = mask_labels(
        &rejected,
        &rejected_input_ids,
        encoder,
        template,
        model_max_length,
    )?;

    // The prompt prefix is shared between the pair and never supervised.
    let prompt_len = prompt_input_ids.len();
    for label in chosen_labels.iter_mut().take(prompt_len) {
        *label = IGNORE_TOKEN_ID;
    }
    for label in rejected_labels.iter_mut().take(prompt_len) {
        *label = IGNORE_TOKEN_ID;
    }

    let chosen_attention_mask = vec![1u32; chosen_input_ids.len()];
    let rejected_attention_mask = vec![1u32; rejected_input_ids.len()];

    Ok(TokenizedExample {
        prompt_input_ids,
        chosen_input_ids,
        chosen_attention_mask,
        chosen_labels,
        rejected_input_ids,
        rejected_attention_mask,
        rejected_labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{SepStyle, Turn};
    use crate::masking::testing::MockEncoder;

    fn test_template() -> ConvTemplate {
        ConvTemplate::new(
            "test",
            "S",
            ["USER", "ASSISTANT"],
            SepStyle::AddColonTwo,
            " ",
            "</s>",
        )
    }

    fn hi_record() -> PreferenceRecord {
        PreferenceRecord {
            prompt: vec![Turn::new("human", "Hi")],
            chosen: vec![Turn::new("gpt", "Hello")],
            rejected: vec![Turn::new("gpt", "Go away")],
        }
    }

    #[test]
    fn test_labels_align_with_input_ids() {
        let encoder = MockEncoder::new();
        let example = preprocess_record(&hi_record(), &test_template(), &encoder, 512).unwrap();
        assert_eq!(example.chosen_labels.len(), example.chosen_input_ids.len());
        assert_eq!(
            example.rejected_labels.len(),
            example.rejected_input_ids.len()
        );
        assert_eq!(
            example.chosen_attention_mask.len(),
            example.chosen_input_ids.len()
        );
    }

    #[test]
    fn test_prompt_prefix_is_ignored_in_both_rows() {
        let encoder = MockEncoder::new();
        let example = preprocess_record(&hi_record(), &test_template(), &encoder, 512).unwrap();
        let prompt_len = example.prompt_input_ids.len();
        assert!(example.chosen_labels[..prompt_len]
            .iter()
            .all(|&l| l == IGNORE_TOKEN_ID));
        assert!(example.rejected_labels[..prompt_len]
            .iter()
            .all(|&l| l == IGNORE_TOKEN_ID));
    }

    #[test]
    fn test_chosen_supervision_covers_only_the_reply() {
        let encoder = MockEncoder::new();
        let example = preprocess_record(&hi_record(), &test_template(), &encoder, 512).unwrap();

        let supervised: Vec<u32> = example
            .chosen_labels
            .iter()
            .filter(|&&l| l != IGNORE_TOKEN_ID)
            .map(|&l| l as u32)
            .collect();
        assert_eq!(encoder.decode(&supervised, true).unwrap(), "Hello");

        let supervised: Vec<u32> = example
            .rejected_labels
            .iter()
            .filter(|&&l| l != IGNORE_TOKEN_ID)
            .map(|&l| l as u32)
            .collect();
        assert_eq!(encoder.decode(&supervised, true).unwrap(), "Go away");
    }

    #[test]
    fn test_alternation_violation_fails_before_tokenization() {
        let encoder = MockEncoder::new();
        let record = PreferenceRecord {
            prompt: vec![
                Turn::new("human", "a"),
                Turn::new("human", "b"),
                Turn::new("human", "c"),
            ],
            chosen: vec![Turn::new("gpt", "x")],
            rejected: vec![Turn::new("gpt", "y")],
        };
        assert!(preprocess_record(&record, &test_template(), &encoder, 512).is_err());
    }

    #[test]
    fn test_truncation_bounds_all_rows() {
        let encoder = MockEncoder::new();
        let example = preprocess_record(&hi_record(), &test_template(), &encoder, 5).unwrap();
        assert!(example.prompt_input_ids.len() <= 5);
        assert!(example.chosen_input_ids.len() <= 5);
        assert!(example.rejected_input_ids.len() <= 5);
    }
}
