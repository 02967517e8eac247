//! Batch collation for preference pairs.
//!
//! Chosen and rejected rows are padded independently to their own batch
//! maximum. The collator stays tensor-library-free; the trainer turns the
//! padded matrices into arrays.

use crate::masking::IGNORE_TOKEN_ID;
use crate::preprocess::TokenizedExample;
use prefmetal_core::PaddingSide;

/// A collated preference batch.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    /// Padded chosen token ids, `[batch, chosen_seq_len]`.
    pub chosen_input_ids: Vec<Vec<u32>>,
    /// Chosen attention mask (0 over padding).
    pub chosen_attention_mask: Vec<Vec<u32>>,
    /// Chosen labels, padded with the ignore sentinel.
    pub chosen_labels: Vec<Vec<i64>>,
    /// Padded rejected token ids, `[batch, rejected_seq_len]`.
    pub rejected_input_ids: Vec<Vec<u32>>,
    /// Rejected attention mask.
    pub rejected_attention_mask: Vec<Vec<u32>>,
    /// Rejected labels.
    pub rejected_labels: Vec<Vec<i64>>,
    /// Number of rows.
    pub batch_size: usize,
    /// Common chosen row length.
    pub chosen_seq_len: usize,
    /// Common rejected row length.
    pub rejected_seq_len: usize,
}

/// Pads preference pairs into rectangular batches.
#[derive(Debug, Clone)]
pub struct PreferenceCollator {
    /// Token id used for padding.
    pub pad_token_id: u32,
    /// Which side receives padding.
    pub padding_side: PaddingSide,
}

impl PreferenceCollator {
    /// Create a collator.
    pub fn new(pad_token_id: u32, padding_side: PaddingSide) -> Self {
        Self {
            pad_token_id,
            padding_side,
        }
    }

    /// Collate a batch of examples.
    pub fn collate(&self, examples: &[TokenizedExample]) -> PreferenceBatch {
        let chosen_seq_len = examples
            .iter()
            .map(|e| e.chosen_input_ids.len())
            .max()
            .unwrap_or(0);
        let rejected_seq_len = examples
            .iter()
            .map(|e| e.rejected_input_ids.len())
            .max()
            .unwrap_or(0);

        let mut batch = PreferenceBatch {
            chosen_input_ids: Vec::with_capacity(examples.len()),
            chosen_attention_mask: Vec::with_capacity(examples.len()),
            chosen_labels: Vec::with_capacity(examples.len()),
            rejected_input_ids: Vec::with_capacity(examples.len()),
            rejected_attention_mask: Vec::with_capacity(examples.len()),
            rejected_labels: Vec::with_capacity(examples.len()),
            batch_size: examples.len(),
            chosen_seq_len,
            rejected_seq_len,
        };

        for example in examples {
            batch.chosen_input_ids.push(self.pad_ids(
                &example.chosen_input_ids,
                chosen_seq_len,
                self.pad_token_id,
            ));
            batch.chosen_attention_mask.push(self.pad_ids(
                &example.chosen_attention_mask,
                chosen_seq_len,
                0,
            ));
            batch.chosen_labels.push(self.pad_labels(
                &example.chosen_labels,
                chosen_seq_len,
            ));
            batch.rejected_input_ids.push(self.pad_ids(
                &example.rejected_input_ids,
                rejected_seq_len,
                self.pad_token_id,
            ));
            batch.rejected_attention_mask.push(self.pad_ids(
                &example.rejected_attention_mask,
                rejected_seq_len,
                0,
            ));
            batch.rejected_labels.push(self.pad_labels(
                &example.rejected_labels,
                rejected_seq_len,
            ));
        }
        batch
    }

    fn pad_ids(&self, row: &[u32], target_len: usize, pad: u32) -> Vec<u32> {
        let mut out = Vec::with_capacity(target_len);
        let pad_count = target_len.saturating_sub(row.len());
        match self.padding_side {
            PaddingSide::Right => {
                out.extend_from_slice(row);
                out.extend(std::iter::repeat(pad).take(pad_count));
            }
            PaddingSide::Left => {
                out.extend(std::iter::repeat(pad).take(pad_count));
                out.extend_from_slice(row);
            }
        }
        out
    }

    fn pad_labels(&self, row: &[i64], target_len: usize) -> Vec<i64> {
        let mut out = Vec::with_capacity(target_len);
        let pad_count = target_len.saturating_sub(row.len());
        match self.padding_side {
            PaddingSide::Right => {
                out.extend_from_slice(row);
                out.extend(std::iter::repeat(IGNORE_TOKEN_ID).take(pad_count));
            }
            PaddingSide::Left => {
                out.extend(std::iter::repeat(IGNORE_TOKEN_ID).take(pad_count));
                out.extend_from_slice(row);
            }
        }
        out
    }
}
