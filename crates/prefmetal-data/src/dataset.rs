//! Preference dataset loading.

use crate::conversation::{ConvTemplate, PreferenceRecord};
use crate::masking::TokenEncoder;
use crate::preprocess::{preprocess_record, TokenizedExample};
use prefmetal_core::{PrefMetalError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// An eagerly preprocessed preference dataset.
pub struct PreferenceDataset {
    examples: Vec<TokenizedExample>,
}

impl PreferenceDataset {
    /// Read raw records from a JSON-lines file.
    ///
    /// Empty lines are skipped; malformed lines fail with their line number.
    pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<PreferenceRecord>> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PreferenceRecord = serde_json::from_str(&line).map_err(|e| {
                PrefMetalError::Dataset(format!(
                    "{}: line {}: {}",
                    path.display(),
                    idx + 1,
                    e
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Load, optionally shuffle and cap, then tokenize a JSONL file.
    pub fn from_jsonl<P: AsRef<Path>, E: TokenEncoder>(
        path: P,
        template: &ConvTemplate,
        encoder: &E,
        model_max_length: usize,
        max_samples: Option<usize>,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        let mut records = Self::load_records(path)?;
        if shuffle {
            let mut rng = StdRng::seed_from_u64(seed);
            records.shuffle(&mut rng);
        }
        if let Some(max) = max_samples {
            records.truncate(max);
        }

        let mut examples = Vec::with_capacity(records.len());
        for record in &records {
            examples.push(preprocess_record(
                record,
                template,
                encoder,
                model_max_length,
            )?);
        }
        tracing::info!(num_examples = examples.len(), "loaded preference dataset");
        Ok(Self { examples })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get one example by index.
    pub fn get(&self, idx: usize) -> Option<&TokenizedExample> {
        self.examples.get(idx)
    }

    /// Iterate over fixed-size batches (last batch may be short).
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = &[TokenizedExample]> {
        self.examples.chunks(batch_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SepStyle;
    use crate::masking::testing::MockEncoder;
    use std::io::Write;

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

    fn write_jsonl(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    const RECORD: &str = r#"{"prompt":[{"from":"human","value":"Hi"}],"chosen":[{"from":"gpt","value":"Hello"}],"rejected":[{"from":"gpt","value":"Go away"}]}"#;

    #[test]
    fn test_load_records() {
        let file = write_jsonl(&[RECORD, "", RECORD]);
        let records = PreferenceDataset::load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prompt[0].value, "Hi");
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let file = write_jsonl(&[RECORD, "{not json"]);
        let err = PreferenceDataset::load_records(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_from_jsonl_preprocesses_all() {
        let encoder = MockEncoder::new();
        let file = write_jsonl(&[RECORD, RECORD, RECORD]);
        let dataset = PreferenceDataset::from_jsonl(
            file.path(),
            &test_template(),
            &encoder,
            512,
            None,
            false,
            42,
        )
        .unwrap();
        assert_eq!(dataset.len(), 3);
        assert!(dataset.get(0).is_some());
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_max_samples_cap() {
        let encoder = MockEncoder::new();
        let file = write_jsonl(&[RECORD, RECORD, RECORD]);
        let dataset = PreferenceDataset::from_jsonl(
            file.path(),
            &test_template(),
            &encoder,
            512,
            Some(2),
            true,
            7,
        )
        .unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_batches() {
        let encoder = MockEncoder::new();
        let file = write_jsonl(&[RECORD, RECORD, RECORD]);
        let dataset = PreferenceDataset::from_jsonl(
            file.path(),
            &test_template(),
            &encoder,
            512,
            None,
            false,
            42,
        )
        .unwrap();
        let sizes: Vec<usize> = dataset.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }
}
