//! Data pipeline for prefmetal.
//!
//! This crate provides:
//! - Conversation templates with per-family separator conventions
//! - Turn-boundary label masking with the `-100` ignore sentinel
//! - Pairwise preprocessing of preference records
//! - JSONL dataset loading and batch collation
//! - A tokenizer wrapper over the `tokenizers` crate

#![warn(missing_docs)]

pub mod collator;
pub mod conversation;
pub mod dataset;
pub mod masking;
pub mod preprocess;
pub mod tokenizer;

pub use collator::{PreferenceBatch, PreferenceCollator};
pub use conversation::{ConvTemplate, PreferenceRecord, SepStyle, Turn};
pub use dataset::PreferenceDataset;
pub use masking::{mask_labels, TokenEncoder, IGNORE_TOKEN_ID};
pub use preprocess::{format_views, preprocess_record, TokenizedExample};
pub use tokenizer::Tokenizer;
