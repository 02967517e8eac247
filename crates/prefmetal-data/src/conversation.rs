//! Conversation templates for preference records.
//!
//! A template turns a list of role-tagged turns into the flat transcript the
//! model is trained on. Each model family has its own separator conventions,
//! and the label-masking arithmetic in [`crate::masking`] depends on them, so
//! templates carry an explicit [`SepStyle`] tag rather than free-form format
//! strings.

use prefmetal_core::{PrefMetalError, Result};
use serde::{Deserialize, Serialize};

/// A single turn in a conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Source role: "human" or "gpt".
    pub from: String,
    /// Turn text.
    pub value: String,
}

impl Turn {
    /// Create a new turn.
    pub fn new(from: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            value: value.into(),
        }
    }
}

/// A pairwise preference record: shared prompt, preferred and dispreferred
/// continuations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceRecord {
    /// Shared conversation prefix, ending on a human turn.
    pub prompt: Vec<Turn>,
    /// Preferred continuation.
    pub chosen: Vec<Turn>,
    /// Dispreferred continuation.
    pub rejected: Vec<Turn>,
}

/// Separator concatenation style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SepStyle {
    /// `ROLE: text` turns, alternating `sep` after human turns and `sep2`
    /// after assistant turns (Vicuna family).
    AddColonTwo,
    /// `[INST] text [/INST] reply` turns with `sep2` closing each exchange
    /// (Llama-2 chat family).
    Llama2,
}

/// A conversation template for one model family.
///
/// Immutable after construction except for the message buffer, which is
/// cleared and refilled per record.
#[derive(Debug, Clone)]
pub struct ConvTemplate {
    /// Template name.
    pub name: String,
    /// System message prepended to every transcript.
    pub system_message: String,
    /// Role labels, `[human, assistant]`.
    pub roles: [String; 2],
    /// Concatenation style.
    pub style: SepStyle,
    /// Primary separator, appended after human turns.
    pub sep: String,
    /// Secondary separator, appended after assistant turns.
    pub sep2: String,
    messages: Vec<(usize, String)>,
}

impl ConvTemplate {
    /// Create a template from its parts.
    pub fn new(
        name: impl Into<String>,
        system_message: impl Into<String>,
        roles: [&str; 2],
        style: SepStyle,
        sep: impl Into<String>,
        sep2: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_message: system_message.into(),
            roles: [roles[0].to_string(), roles[1].to_string()],
            style,
            sep: sep.into(),
            sep2: sep2.into(),
            messages: Vec::new(),
        }
    }

    /// Vicuna-style template (the default).
    pub fn vicuna() -> Self {
        Self::new(
            "vicuna",
            "A chat between a curious user and an artificial intelligence assistant. \
             The assistant gives helpful, detailed, and polite answers to the user's questions.",
            ["USER", "ASSISTANT"],
            SepStyle::AddColonTwo,
            " ",
            "</s>",
        )
    }

    /// Llama-2 chat template.
    pub fn llama2() -> Self {
        Self::new(
            "llama-2",
            "You are a helpful, respectful and honest assistant.",
            ["[INST]", "[/INST]"],
            SepStyle::Llama2,
            " ",
            " </s><s>",
        )
    }

    /// Pick a template from a model path or identifier substring.
    ///
    /// Unknown model names fall back to the Vicuna template.
    pub fn for_model(model_path: &str) -> Self {
        let lower = model_path.to_lowercase();
        if lower.contains("llama-2") || lower.contains("llama2") {
            Self::llama2()
        } else {
            Self::vicuna()
        }
    }

    /// Clear the message buffer.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Number of buffered messages.
    pub fn num_messages(&self) -> usize {
        self.messages.len()
    }

    /// Append turns, enforcing strict human/assistant alternation.
    ///
    /// The expected role at each position is determined by the current buffer
    /// length, so continuations appended after a prompt keep the same parity.
    pub fn append_turns(&mut self, turns: &[Turn]) -> Result<()> {
        for turn in turns {
            let role_idx = self.role_index(&turn.from)?;
            let expected = self.messages.len() % 2;
            if role_idx != expected {
                return Err(PrefMetalError::Template(format!(
                    "turn {} has role {}, expected {}",
                    self.messages.len(),
                    self.roles[role_idx],
                    self.roles[expected]
                )));
            }
            self.messages.push((role_idx, turn.value.clone()));
        }
        Ok(())
    }

    /// Render the buffered messages into a transcript string.
    pub fn render(&self) -> String {
        let seps = [&self.sep, &self.sep2];
        match self.style {
            SepStyle::AddColonTwo => {
                let mut ret = format!("{}{}", self.system_message, self.sep);
                for (i, (role_idx, text)) in self.messages.iter().enumerate() {
                    ret.push_str(&self.roles[*role_idx]);
                    ret.push_str(": ");
                    ret.push_str(text);
                    ret.push_str(seps[i % 2]);
                }
                ret
            }
            SepStyle::Llama2 => {
                let mut ret = if self.system_message.is_empty() {
                    format!("{} ", self.roles[0])
                } else {
                    format!(
                        "{} <<SYS>>\n{}\n<</SYS>>\n\n",
                        self.roles[0], self.system_message
                    )
                };
                for (i, (role_idx, text)) in self.messages.iter().enumerate() {
                    if i == 0 {
                        // The opening role tag is already part of the prefix.
                        ret.push_str(text);
                        ret.push(' ');
                    } else {
                        ret.push_str(&self.roles[*role_idx]);
                        ret.push(' ');
                        ret.push_str(text);
                        ret.push_str(seps[i % 2]);
                    }
                }
                ret
            }
        }
    }

    /// The string that opens an assistant turn inside a rendered transcript.
    ///
    /// Masking splits each turn on this to find where supervision starts.
    pub fn assistant_header(&self) -> String {
        match self.style {
            SepStyle::AddColonTwo => format!("{}{}: ", self.sep, self.roles[1]),
            SepStyle::Llama2 => format!("{}{} ", self.sep, self.roles[1]),
        }
    }

    fn role_index(&self, from: &str) -> Result<usize> {
        match from {
            "human" => Ok(0),
            "gpt" => Ok(1),
            other => Err(PrefMetalError::Template(format!(
                "unknown turn role {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_turn_record() -> PreferenceRecord {
        PreferenceRecord {
            prompt: vec![Turn::new("human", "Hi")],
            chosen: vec![Turn::new("gpt", "Hello")],
            rejected: vec![Turn::new("gpt", "Go away")],
        }
    }

    #[test]
    fn test_vicuna_render() {
        let mut conv = ConvTemplate::new(
            "test",
            "S",
            ["USER", "ASSISTANT"],
            SepStyle::AddColonTwo,
            " ",
            "</s>",
        );
        let record = two_turn_record();
        conv.append_turns(&record.prompt).unwrap();
        let prompt = conv.render();
        assert_eq!(prompt, "S USER: Hi ");

        conv.append_turns(&record.chosen).unwrap();
        let chosen = conv.render();
        assert_eq!(chosen, "S USER: Hi ASSISTANT: Hello</s>");
        assert!(chosen.starts_with(&prompt));
    }

    #[test]
    fn test_llama2_render_prefix_property() {
        let mut conv =
            ConvTemplate::new("test", "", ["[INST]", "[/INST]"], SepStyle::Llama2, " ", " </s><s>");
        let record = two_turn_record();
        conv.append_turns(&record.prompt).unwrap();
        let prompt = conv.render();
        assert_eq!(prompt, "[INST] Hi ");

        conv.append_turns(&record.chosen).unwrap();
        let chosen = conv.render();
        assert_eq!(chosen, "[INST] Hi [/INST] Hello </s><s>");
        assert!(chosen.starts_with(&prompt));
    }

    #[test]
    fn test_alternation_violation_is_an_error() {
        let mut conv = ConvTemplate::vicuna();
        let turns = vec![
            Turn::new("human", "a"),
            Turn::new("human", "b"),
            Turn::new("human", "c"),
        ];
        let err = conv.append_turns(&turns).unwrap_err();
        assert!(matches!(err, PrefMetalError::Template(_)));
    }

    #[test]
    fn test_unknown_role_is_an_error() {
        let mut conv = ConvTemplate::vicuna();
        let turns = vec![Turn::new("system", "a")];
        assert!(conv.append_turns(&turns).is_err());
    }

    #[test]
    fn test_for_model_registry() {
        assert_eq!(ConvTemplate::for_model("meta-llama/Llama-2-7b-chat-hf").name, "llama-2");
        assert_eq!(ConvTemplate::for_model("lmsys/vicuna-7b-v1.5").name, "vicuna");
        assert_eq!(ConvTemplate::for_model("some/other-model").name, "vicuna");
    }

    #[test]
    fn test_assistant_header() {
        assert_eq!(ConvTemplate::vicuna().assistant_header(), " ASSISTANT: ");
        assert_eq!(ConvTemplate::llama2().assistant_header(), " [/INST] ");
    }
}
