//! Assistant personas selectable per chat session.

use serde::{Deserialize, Serialize};

const BASE_INSTRUCTION: &str = "Your name is FahzGPT, an AI assistant powered by the Fahz-Flash model. \
You were created by Fahz-Team OFFC. ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Default,
    Math,
    Coder,
    Chef,
}

impl ChatMode {
    pub const ALL: [ChatMode; 4] = [ChatMode::Default, ChatMode::Math, ChatMode::Coder, ChatMode::Chef];

    pub fn label(self) -> &'static str {
        match self {
            ChatMode::Default => "FahzGPT Default",
            ChatMode::Math => "FahzGPT Math",
            ChatMode::Coder => "FahzGPT Coder",
            ChatMode::Chef => "FahzGPT Chef",
        }
    }

    /// System instruction sent with every request in this mode.
    pub fn system_instruction(self) -> String {
        let persona = match self {
            ChatMode::Math => {
                "You are a mathematics expert. Give accurate, step-by-step mathematical explanations."
            }
            ChatMode::Coder => {
                "You are a senior hardware and software engineer. Give clean, efficient code and in-depth technical explanations."
            }
            ChatMode::Chef => {
                "You are a professional chef. Share recipes, kitchen tips and the best culinary techniques."
            }
            ChatMode::Default => "You are a friendly and clever general-purpose assistant.",
        };
        format!("{BASE_INSTRUCTION}{persona}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_shares_the_base_identity() {
        for mode in ChatMode::ALL {
            let instruction = mode.system_instruction();
            assert!(instruction.starts_with("Your name is FahzGPT"));
            assert!(instruction.len() > BASE_INSTRUCTION.len());
        }
    }

    #[test]
    fn modes_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&ChatMode::Chef).unwrap(), "\"chef\"");
    }
}
