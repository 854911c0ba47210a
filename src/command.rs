//! The single command recognized inside chat text: `/imagine <prompt>`.

const IMAGINE_PREFIX: &str = "/imagine";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatCommand {
    /// Regular chat input, forwarded unmodified.
    Plain,
    /// Image generation with the text after the prefix as prompt.
    Imagine { prompt: String },
}

impl ChatCommand {
    /// Exact-prefix match: `/imagine`, at least one whitespace character, then a
    /// non-empty remainder taken up to the end of the first line.
    pub fn parse(text: &str) -> Self {
        let Some(rest) = text.strip_prefix(IMAGINE_PREFIX) else {
            return ChatCommand::Plain;
        };
        if !rest.starts_with(char::is_whitespace) {
            return ChatCommand::Plain;
        }
        let prompt = rest
            .trim_start()
            .split(['\n', '\r', '\u{2028}', '\u{2029}'])
            .next()
            .unwrap_or_default();
        if prompt.is_empty() {
            return ChatCommand::Plain;
        }
        ChatCommand::Imagine {
            prompt: prompt.to_string(),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ChatCommand::Imagine { .. })
    }
}
