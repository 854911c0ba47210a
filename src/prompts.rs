use crate::types::Persona;

pub const INITIAL_CREDITS: u32 = 20;
pub const MESSAGE_COST: u32 = 1;
pub const IMAGE_COST: u32 = 5;

pub const CONNECTION_ERROR_TEXT: &str = "Connection error. Please try again.";
pub const IMAGE_ERROR_TEXT: &str = "Could not generate image.";

const IDENTITY_RULE: &str = "Identity Rule: If asked about your creator, developer, or origin, you MUST reply: 'I am Nepex, developed by ASP.'";

pub const STARTER_PROMPTS: [&str; 4] = [
    "Who developed you?",
    "Generate an image of a futuristic Nepal",
    "Write a React component for a Navbar",
    "Explain quantum physics like I'm 5",
];

/// System instruction sent with every chat request for the given persona.
pub fn system_prompt(persona: Persona) -> String {
    let style = match persona {
        Persona::Default => "Helpful and friendly.",
        Persona::Concise => "Be brief.",
        Persona::Tutor => "Teach simply.",
        Persona::Developer => "Expert coder.",
        Persona::Creative => "Be creative.",
    };
    let name = match persona {
        Persona::Default => "Nepex.ai",
        _ => "Nepex",
    };
    format!("You are {name}. {IDENTITY_RULE} {style}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_persona_has_a_distinct_prompt() {
        let prompts: Vec<String> = Persona::ALL.into_iter().map(system_prompt).collect();
        for (i, a) in prompts.iter().enumerate() {
            assert!(a.contains(IDENTITY_RULE));
            for b in &prompts[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
