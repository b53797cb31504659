use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub business_name: &'a str,
    pub business_context: &'a str,
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            business_name => ctx.business_name,
            business_context => ctx.business_context,
            has_context => !ctx.business_context.trim().is_empty(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You are the support assistant for \"{}\".\n\
         Answer the visitor's message accurately and concisely. Never invent facts.\n\
         If you cannot answer from the provided business information, say so briefly.\n",
        if ctx.business_name.trim().is_empty() {
            "this business"
        } else {
            ctx.business_name.trim()
        }
    );

    if !ctx.business_context.trim().is_empty() {
        prompt.push_str("\nBusiness information:\n");
        prompt.push_str(ctx.business_context.trim());
        prompt.push('\n');
    }

    prompt
}

/// User-turn content: the recent transcript for continuity plus the latest
/// visitor message.
pub fn render_user_content(transcript: &str, visitor_text: &str) -> String {
    if transcript.trim().is_empty() {
        format!("Visitor message:\n{}", visitor_text.trim())
    } else {
        format!(
            "Conversation so far:\n{}\n\nVisitor message:\n{}",
            transcript.trim(),
            visitor_text.trim()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_business_context_when_present() {
        let prompt = render_system_prompt(&SystemPromptContext {
            business_name: "Acme",
            business_context: "We sell anvils. Shipping takes 3 days.",
        });
        assert!(prompt.contains("Acme"));
        assert!(prompt.contains("anvils"));
    }

    #[test]
    fn prompt_renders_without_context() {
        let prompt = render_system_prompt(&SystemPromptContext {
            business_name: "",
            business_context: "",
        });
        assert!(!prompt.trim().is_empty());
    }

    #[test]
    fn user_content_carries_transcript_and_latest_message() {
        let content = render_user_content("visitor: hi\nbot: hello", "where is my order?");
        assert!(content.contains("visitor: hi"));
        assert!(content.contains("where is my order?"));
    }
}
