//! Two-message prompts for the two supported tasks.
//!
//! A `Prompt` is always exactly `[system, user]`. It is built fresh for each
//! request and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::model::ChatMessage;
use crate::normalizer::{clean_text, squeeze_blank_lines};

pub const DEFAULT_EXPLAIN_CODE_PROMPT: &str = "You are an experienced programmer. \
Explain what the given code does and why, step by step, for a reader who knows \
the basics of the language. Respond in markdown.";

pub const DEFAULT_SUMMARIZE_PAGE_PROMPT: &str = "You are an assistant that analyzes \
the contents of a website and provides a short summary, ignoring text that might be \
navigation related. Respond in markdown.";

/// What the user payload represents.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    ExplainCode,
    SummarizePage,
}

impl Task {
    pub fn default_system_prompt(&self) -> &'static str {
        match self {
            Self::ExplainCode => DEFAULT_EXPLAIN_CODE_PROMPT,
            Self::SummarizePage => DEFAULT_SUMMARIZE_PAGE_PROMPT,
        }
    }
}

/// A page already fetched and reduced to text by the caller's scraper.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Page {
    pub url: Option<String>,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    messages: [ChatMessage; 2],
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: [ChatMessage::system(system), ChatMessage::user(user)],
        }
    }

    pub fn explain_code(system: &str, snippet: &str) -> Self {
        let user = format!(
            "Please explain what this code does:\n\n```\n{}\n```",
            clean_text(snippet)
        );
        Self::new(system, user)
    }

    pub fn summarize_page(system: &str, page: &Page) -> Self {
        let title = clean_text(&page.title);
        let title = if title.is_empty() { "(untitled)" } else { title.as_str() };
        let mut user = format!("You are looking at a website titled {title}");
        if let Some(url) = page.url.as_deref() {
            user.push_str(&format!(" ({url})"));
        }
        user.push_str(
            "\nThe contents of this website is as follows; please provide a short summary \
             of this website in markdown. If it includes news or announcements, then \
             summarize these too.\n\n",
        );
        user.push_str(&squeeze_blank_lines(&clean_text(&page.text)));
        Self::new(system, user)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn system(&self) -> &str {
        &self.messages[0].content
    }

    pub fn user(&self) -> &str {
        &self.messages[1].content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn always_system_then_user() {
        let p = Prompt::new("sys", "usr");
        let roles: Vec<Role> = p.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
        assert_eq!(p.system(), "sys");
        assert_eq!(p.user(), "usr");
    }

    #[test]
    fn explain_code_fences_cleaned_snippet() {
        let p = Prompt::explain_code(DEFAULT_EXPLAIN_CODE_PROMPT, "\r\nyield from {b for b in books}\r\n");
        assert!(p.user().contains("```\nyield from {b for b in books}\n```"));
        assert_eq!(p.system(), DEFAULT_EXPLAIN_CODE_PROMPT);
    }

    #[test]
    fn summarize_page_uses_title_and_text() {
        let page = Page {
            url: Some("https://example.com".into()),
            title: "  Example Corp ".into(),
            text: "Welcome\n\n\n\nWe build widgets.".into(),
        };
        let p = Prompt::summarize_page(Task::SummarizePage.default_system_prompt(), &page);
        assert!(p.user().starts_with("You are looking at a website titled Example Corp (https://example.com)"));
        assert!(p.user().ends_with("Welcome\n\nWe build widgets."));
        assert!(p.user().contains("news or announcements"));
    }

    #[test]
    fn summarize_page_without_title() {
        let page = Page {
            url: None,
            title: "   ".into(),
            text: "body".into(),
        };
        let p = Prompt::summarize_page("s", &page);
        assert!(p.user().contains("titled (untitled)\n"));
    }
}
