//! Message Renderer - per-recipient personalization and opt-out footer

use wacast_common::config::MessagingConfig;
use wacast_common::types::contains_keyword;
use wacast_storage::models::Recipient;

/// Renders a campaign template for one recipient
#[derive(Debug, Clone)]
pub struct MessageRenderer {
    footer: String,
    keywords: Vec<String>,
}

impl MessageRenderer {
    /// Create a renderer with an opt-out footer and the keywords that mark
    /// a message as already carrying one
    pub fn new(footer: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            footer: footer.into(),
            keywords,
        }
    }

    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::new(config.opt_out_footer.clone(), config.opt_out_keywords.clone())
    }

    /// Substitute recipient variables and append the opt-out footer unless
    /// the text already mentions an opt-out keyword.
    ///
    /// Unknown `{{placeholders}}` are left as they are.
    pub fn render(&self, template: &str, recipient: &Recipient) -> String {
        let first_name = recipient
            .display_name
            .split_whitespace()
            .next()
            .unwrap_or("");

        let text = template
            .replace("{{name}}", &recipient.display_name)
            .replace("{{first_name}}", first_name)
            .replace("{{phone}}", recipient.phone.as_str());

        if self.has_opt_out(&text) {
            text
        } else {
            format!("{}\n\n{}", text.trim_end(), self.footer)
        }
    }

    /// Whether `text` already carries an opt-out instruction
    pub fn has_opt_out(&self, text: &str) -> bool {
        contains_keyword(text, &self.keywords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wacast_common::types::PhoneNumber;

    fn renderer() -> MessageRenderer {
        MessageRenderer::from_config(&MessagingConfig::default())
    }

    fn dana() -> Recipient {
        Recipient {
            phone: PhoneNumber::from_normalized("972501234567"),
            display_name: "Dana Levi".to_string(),
        }
    }

    #[test]
    fn test_substitutes_variables_and_appends_footer() {
        let rendered = renderer().render("Hi {{first_name}} ({{name}}), your number is {{phone}}", &dana());
        assert_eq!(
            rendered,
            "Hi Dana (Dana Levi), your number is 972501234567\n\n\
             To stop receiving these messages, reply STOP or REMOVE"
        );
    }

    #[test]
    fn test_unknown_placeholders_stay_literal() {
        let rendered = renderer().render("Code {{coupon}} for {{name}}", &dana());
        assert!(rendered.starts_with("Code {{coupon}} for Dana Levi"));
    }

    #[test]
    fn test_missing_name_renders_empty() {
        let recipient = Recipient {
            phone: PhoneNumber::from_normalized("972501234567"),
            display_name: String::new(),
        };
        let rendered = renderer().render("Hi {{name}}{{first_name}}!", &recipient);
        assert!(rendered.starts_with("Hi !\n\n"));
    }

    #[test]
    fn test_footer_is_never_duplicated() {
        let renderer = renderer();

        let embedded = renderer.render("Sale today. Reply stop to opt out", &dana());
        assert_eq!(embedded, "Sale today. Reply stop to opt out");

        let hebrew = renderer.render("מבצע היום. להסרה השיבו הסר", &dana());
        assert_eq!(hebrew, "מבצע היום. להסרה השיבו הסר");

        let inflected = renderer.render("מבצע היום. להסרה השיבו 1", &dana());
        assert_eq!(inflected, "מבצע היום. להסרה השיבו 1");

        let once = renderer.render("Hi {{name}}", &dana());
        let twice = renderer.render(&once, &dana());
        assert_eq!(once, twice);
        assert_eq!(once.matches("reply STOP").count(), 1);
    }
}
