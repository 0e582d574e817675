use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Plain text suitable for speech synthesis from markdown display text.
/// Links are read as "text at url"; all other markup is dropped. When the
/// markup leaves nothing to say, the raw text is spoken with its whitespace
/// collapsed.
pub fn markdown_to_speech_text(markdown: &str) -> String {
    let text = render(markdown);
    if text.is_empty() && !markdown.trim().is_empty() {
        log::debug!("Markdown rendered to nothing, speaking raw text");
        return collapse(markdown);
    }
    text
}

fn render(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut links: Vec<String> = Vec::new();

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Link { dest_url, .. }) => links.push(dest_url.to_string()),
            Event::End(TagEnd::Link) => {
                if let Some(url) = links.pop() {
                    out.push_str(" at ");
                    out.push_str(&url);
                }
            }
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => out.push(' '),
            _ => {}
        }
    }

    collapse(&out)
}

fn collapse(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_is_spoken_with_url() {
        assert_eq!(
            markdown_to_speech_text("Book at [the portal](https://parks.example/book)."),
            "Book at the portal at https://parks.example/book."
        );
    }

    #[test]
    fn test_markup_only_text_falls_back_to_raw() {
        assert_eq!(
            markdown_to_speech_text("<div>\n  Closed   today\n</div>"),
            "<div> Closed today </div>"
        );
        assert_eq!(markdown_to_speech_text("  \n "), "");
    }

    #[test]
    fn test_markup_is_stripped() {
        let text = "## Hours\n\n- **Weekdays**: 8am\n- *Weekends*: `9am`\n";
        assert_eq!(markdown_to_speech_text(text), "Hours Weekdays: 8am Weekends: 9am");
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(markdown_to_speech_text("Parks open 8am to dusk."), "Parks open 8am to dusk.");
    }

    #[test]
    fn test_empty() {
        assert_eq!(markdown_to_speech_text("   "), "");
    }
}
