//! `@mention` recognition and rendering.
//!
//! The scanner works on a single run of inline text. A mention starts with `@`, followed
//! by a letter or digit, and continues over letters, digits and `-`. An `@` glued to the
//! preceding word, as in `bob@example.com`, is plain text.

use pulldown_cmark_escape::{escape_html, escape_html_body_text};

use crate::types::Profile;

/// Character that starts a mention.
pub const TRIGGER: char = '@';

/// Span of a recognized mention, relative to the `@` it started at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MentionSpan<'a> {
    /// Raw tag without the leading `@`.
    pub tag: &'a str,
    /// Number of bytes consumed, including the `@`.
    pub len: usize,
}

/// Tries to read a mention at the start of `input`.
///
/// Returns `None` when `input` does not start with `@` or the `@` is not followed by a
/// letter or digit. Nothing is consumed in that case.
pub fn scan(input: &str) -> Option<MentionSpan<'_>> {
    let rest = input.strip_prefix(TRIGGER)?;
    let mut chars = rest.char_indices();

    let (_, first) = chars.next()?;
    if !first.is_alphanumeric() {
        return None;
    }

    let end = chars
        .find(|(_, c)| !is_tag_char(*c))
        .map(|(offset, _)| offset)
        .unwrap_or(rest.len());

    Some(MentionSpan {
        tag: &rest[..end],
        len: TRIGGER.len_utf8() + end,
    })
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-'
}

/// Piece of a text run after mention scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Mention(&'a str),
}

/// Splits a text run into literal text and mention tags, in order.
///
/// An `@` that does not start a mention stays part of the surrounding text.
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    segments_with_escapes(text, &[])
}

/// Like [`segments`], but the `@` at each byte offset in `escaped` is taken literally.
pub fn segments_with_escapes<'a>(text: &'a str, escaped: &[usize]) -> Vec<Segment<'a>> {
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(TRIGGER) {
        let at = cursor + found;
        let literal = escaped.contains(&at) || follows_word(&text[..at]);
        match scan(&text[at..]).filter(|_| !literal) {
            Some(span) => {
                if literal_start < at {
                    out.push(Segment::Text(&text[literal_start..at]));
                }
                out.push(Segment::Mention(span.tag));
                cursor = at + span.len;
                literal_start = cursor;
            }
            None => cursor = at + TRIGGER.len_utf8(),
        }
    }

    if literal_start < text.len() {
        out.push(Segment::Text(&text[literal_start..]));
    }
    out
}

// Characters that may end the local part of an email address.
fn follows_word(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'))
}

/// Mention found while parsing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionNode {
    pub tag: String,
    pub profile: Option<Profile>,
}

impl MentionNode {
    /// Text shown for the mention.
    pub fn label(&self) -> String {
        match &self.profile {
            Some(profile) => format!("{TRIGGER}{}", profile.visible_name()),
            None => self.tag.clone(),
        }
    }

    /// Opening tag of the inline element wrapping the mention.
    pub fn open_tag(&self) -> String {
        match &self.profile {
            Some(profile) => format!(
                r#"<span class="mention" data-user-id="{}">"#,
                escape_attribute(&profile.id)
            ),
            None => r#"<span class="mention">"#.to_string(),
        }
    }

    pub fn close_tag(&self) -> &'static str {
        "</span>"
    }

    /// Renders the complete inline element.
    pub fn to_html(&self) -> String {
        let mut out = self.open_tag();
        out.push_str(&escape_text(&self.label()));
        out.push_str(self.close_tag());
        out
    }
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    // Writing into a `String` cannot fail.
    let _ = escape_html(&mut out, value);
    out
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let _ = escape_html_body_text(&mut out, value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_stops_at_whitespace_after_hyphenated_tag() {
        let span = scan("@bob-42 said hi").expect("mention");
        assert_eq!(span.tag, "bob-42");
        assert_eq!(span.len, 7);
    }

    #[test]
    fn scan_rejects_space_after_trigger() {
        assert_eq!(scan("@ 42"), None);
        assert_eq!(scan("@-bob"), None);
        assert_eq!(scan("@"), None);
        assert_eq!(scan("bob"), None);
    }

    #[test]
    fn scan_accepts_single_character_at_end_of_input() {
        let span = scan("@x").expect("mention");
        assert_eq!(span.tag, "x");
        assert_eq!(span.len, 2);
    }

    #[test]
    fn scan_handles_multibyte_letters() {
        let span = scan("@jürgen, hallo").expect("mention");
        assert_eq!(span.tag, "jürgen");
        assert_eq!(span.len, "@jürgen".len());
    }

    #[test]
    fn scan_keeps_trailing_hyphen_and_stops_at_punctuation() {
        assert_eq!(scan("@a-b-!").map(|s| s.tag), Some("a-b-"));
        assert_eq!(scan("@7.").map(|s| s.tag), Some("7"));
    }

    #[test]
    fn segments_leave_bare_triggers_as_text() {
        assert_eq!(
            segments("ping @alice and @ bob @carol!"),
            vec![
                Segment::Text("ping "),
                Segment::Mention("alice"),
                Segment::Text(" and @ bob "),
                Segment::Mention("carol"),
                Segment::Text("!"),
            ]
        );
        assert_eq!(segments("no mentions"), vec![Segment::Text("no mentions")]);
        assert_eq!(segments("@x"), vec![Segment::Mention("x")]);
    }

    #[test]
    fn email_addresses_are_not_mentions() {
        assert_eq!(
            segments("mail bob@example.com or first.last@host.org"),
            vec![Segment::Text("mail bob@example.com or first.last@host.org")]
        );
        assert_eq!(
            segments("(@alice)"),
            vec![
                Segment::Text("("),
                Segment::Mention("alice"),
                Segment::Text(")")
            ]
        );
    }

    #[test]
    fn escaped_triggers_stay_literal() {
        assert_eq!(
            segments_with_escapes("@alice @bob", &[0]),
            vec![Segment::Text("@alice "), Segment::Mention("bob")]
        );
    }

    #[test]
    fn attribute_escaping_covers_quotes() {
        let node = MentionNode {
            tag: "x".into(),
            profile: Some(Profile {
                id: "a\"b".into(),
                username: "x".into(),
                display_name: None,
            }),
        };
        assert_eq!(
            node.open_tag(),
            r#"<span class="mention" data-user-id="a&quot;b">"#
        );
    }

    fn profile(display_name: Option<&str>) -> Profile {
        Profile {
            id: "u-1".into(),
            username: "alice".into(),
            display_name: display_name.map(str::to_string),
        }
    }

    #[test]
    fn renders_display_name_with_user_id() {
        let node = MentionNode {
            tag: "alice".into(),
            profile: Some(profile(Some("Alice <A>"))),
        };
        assert_eq!(
            node.to_html(),
            r#"<span class="mention" data-user-id="u-1">@Alice &lt;A&gt;</span>"#
        );
    }

    #[test]
    fn renders_username_when_display_name_missing() {
        let node = MentionNode {
            tag: "u-1".into(),
            profile: Some(profile(None)),
        };
        assert_eq!(node.label(), "@alice");
    }

    #[test]
    fn renders_raw_tag_without_profile() {
        let node = MentionNode {
            tag: "someone".into(),
            profile: None,
        };
        assert_eq!(node.to_html(), r#"<span class="mention">someone</span>"#);
    }
}
