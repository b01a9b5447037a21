//! Markdown to HTML rendering with `@mention` support.
//!
//! The document is parsed into an event list with `pulldown-cmark`. Text runs outside of
//! code and autolinks are then split on mentions, which are resolved through a
//! [`MentionResolver`] before any HTML is produced. Mentions that cannot be resolved are
//! dropped from the output entirely. Raw HTML is omitted and link destinations with a
//! scriptable scheme are blanked.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use pulldown_cmark::{html, CowStr, Event, LinkType, Options, Parser, Tag, TagEnd};
use thiserror::Error;
use tracing::{debug, warn};

use crate::identity::MentionResolver;
use crate::mention::{self, MentionNode, Segment};
use crate::types::Profile;

const RAW_HTML_OMITTED: &str = "<!-- raw HTML omitted -->";

/// Errors produced while rendering markdown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkdownError {
    #[error("rendering was cancelled")]
    Cancelled,
}

/// Cooperative cancellation signal checked between document nodes.
///
/// A signal trips when [`Cancellation::cancel`] is called on any clone, or once its
/// deadline has passed.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that trips by itself after `budget`.
    pub fn with_timeout(budget: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn check(&self) -> Result<(), MarkdownError> {
        if self.is_cancelled() {
            Err(MarkdownError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Output of a render pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub html: String,
    /// Resolved mentions, deduplicated by identity id, in order of first appearance.
    pub mentions: Vec<Profile>,
    /// Number of mentions dropped because they could not be resolved.
    pub unresolved: usize,
}

enum Node<'a> {
    Markdown(Event<'a>),
    Mention(MentionNode),
}

/// Renders comment markdown to HTML.
#[derive(Clone)]
pub struct MarkdownRenderer {
    resolver: Option<Arc<dyn MentionResolver>>,
    options: Options,
}

impl MarkdownRenderer {
    /// Creates a renderer that resolves mentions through `resolver`.
    pub fn new(resolver: Arc<dyn MentionResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            options: default_options(),
        }
    }

    /// Creates a renderer that keeps mentions unresolved and shows their raw tag.
    pub fn plain() -> Self {
        Self {
            resolver: None,
            options: default_options(),
        }
    }

    /// Parses `content`, resolves its mentions and renders it to HTML.
    ///
    /// On cancellation the partially rendered output is discarded.
    pub async fn render(
        &self,
        content: &str,
        cancel: &Cancellation,
    ) -> Result<Rendered, MarkdownError> {
        let (nodes, unresolved) = self.parse(content, cancel).await?;
        let mentions = collect_mentions(&nodes);
        let html = render_nodes(nodes, cancel)?;

        Ok(Rendered {
            html,
            mentions,
            unresolved,
        })
    }

    async fn parse<'a>(
        &self,
        content: &'a str,
        cancel: &Cancellation,
    ) -> Result<(Vec<Node<'a>>, usize), MarkdownError> {
        let mut events = Parser::new_ext(content, self.options)
            .into_offset_iter()
            .peekable();

        let mut nodes = Vec::new();
        let mut unresolved = 0;
        let mut code_depth = 0usize;
        let mut links: Vec<bool> = Vec::new();
        let mut in_html_block = false;

        while let Some((event, range)) = events.next() {
            cancel.check()?;

            match event {
                Event::Text(text) if code_depth == 0 && !links.iter().any(|auto| *auto) => {
                    let mut run = TextRun::new(content, text, range);
                    while let Some((Event::Text(text), range)) =
                        events.next_if(|(event, _)| matches!(event, Event::Text(_)))
                    {
                        run.push(content, text, range);
                    }
                    unresolved += self.expand_text(run, &mut nodes, cancel).await?;
                }
                Event::Start(Tag::HtmlBlock) => {
                    in_html_block = true;
                    nodes.push(Node::Markdown(Event::Html(
                        format!("{RAW_HTML_OMITTED}\n").into(),
                    )));
                }
                Event::End(TagEnd::HtmlBlock) => in_html_block = false,
                Event::Html(_) => {
                    if !in_html_block {
                        nodes.push(Node::Markdown(Event::Html(RAW_HTML_OMITTED.into())));
                    }
                }
                Event::InlineHtml(_) => {
                    nodes.push(Node::Markdown(Event::InlineHtml(RAW_HTML_OMITTED.into())));
                }
                other => {
                    match &other {
                        Event::Start(Tag::CodeBlock(_)) => code_depth += 1,
                        Event::End(TagEnd::CodeBlock) => code_depth = code_depth.saturating_sub(1),
                        Event::Start(Tag::Link { link_type, .. }) => links.push(matches!(
                            link_type,
                            LinkType::Autolink | LinkType::Email
                        )),
                        Event::End(TagEnd::Link) => {
                            links.pop();
                        }
                        _ => {}
                    }
                    nodes.push(Node::Markdown(blank_dangerous_destination(other)));
                }
            }
        }

        Ok((nodes, unresolved))
    }

    async fn expand_text<'a>(
        &self,
        run: TextRun<'a>,
        nodes: &mut Vec<Node<'a>>,
        cancel: &Cancellation,
    ) -> Result<usize, MarkdownError> {
        let TextRun { text, escaped } = run;
        if !text.contains(mention::TRIGGER) {
            nodes.push(Node::Markdown(Event::Text(text)));
            return Ok(0);
        }

        let mut unresolved = 0;
        for segment in mention::segments_with_escapes(&text, &escaped) {
            match segment {
                Segment::Text(literal) => {
                    nodes.push(Node::Markdown(Event::Text(literal.to_string().into())));
                }
                Segment::Mention(tag) => {
                    cancel.check()?;
                    match self.resolve(tag).await {
                        Some(node) => nodes.push(Node::Mention(node)),
                        None => unresolved += 1,
                    }
                }
            }
        }
        Ok(unresolved)
    }

    async fn resolve(&self, tag: &str) -> Option<MentionNode> {
        let Some(resolver) = &self.resolver else {
            return Some(MentionNode {
                tag: tag.to_string(),
                profile: None,
            });
        };

        match resolver.resolve_mention(tag).await {
            Ok(profile) => Some(MentionNode {
                tag: tag.to_string(),
                profile: Some(profile),
            }),
            Err(err) if err.is_not_found() => {
                debug!(stage = "markdown", %tag, "dropping mention of unknown identity");
                None
            }
            Err(err) => {
                warn!(stage = "markdown", %tag, error = %err, "failed to resolve mention");
                None
            }
        }
    }
}

fn default_options() -> Options {
    Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
}

/// Adjacent text events merged into one run.
///
/// The parser starts a new text event right after a backslash escape, so the offsets of
/// escaped `@` characters are remembered before the events are joined.
struct TextRun<'a> {
    text: CowStr<'a>,
    escaped: Vec<usize>,
}

impl<'a> TextRun<'a> {
    fn new(source: &str, text: CowStr<'a>, range: Range<usize>) -> Self {
        let mut run = Self {
            text: CowStr::Borrowed(""),
            escaped: Vec::new(),
        };
        run.push(source, text, range);
        run
    }

    fn push(&mut self, source: &str, text: CowStr<'a>, range: Range<usize>) {
        let escaped_trigger = text.starts_with(mention::TRIGGER)
            && source
                .get(..range.start)
                .is_some_and(|before| before.ends_with('\\'));
        if escaped_trigger {
            self.escaped.push(self.text.len());
        }

        if self.text.is_empty() {
            self.text = text;
        } else {
            let mut merged = self.text.to_string();
            merged.push_str(&text);
            self.text = merged.into();
        }
    }
}

fn blank_dangerous_destination(event: Event<'_>) -> Event<'_> {
    match event {
        Event::Start(Tag::Link {
            link_type,
            dest_url,
            title,
            id,
        }) if is_dangerous_url(&dest_url) => Event::Start(Tag::Link {
            link_type,
            dest_url: CowStr::Borrowed(""),
            title,
            id,
        }),
        Event::Start(Tag::Image {
            link_type,
            dest_url,
            title,
            id,
        }) if is_dangerous_url(&dest_url) => Event::Start(Tag::Image {
            link_type,
            dest_url: CowStr::Borrowed(""),
            title,
            id,
        }),
        other => other,
    }
}

const SAFE_DATA_IMAGES: [&str; 5] = ["png;", "gif;", "jpeg;", "webp;", "svg+xml;"];

/// Returns `true` for `javascript:`, `vbscript:`, `file:` and `data:` urls, except for
/// inline raster and svg images.
fn is_dangerous_url(url: &str) -> bool {
    let url = url.trim_start().to_ascii_lowercase();
    if let Some(kind) = url.strip_prefix("data:image/") {
        return !SAFE_DATA_IMAGES.iter().any(|safe| kind.starts_with(safe));
    }
    ["javascript:", "vbscript:", "file:", "data:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

fn collect_mentions(nodes: &[Node<'_>]) -> Vec<Profile> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter_map(|node| match node {
            Node::Mention(MentionNode {
                profile: Some(profile),
                ..
            }) => Some(profile),
            _ => None,
        })
        .filter(|profile| seen.insert(profile.id.clone()))
        .cloned()
        .collect()
}

fn render_nodes(nodes: Vec<Node<'_>>, cancel: &Cancellation) -> Result<String, MarkdownError> {
    let mut events = Vec::with_capacity(nodes.len());
    for node in nodes {
        cancel.check()?;
        match node {
            Node::Markdown(event) => events.push(event),
            Node::Mention(mention) => events.push(Event::InlineHtml(mention.to_html().into())),
        }
    }

    let mut out = String::new();
    html::push_html(&mut out, events.into_iter());
    Ok(out)
}
