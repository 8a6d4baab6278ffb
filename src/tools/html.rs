//! Lightweight HTML handling for the page tools.
//!
//! Two consumers share one tokenizer: [`clean_html`] reduces a page to the
//! readable text the model sees, and [`Document`] keeps an element tree that
//! [`Selector`]s run against for extraction. This is a forgiving scanner, not a
//! standards-compliant HTML parser: unclosed elements extend to the end of the
//! document and stray close tags are ignored.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;

/// Elements dropped entirely when cleaning a page for the model.
const STRIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "svg", "nav", "footer", "header", "form", "noscript",
];

/// Elements whose content is raw text, not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements that start a new line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "li", "main", "ol", "p", "pre", "section",
    "table", "tbody", "td", "th", "thead", "title", "tr", "ul",
];

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<!--.*?-->|<![^>]*>|<\?[^>]*>|<(/?)([A-Za-z][A-Za-z0-9:-]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#,
    )
    .expect("tag regex is valid")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:@][-A-Za-z0-9_:.@]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute regex is valid")
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
        .expect("entity regex is valid")
});

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open {
        tag: String,
        attrs: &'a str,
        self_closing: bool,
    },
    Close {
        tag: String,
    },
    Text(&'a str),
}

fn tokenize(html: &str) -> Vec<Token<'_>> {
    let re = &*TAG_RE;
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < html.len() {
        let Some(caps) = re.captures_at(html, pos) else {
            break;
        };
        let Some(whole) = caps.get(0) else {
            break;
        };
        if whole.start() > pos {
            tokens.push(Token::Text(&html[pos..whole.start()]));
        }
        pos = whole.end();

        // Comments, doctypes and processing instructions carry no name.
        let Some(name) = caps.get(2) else {
            continue;
        };
        let tag = name.as_str().to_ascii_lowercase();
        if caps.get(1).is_some_and(|c| !c.as_str().is_empty()) {
            tokens.push(Token::Close { tag });
            continue;
        }

        let attrs = caps.get(3).map_or("", |a| a.as_str());
        let self_closing = attrs.trim_end().ends_with('/');
        let raw_text = !self_closing && RAW_TEXT_ELEMENTS.contains(&tag.as_str());
        let close_marker = format!("</{}", tag);
        tokens.push(Token::Open {
            tag,
            attrs,
            self_closing,
        });

        if raw_text {
            let end = html[pos..]
                .to_ascii_lowercase()
                .find(&close_marker)
                .map_or(html.len(), |i| pos + i);
            if end > pos {
                tokens.push(Token::Text(&html[pos..end]));
            }
            pos = end;
        }
    }

    if pos < html.len() {
        tokens.push(Token::Text(&html[pos..]));
    }
    tokens
}

/// Decode named and numeric character references.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    ENTITY_RE
        .replace_all(s, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(entity)
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "euro" => '€',
        "pound" => '£',
        "middot" => '·',
        "bull" => '•',
        _ => return None,
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reduce a page to readable text: boilerplate elements removed, one line per
/// block element, whitespace collapsed.
pub fn clean_html(html: &str) -> String {
    let mut out = String::new();
    let mut open: Vec<String> = Vec::new();
    let mut stripped_depth = 0usize;

    for token in tokenize(html) {
        match token {
            Token::Open {
                tag, self_closing, ..
            } => {
                if BLOCK_ELEMENTS.contains(&tag.as_str()) {
                    out.push('\n');
                } else if tag == "td" || tag == "th" {
                    out.push(' ');
                }
                if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
                    continue;
                }
                if STRIPPED_ELEMENTS.contains(&tag.as_str()) {
                    stripped_depth += 1;
                }
                open.push(tag);
            }
            Token::Close { tag } => {
                if let Some(idx) = open.iter().rposition(|t| *t == tag) {
                    for closed in open.drain(idx..) {
                        if STRIPPED_ELEMENTS.contains(&closed.as_str()) {
                            stripped_depth = stripped_depth.saturating_sub(1);
                        }
                    }
                }
                if BLOCK_ELEMENTS.contains(&tag.as_str()) {
                    out.push('\n');
                }
            }
            Token::Text(text) => {
                if stripped_depth == 0 {
                    out.push_str(&decode_entities(text));
                }
            }
        }
    }

    out.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
struct Element {
    tag: String,
    attrs: Vec<(String, String)>,
    parent: Option<usize>,
    text_start: usize,
    text_end: usize,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| decode_entities(m.as_str()))
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

/// Element tree of a page, in document order.
#[derive(Debug, Clone)]
pub struct Document {
    elements: Vec<Element>,
    text: String,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        let mut elements: Vec<Element> = Vec::new();
        let mut text = String::new();
        let mut open: Vec<usize> = Vec::new();

        for token in tokenize(html) {
            match token {
                Token::Open {
                    tag,
                    attrs,
                    self_closing,
                } => {
                    let block = BLOCK_ELEMENTS.contains(&tag.as_str());
                    if block {
                        text.push(' ');
                    }
                    let void = self_closing || VOID_ELEMENTS.contains(&tag.as_str());
                    let index = elements.len();
                    elements.push(Element {
                        tag,
                        attrs: parse_attrs(attrs),
                        parent: open.last().copied(),
                        text_start: text.len(),
                        text_end: text.len(),
                    });
                    if !void {
                        open.push(index);
                    }
                }
                Token::Close { tag } => {
                    if let Some(pos) = open.iter().rposition(|&i| elements[i].tag == tag) {
                        for i in open.drain(pos..) {
                            elements[i].text_end = text.len();
                        }
                    }
                    if BLOCK_ELEMENTS.contains(&tag.as_str()) {
                        text.push(' ');
                    }
                }
                Token::Text(chunk) => {
                    let in_raw = open
                        .last()
                        .is_some_and(|&i| RAW_TEXT_ELEMENTS.contains(&elements[i].tag.as_str()));
                    if !in_raw {
                        text.push_str(&decode_entities(chunk));
                    }
                }
            }
        }

        for i in open {
            elements[i].text_end = text.len();
        }

        Self { elements, text }
    }

    /// Elements matching `selector`, in document order.
    pub fn select(&self, selector: &Selector) -> Vec<ElementRef<'_>> {
        (0..self.elements.len())
            .filter(|&i| selector.groups.iter().any(|chain| self.matches_chain(i, chain)))
            .map(|index| ElementRef { doc: self, index })
            .collect()
    }

    fn matches_chain(&self, index: usize, chain: &[(Combinator, Compound)]) -> bool {
        let Some(((combinator, last), rest)) = chain.split_last() else {
            return true;
        };
        let element = &self.elements[index];
        if !last.matches(element) {
            return false;
        }
        if rest.is_empty() {
            return true;
        }

        match combinator {
            Combinator::Child => element
                .parent
                .is_some_and(|parent| self.matches_chain(parent, rest)),
            Combinator::Descendant => {
                let mut ancestor = element.parent;
                while let Some(a) = ancestor {
                    if self.matches_chain(a, rest) {
                        return true;
                    }
                    ancestor = self.elements[a].parent;
                }
                false
            }
        }
    }
}

/// A matched element.
#[derive(Debug, Clone, Copy)]
pub struct ElementRef<'a> {
    doc: &'a Document,
    index: usize,
}

impl<'a> ElementRef<'a> {
    /// Text content with whitespace collapsed.
    pub fn text(&self) -> String {
        let el = &self.doc.elements[self.index];
        collapse_whitespace(&self.doc.text[el.text_start..el.text_end])
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.doc.elements[self.index].attr(&name.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unsupported selector syntax at '{0}'")]
    Unsupported(String),

    #[error("malformed selector: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Compound {
    fn matches(&self, element: &Element) -> bool {
        self.tag.as_ref().map_or(true, |t| *t == element.tag)
            && self
                .id
                .as_ref()
                .map_or(true, |id| element.attr("id") == Some(id.as_str()))
            && self.classes.iter().all(|c| element.has_class(c))
            && self.attrs.iter().all(|(name, value)| match value {
                Some(v) => element.attr(name) == Some(v.as_str()),
                None => element.attr(name).is_some(),
            })
    }
}

/// A parsed CSS selector.
///
/// Supports type, universal, `.class`, `#id`, `[attr]` and `[attr=value]`
/// selectors, compounds of these, descendant and child combinators, and
/// comma-separated groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    groups: Vec<Vec<(Combinator, Compound)>>,
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        SelectorParser {
            chars: input.chars().collect(),
            pos: 0,
        }
        .parse()
    }
}

struct SelectorParser {
    chars: Vec<char>,
    pos: usize,
}

impl SelectorParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn rest(&self) -> String {
        self.chars[self.pos.min(self.chars.len())..].iter().collect()
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse(mut self) -> Result<Selector, SelectorError> {
        let mut groups = Vec::new();
        let mut chain: Vec<(Combinator, Compound)> = Vec::new();
        let mut pending: Option<Combinator> = None;

        loop {
            if self.skip_whitespace() && !chain.is_empty() && pending.is_none() {
                pending = Some(Combinator::Descendant);
            }
            match self.peek() {
                None => break,
                Some(',') => {
                    if chain.is_empty() || pending == Some(Combinator::Child) {
                        return Err(SelectorError::Malformed("empty selector group".to_string()));
                    }
                    groups.push(std::mem::take(&mut chain));
                    pending = None;
                    self.pos += 1;
                }
                Some('>') => {
                    if chain.is_empty() || pending == Some(Combinator::Child) {
                        return Err(SelectorError::Malformed(format!(
                            "dangling '>' at '{}'",
                            self.rest()
                        )));
                    }
                    pending = Some(Combinator::Child);
                    self.pos += 1;
                }
                Some(_) => {
                    let compound = self.compound()?;
                    let combinator = pending.take().unwrap_or(Combinator::Descendant);
                    chain.push((combinator, compound));
                }
            }
        }

        if pending == Some(Combinator::Child) {
            return Err(SelectorError::Malformed("selector ends with '>'".to_string()));
        }
        if chain.is_empty() {
            return Err(if groups.is_empty() {
                SelectorError::Empty
            } else {
                SelectorError::Malformed("trailing ','".to_string())
            });
        }
        groups.push(chain);
        Ok(Selector { groups })
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let start = self.pos;
        let mut compound = Compound::default();

        loop {
            match self.peek() {
                Some('*') if self.pos == start => self.pos += 1,
                Some(c) if self.pos == start && (c.is_alphabetic() || c == '_') => {
                    compound.tag = Some(self.ident().to_ascii_lowercase());
                }
                Some('.') => {
                    self.pos += 1;
                    let class = self.ident();
                    if class.is_empty() {
                        return Err(SelectorError::Malformed(
                            "expected class name after '.'".to_string(),
                        ));
                    }
                    compound.classes.push(class);
                }
                Some('#') => {
                    self.pos += 1;
                    let id = self.ident();
                    if id.is_empty() {
                        return Err(SelectorError::Malformed(
                            "expected id after '#'".to_string(),
                        ));
                    }
                    compound.id = Some(id);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attrs.push(self.attribute()?);
                }
                Some(c) if c.is_whitespace() || c == ',' || c == '>' => break,
                None => break,
                Some(_) => return Err(SelectorError::Unsupported(self.rest())),
            }
        }

        if self.pos == start {
            return Err(SelectorError::Unsupported(self.rest()));
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<(String, Option<String>), SelectorError> {
        self.skip_whitespace();
        let name = self.ident().to_ascii_lowercase();
        if name.is_empty() {
            return Err(SelectorError::Malformed("expected attribute name".to_string()));
        }
        self.skip_whitespace();

        let value = match self.peek() {
            Some(']') => None,
            Some('=') => {
                self.pos += 1;
                self.skip_whitespace();
                let value = match self.peek() {
                    Some(quote @ ('"' | '\'')) => {
                        self.pos += 1;
                        let start = self.pos;
                        while self.peek().is_some_and(|c| c != quote) {
                            self.pos += 1;
                        }
                        if self.peek().is_none() {
                            return Err(SelectorError::Malformed("unterminated string".to_string()));
                        }
                        let value: String = self.chars[start..self.pos].iter().collect();
                        self.pos += 1;
                        value
                    }
                    _ => self.ident(),
                };
                self.skip_whitespace();
                Some(value)
            }
            _ => return Err(SelectorError::Unsupported(self.rest())),
        };

        if self.peek() != Some(']') {
            return Err(SelectorError::Malformed("expected ']'".to_string()));
        }
        self.pos += 1;
        Ok((name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Trending &amp; New</title>
  <style>.post { color: red; }</style>
  <script>var x = "<div class='post'>fake</div>";</script>
</head>
<body>
  <header><nav><a href="/">Home</a></nav></header>
  <main id="feed">
    <div class="post featured" data-score="42">
      <h2 class="title"><a href="/p/1">Cold plunges &mdash; worth it?</a></h2>
      <span class="author">alice</span>
    </div>
    <div class="post" data-score="17">
      <h2 class="title"><a href='/p/2'>Sleep tracking</a></h2>
      <span class="author">bob</span><br>
      <img src="/x.png" alt="chart">
    </div>
  </main>
  <!-- <div class="post">commented out</div> -->
  <footer>Copyright &copy; 2024</footer>
  <form><input name="q"></form>
</body>
</html>"#;

    fn select(html: &str, selector: &str) -> Vec<String> {
        let doc = Document::parse(html);
        let selector: Selector = selector.parse().unwrap();
        doc.select(&selector).iter().map(|e| e.text()).collect()
    }

    #[test]
    fn clean_html_strips_boilerplate() {
        let text = clean_html(PAGE);
        assert!(text.contains("Trending & New"));
        assert!(text.contains("Cold plunges — worth it?"));
        assert!(text.contains("Sleep tracking"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("fake"));
        assert!(!text.contains("Home"));
        assert!(!text.contains("Copyright"));
        assert!(!text.contains("commented out"));
        assert!(!text.lines().any(|l| l.trim().is_empty()));
    }

    #[test]
    fn clean_html_keeps_inline_text_together() {
        assert_eq!(clean_html("<p>Price: <b>$10</b> today</p>"), "Price: $10 today");
        assert_eq!(clean_html("<p>one</p><p>two</p>"), "one\ntwo");
    }

    #[test]
    fn decodes_numeric_entities() {
        assert_eq!(decode_entities("&#39;a&#x27; &lt;b&gt; &bogus;"), "'a' <b> &bogus;");
    }

    #[test]
    fn class_selector() {
        assert_eq!(
            select(PAGE, ".title"),
            vec!["Cold plunges — worth it?", "Sleep tracking"]
        );
    }

    #[test]
    fn compound_and_descendant_selectors() {
        assert_eq!(select(PAGE, "div.post.featured .author"), vec!["alice"]);
        assert_eq!(select(PAGE, "#feed span"), vec!["alice", "bob"]);
        assert_eq!(select(PAGE, "main > div > span"), vec!["alice", "bob"]);
        assert!(select(PAGE, "main > span").is_empty());
    }

    #[test]
    fn attribute_selectors() {
        assert_eq!(select(PAGE, "[data-score=\"17\"] .author"), vec!["bob"]);
        assert_eq!(select(PAGE, "div[data-score]").len(), 2);

        let doc = Document::parse(PAGE);
        let links = doc.select(&"h2 a".parse().unwrap());
        let hrefs: Vec<_> = links.iter().filter_map(|a| a.attr("href")).collect();
        assert_eq!(hrefs, vec!["/p/1", "/p/2"]);

        let images = doc.select(&"img".parse().unwrap());
        assert_eq!(images[0].attr("ALT"), Some("chart"));
    }

    #[test]
    fn selector_groups_keep_document_order() {
        assert_eq!(select(PAGE, ".author, title"), vec!["Trending & New", "alice", "bob"]);
    }

    #[test]
    fn script_content_is_not_markup() {
        assert_eq!(select(PAGE, ".post").len(), 2);
    }

    #[test]
    fn unclosed_elements_extend_to_end() {
        assert_eq!(select("<ul><li>a<li>b</ul>", "ul"), vec!["a b"]);
        assert_eq!(select("<div><p>open", "p"), vec!["open"]);
    }

    #[test]
    fn rejects_unsupported_selectors() {
        assert_eq!("".parse::<Selector>(), Err(SelectorError::Empty));
        assert!(matches!("a:hover".parse::<Selector>(), Err(SelectorError::Unsupported(_))));
        assert!(matches!("a + b".parse::<Selector>(), Err(SelectorError::Unsupported(_))));
        assert!(matches!("a >".parse::<Selector>(), Err(SelectorError::Malformed(_))));
        assert!(matches!("a,".parse::<Selector>(), Err(SelectorError::Malformed(_))));
        assert!(matches!("[x^=y]".parse::<Selector>(), Err(SelectorError::Unsupported(_))));
        assert!(matches!("[x=\"y]".parse::<Selector>(), Err(SelectorError::Malformed(_))));
    }
}
