//! Pull parser for WordPress eXtended RSS exports
//!
//! Advances through the document event by event and yields one [`Fragment`]
//! per `<item>` or `<wp:author>` element. Each fragment carries its verbatim
//! source text and a small element tree for field lookup, so memory is bounded
//! by the largest single fragment rather than the file.
//!
//! DOCTYPE declarations are skipped and never expanded; only the predefined
//! XML entities and character references are decoded.

use std::cell::RefCell;
use std::io::{self, BufRead, Read};
use std::rc::Rc;

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use super::error::RecordError;

const WXR_PREFIX: &str = "http://wordpress.org/export/";
const CONTENT_URI: &str = "http://purl.org/rss/1.0/modules/content/";
const DUBLIN_CORE_URI: &str = "http://purl.org/dc/elements/1.1/";

/// Namespace of an element, matched by URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XmlNamespace {
    /// No namespace (plain RSS elements)
    #[default]
    None,
    /// `wp:` WXR elements, any export version
    Wxr,
    /// `excerpt:` elements
    Excerpt,
    /// `content:` RSS content module
    Content,
    /// `dc:` Dublin Core
    DublinCore,
    Other,
}

impl XmlNamespace {
    pub fn from_uri(uri: &[u8]) -> Self {
        let uri = String::from_utf8_lossy(uri);
        let uri = uri.trim_end_matches('/');
        if uri == CONTENT_URI.trim_end_matches('/') {
            XmlNamespace::Content
        } else if uri == DUBLIN_CORE_URI.trim_end_matches('/') {
            XmlNamespace::DublinCore
        } else if uri.starts_with(WXR_PREFIX) {
            if uri.ends_with("/excerpt") {
                XmlNamespace::Excerpt
            } else {
                XmlNamespace::Wxr
            }
        } else {
            XmlNamespace::Other
        }
    }

    fn from_resolved(resolved: &ResolveResult<'_>) -> Self {
        match resolved {
            ResolveResult::Bound(ns) => Self::from_uri(ns.0),
            _ => XmlNamespace::None,
        }
    }
}

/// Element of a parsed fragment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub namespace: XmlNamespace,
    /// Local name without prefix
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated text and CDATA content, untrimmed
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    fn open(namespace: XmlNamespace, start: &BytesStart<'_>) -> Result<Self, String> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| format!("invalid attribute: {e}"))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| format!("invalid attribute value for {key}: {e}"))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            namespace,
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            text: String::new(),
            children: Vec::new(),
        })
    }

    fn is(&self, namespace: XmlNamespace, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }

    /// First child with the given name
    pub fn child(&self, namespace: XmlNamespace, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.is(namespace, name))
    }

    /// Every child with the given name, in document order
    pub fn children_named<'a>(
        &'a self,
        namespace: XmlNamespace,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.is(namespace, name))
    }

    /// Trimmed text of the first matching child; `None` when absent or blank
    pub fn child_text(&self, namespace: XmlNamespace, name: &str) -> Option<&str> {
        self.child(namespace, name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Which boundary element a fragment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// `<item>`: a post, page or attachment
    Item,
    /// `<wp:author>`
    Author,
}

impl FragmentKind {
    fn detect(namespace: XmlNamespace, local: &[u8]) -> Option<Self> {
        match (namespace, local) {
            (XmlNamespace::None, b"item") => Some(FragmentKind::Item),
            (XmlNamespace::Wxr, b"author") => Some(FragmentKind::Author),
            _ => None,
        }
    }

    pub fn element_name(&self) -> &'static str {
        match self {
            FragmentKind::Item => "item",
            FragmentKind::Author => "wp:author",
        }
    }
}

/// One boundary element and its parse outcome
#[derive(Debug, Clone)]
pub struct Fragment {
    pub kind: FragmentKind,
    /// Zero-based ordinal among all fragments of the document
    pub index: u64,
    /// Source text from the opening `<` of the start tag to the closing `>`
    pub raw: String,
    pub root: Result<Node, RecordError>,
}

#[derive(Debug, Default)]
struct Tape {
    recording: bool,
    bytes: Vec<u8>,
    consumed: u64,
}

impl Tape {
    fn start(&mut self) {
        self.recording = true;
        self.bytes.clear();
    }

    fn finish(&mut self) -> Vec<u8> {
        self.recording = false;
        std::mem::take(&mut self.bytes)
    }
}

/// BufRead adapter that counts consumed bytes and records them on demand
struct TapeReader<R> {
    inner: R,
    tape: Rc<RefCell<Tape>>,
}

impl<R: BufRead> Read for TapeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut tape = self.tape.borrow_mut();
        tape.consumed += n as u64;
        if tape.recording {
            tape.bytes.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

impl<R: BufRead> BufRead for TapeReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        let mut tape = self.tape.borrow_mut();
        tape.consumed += amt as u64;
        if tape.recording && amt > 0 {
            // Data handed out by fill_buf is still buffered, so this does no IO
            if let Ok(buffered) = self.inner.fill_buf() {
                let n = amt.min(buffered.len());
                tape.bytes.extend_from_slice(&buffered[..n]);
            }
        }
        drop(tape);
        self.inner.consume(amt);
    }
}

/// Opening tag of a boundary element, read but not yet captured
struct PendingStart {
    kind: FragmentKind,
    prefix: String,
    root: Result<Node, String>,
}

enum Step {
    Boundary(PendingStart),
    /// Self-closing boundary element; nothing left to capture
    EmptyBoundary(PendingStart),
    Skip,
    Eof,
    Error(String),
}

/// Streaming fragment reader over a WXR document
pub struct WxrReader<R: BufRead> {
    reader: NsReader<TapeReader<R>>,
    tape: Rc<RefCell<Tape>>,
    buf: Vec<u8>,
    pending: Option<PendingStart>,
    next_index: u64,
    last_error_at: Option<u64>,
    finished: bool,
}

impl<R: BufRead> WxrReader<R> {
    pub fn new(inner: R) -> Self {
        let tape = Rc::new(RefCell::new(Tape::default()));
        let mut reader = NsReader::from_reader(TapeReader {
            inner,
            tape: Rc::clone(&tape),
        });
        // End tags are matched against the fragment tree instead, so a
        // mismatch inside one item cannot poison the rest of the document
        reader.config_mut().check_end_names = false;
        reader.config_mut().trim_text(false);

        Self {
            reader,
            tape,
            buf: Vec::new(),
            pending: None,
            next_index: 0,
            last_error_at: None,
            finished: false,
        }
    }

    /// Bytes of the source consumed so far
    pub fn bytes_consumed(&self) -> u64 {
        self.tape.borrow().consumed
    }

    /// True when the same position failed twice, meaning the reader is stuck
    fn stalled(&mut self) -> bool {
        let position = self.bytes_consumed();
        if self.last_error_at == Some(position) {
            return true;
        }
        self.last_error_at = Some(position);
        false
    }

    /// Read the next fragment
    ///
    /// An `Err` is a read failure between fragments; the reader has already
    /// moved past it and the stream may continue.
    pub fn next_fragment(&mut self) -> Option<Result<Fragment, RecordError>> {
        if let Some(pending) = self.pending.take() {
            return Some(Ok(self.capture(pending)));
        }

        while !self.finished {
            self.buf.clear();
            let step = match self.reader.read_resolved_event_into(&mut self.buf) {
                Ok((ns, Event::Start(start))) => {
                    let namespace = XmlNamespace::from_resolved(&ns);
                    match FragmentKind::detect(namespace, start.local_name().as_ref()) {
                        Some(kind) => Step::Boundary(PendingStart {
                            kind,
                            prefix: format!("<{}>", String::from_utf8_lossy(&start)),
                            root: Node::open(namespace, &start),
                        }),
                        None => Step::Skip,
                    }
                }
                Ok((ns, Event::Empty(start))) => {
                    let namespace = XmlNamespace::from_resolved(&ns);
                    match FragmentKind::detect(namespace, start.local_name().as_ref()) {
                        Some(kind) => Step::EmptyBoundary(PendingStart {
                            kind,
                            prefix: format!("<{}/>", String::from_utf8_lossy(&start)),
                            root: Node::open(namespace, &start),
                        }),
                        None => Step::Skip,
                    }
                }
                Ok((_, Event::DocType(doctype))) => {
                    tracing::warn!(
                        doctype = %String::from_utf8_lossy(&doctype),
                        "DOCTYPE declaration ignored; entities are not expanded"
                    );
                    Step::Skip
                }
                Ok((_, Event::Eof)) => Step::Eof,
                Ok(_) => Step::Skip,
                Err(e) => Step::Error(e.to_string()),
            };

            match step {
                Step::Boundary(pending) => return Some(Ok(self.capture(pending))),
                Step::EmptyBoundary(pending) => return Some(Ok(self.complete_empty(pending))),
                Step::Skip => {}
                Step::Eof => self.finished = true,
                Step::Error(error) => {
                    let message =
                        format!("XML error at byte {}: {}", self.reader.error_position(), error);
                    if self.stalled() {
                        tracing::warn!(error = %message, "Reader made no progress, stopping");
                        self.finished = true;
                    }
                    return Some(Err(RecordError::Read(message)));
                }
            }
        }
        None
    }

    /// Fragment of a self-closing boundary element such as `<item/>`
    fn complete_empty(&mut self, start: PendingStart) -> Fragment {
        let PendingStart { kind, prefix, root } = start;
        let index = self.next_index;
        self.next_index += 1;
        Fragment {
            kind,
            index,
            raw: prefix,
            root: root.map_err(RecordError::Parse),
        }
    }

    /// Read the rest of a boundary element whose start tag was just consumed
    fn capture(&mut self, start: PendingStart) -> Fragment {
        let PendingStart { kind, prefix, root } = start;
        let index = self.next_index;
        self.next_index += 1;

        let mut failure: Option<String> = None;
        let mut stack = vec![root.unwrap_or_else(|e| {
            failure = Some(e);
            Node::default()
        })];
        let mut completed: Option<Node> = None;
        self.tape.borrow_mut().start();

        while completed.is_none() {
            self.buf.clear();
            let read_error = match self.reader.read_resolved_event_into(&mut self.buf) {
                Ok((ns, Event::Start(start))) => {
                    let namespace = XmlNamespace::from_resolved(&ns);
                    if let Some(next_kind) =
                        FragmentKind::detect(namespace, start.local_name().as_ref())
                    {
                        let next_prefix = format!("<{}>", String::from_utf8_lossy(&start));
                        self.pending = Some(PendingStart {
                            kind: next_kind,
                            root: Node::open(namespace, &start),
                            prefix: next_prefix,
                        });
                        failure.get_or_insert_with(|| {
                            format!("unterminated <{}> element", kind.element_name())
                        });
                        break;
                    }
                    match Node::open(namespace, &start) {
                        Ok(node) => stack.push(node),
                        Err(e) => {
                            failure.get_or_insert(e);
                            stack.push(Node::default());
                        }
                    }
                    None
                }
                Ok((ns, Event::Empty(start))) => {
                    let namespace = XmlNamespace::from_resolved(&ns);
                    match Node::open(namespace, &start) {
                        Ok(node) => attach(&mut stack, node),
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                    None
                }
                Ok((ns, Event::End(end))) => {
                    let namespace = XmlNamespace::from_resolved(&ns);
                    let name = String::from_utf8_lossy(end.local_name().as_ref()).into_owned();
                    match stack.iter().rposition(|n| n.is(namespace, &name)) {
                        Some(position) => {
                            if position + 1 != stack.len() {
                                failure.get_or_insert_with(|| {
                                    format!("end tag </{name}> closes unclosed elements")
                                });
                            }
                            while stack.len() > position + 1 {
                                if let Some(node) = stack.pop() {
                                    attach(&mut stack, node);
                                }
                            }
                            if let Some(node) = stack.pop() {
                                if stack.is_empty() {
                                    completed = Some(node);
                                } else {
                                    attach(&mut stack, node);
                                }
                            }
                        }
                        None if is_container(namespace, &name) => {
                            failure.get_or_insert_with(|| {
                                format!("unterminated <{}> element", kind.element_name())
                            });
                            break;
                        }
                        None => {
                            failure.get_or_insert_with(|| format!("unexpected end tag </{name}>"));
                        }
                    }
                    None
                }
                Ok((_, Event::Text(text))) => {
                    match text.unescape() {
                        Ok(value) => push_text(&mut stack, &value),
                        Err(e) => {
                            failure.get_or_insert_with(|| format!("invalid text content: {e}"));
                        }
                    }
                    None
                }
                Ok((_, Event::CData(cdata))) => {
                    push_text(&mut stack, &String::from_utf8_lossy(&cdata));
                    None
                }
                Ok((_, Event::Eof)) => {
                    failure.get_or_insert_with(|| {
                        format!(
                            "unexpected end of input inside <{}>",
                            kind.element_name()
                        )
                    });
                    self.finished = true;
                    break;
                }
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };

            if let Some(error) = read_error {
                let position = self.reader.error_position();
                failure.get_or_insert_with(|| format!("XML error at byte {position}: {error}"));
                if self.stalled() {
                    self.finished = true;
                    break;
                }
            }
        }

        let mut body = self.tape.borrow_mut().finish();
        if let Some(pending) = &self.pending {
            // The next boundary's start tag was recorded with this fragment
            if body.ends_with(pending.prefix.as_bytes()) {
                body.truncate(body.len() - pending.prefix.len());
            }
        }
        let raw = format!("{}{}", prefix, String::from_utf8_lossy(&body));

        let root = match (failure, completed) {
            (None, Some(node)) => Ok(node),
            (Some(message), _) => Err(RecordError::Parse(message)),
            (None, None) => Err(RecordError::Parse(format!(
                "incomplete <{}> element",
                kind.element_name()
            ))),
        };

        Fragment {
            kind,
            index,
            raw,
            root,
        }
    }
}

impl<R: BufRead> Iterator for WxrReader<R> {
    type Item = Result<Fragment, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_fragment()
    }
}

/// Ancestors of every boundary element; closing one means the boundary
/// element itself was never closed
fn is_container(namespace: XmlNamespace, name: &str) -> bool {
    namespace == XmlNamespace::None && matches!(name, "channel" | "rss")
}

fn attach(stack: &mut [Node], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn push_text(stack: &mut [Node], text: &str) {
    if let Some(top) = stack.last_mut() {
        top.text.push_str(text);
    }
}
