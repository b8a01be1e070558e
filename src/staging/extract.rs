//! Map parsed WXR fragments onto destination table records

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use super::config::WxrOptions;
use super::error::RecordError;
use super::sanitize::{
    normalize_date, normalize_email, normalize_url, plain_text, short_text, strip_markup,
};
use super::wxr::{Node, XmlNamespace};
use crate::sink::{ColumnDef, ColumnType, Record, Value};

pub const POSTS: &str = "posts";
pub const POSTMETA: &str = "postmeta";
pub const COMMENTS: &str = "comments";
pub const COMMENTMETA: &str = "commentmeta";
pub const TERMS: &str = "terms";
pub const TERM_RELATIONSHIPS: &str = "term_relationships";
pub const USERS: &str = "users";

static URL_POST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[?&]p=|page_id=)(\d+)").unwrap());

/// Destination table of the WXR importer
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    /// Rows of a primary table are counted as records
    pub primary: bool,
}

fn varchar(length: usize) -> ColumnType {
    ColumnType::String { length }
}

/// Tables required by the enabled extractions, primary tables first
pub fn wxr_tables(options: &WxrOptions) -> Vec<TableSchema> {
    let mut tables = vec![TableSchema {
        name: POSTS,
        primary: true,
        columns: vec![
            ColumnDef::new("id", ColumnType::BigInteger),
            ColumnDef::new("title", ColumnType::STRING),
            ColumnDef::new("slug", varchar(200)),
            ColumnDef::new("link", ColumnType::Text),
            ColumnDef::new("guid", ColumnType::Text),
            ColumnDef::new("author", varchar(60)),
            ColumnDef::new("content", ColumnType::LongText),
            ColumnDef::new("excerpt", ColumnType::Text),
            ColumnDef::new("status", varchar(20)),
            ColumnDef::new("post_type", varchar(20)),
            ColumnDef::new("parent_id", ColumnType::BigInteger),
            ColumnDef::new("menu_order", ColumnType::Integer),
            ColumnDef::new("comment_status", varchar(20)),
            ColumnDef::new("published_at", ColumnType::DateTime),
            ColumnDef::new("post_date", ColumnType::DateTime),
            ColumnDef::new("post_date_gmt", ColumnType::DateTime),
        ],
    }];

    if options.authors {
        tables.push(TableSchema {
            name: USERS,
            primary: true,
            columns: vec![
                ColumnDef::new("id", ColumnType::BigInteger),
                ColumnDef::new("login", varchar(60)),
                ColumnDef::new("email", varchar(100)),
                ColumnDef::new("display_name", varchar(250)),
                ColumnDef::new("first_name", ColumnType::STRING),
                ColumnDef::new("last_name", ColumnType::STRING),
            ],
        });
    }
    if options.postmeta {
        tables.push(TableSchema {
            name: POSTMETA,
            primary: false,
            columns: meta_columns("post_id"),
        });
    }
    if options.comments {
        tables.push(TableSchema {
            name: COMMENTS,
            primary: false,
            columns: vec![
                ColumnDef::new("id", ColumnType::BigInteger),
                ColumnDef::new("post_id", ColumnType::BigInteger),
                ColumnDef::new("author", varchar(245)),
                ColumnDef::new("author_email", varchar(100)),
                ColumnDef::new("author_url", varchar(200)),
                ColumnDef::new("author_ip", varchar(100)),
                ColumnDef::new("comment_date", ColumnType::DateTime),
                ColumnDef::new("comment_date_gmt", ColumnType::DateTime),
                ColumnDef::new("content", ColumnType::Text),
                ColumnDef::new("approved", varchar(20)),
                ColumnDef::new("comment_type", varchar(20)),
                ColumnDef::new("parent_id", ColumnType::BigInteger),
                ColumnDef::new("user_id", ColumnType::BigInteger),
            ],
        });
        tables.push(TableSchema {
            name: COMMENTMETA,
            primary: false,
            columns: meta_columns("comment_id"),
        });
    }
    if options.terms {
        tables.push(TableSchema {
            name: TERMS,
            primary: false,
            columns: vec![
                ColumnDef::new("id", ColumnType::BigInteger),
                ColumnDef::new("taxonomy", varchar(32)),
                ColumnDef::new("slug", varchar(200)),
                ColumnDef::new("name", varchar(200)),
            ],
        });
        tables.push(TableSchema {
            name: TERM_RELATIONSHIPS,
            primary: false,
            columns: vec![
                ColumnDef::new("post_id", ColumnType::BigInteger),
                ColumnDef::new("term_id", ColumnType::BigInteger),
                ColumnDef::new("taxonomy", varchar(32)),
            ],
        });
    }
    tables
}

fn meta_columns(owner: &str) -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(owner, ColumnType::BigInteger),
        ColumnDef::new("meta_key", ColumnType::STRING),
        ColumnDef::new("meta_value", ColumnType::LongText),
    ]
}

/// Per-job extraction state
///
/// Holds the ids of terms already emitted by this import, so shared terms are
/// written once per job while every referencing post still gets its
/// relationship row.
#[derive(Debug, Default)]
pub struct ExtractionContext {
    seen_terms: HashSet<i64>,
}

impl ExtractionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct terms emitted so far
    pub fn terms_seen(&self) -> usize {
        self.seen_terms.len()
    }
}

/// A record routed to one destination table
#[derive(Debug, Clone, PartialEq)]
pub struct TableRecord {
    pub table: &'static str,
    pub record: Record,
}

impl TableRecord {
    fn new(table: &'static str, record: Record) -> Self {
        Self { table, record }
    }
}

/// All records produced by one fragment
#[derive(Debug, Clone)]
pub struct Extracted {
    pub primary: TableRecord,
    pub dependents: Vec<TableRecord>,
}

/// Integer id from the leading bits of a SHA-256 digest
pub fn hashed_id(input: &[u8], bits: u32) -> i64 {
    let digest = Sha256::digest(input);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let mask = (1u64 << bits) - 1;
    (u64::from_be_bytes(prefix) & mask) as i64
}

/// Post id: explicit field, then an id embedded in guid or link, then a hash
/// of title and publication date
pub fn derive_post_id(item: &Node) -> i64 {
    if let Some(id) = item
        .child_text(XmlNamespace::Wxr, "post_id")
        .and_then(|t| t.parse::<i64>().ok())
    {
        return id;
    }

    for field in ["guid", "link"] {
        if let Some(id) = item
            .child_text(XmlNamespace::None, field)
            .and_then(|t| URL_POST_ID.captures(t))
            .and_then(|caps| caps[1].parse::<i64>().ok())
        {
            return id;
        }
    }

    let title = item.child_text(XmlNamespace::None, "title").unwrap_or("");
    let published = item.child_text(XmlNamespace::None, "pubDate").unwrap_or("");
    hashed_id(format!("{title}|{published}").as_bytes(), 31)
}

/// Term id from taxonomy, slug and name
pub fn term_id(taxonomy: &str, slug: &str, name: &str) -> i64 {
    hashed_id(format!("{taxonomy}\0{slug}\0{name}").as_bytes(), 63)
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<i64>().ok())
}

fn wp<'a>(node: &'a Node, name: &str) -> Option<&'a str> {
    node.child_text(XmlNamespace::Wxr, name)
}

fn short(node: &Node, name: &str, max_chars: usize) -> Value {
    wp(node, name).and_then(|v| short_text(v, max_chars)).into()
}

fn date(node: &Node, name: &str) -> Value {
    wp(node, name).and_then(normalize_date).into()
}

/// Extract a post and its dependent collections from an `<item>`
pub fn extract_item(
    item: &Node,
    options: &WxrOptions,
    context: &mut ExtractionContext,
) -> Result<Extracted, RecordError> {
    if item.name != "item" {
        return Err(RecordError::Extract(format!(
            "expected <item>, found <{}>",
            item.name
        )));
    }

    let id = derive_post_id(item);
    let menu_order = parse_int(wp(item, "menu_order")).filter(|n| i32::try_from(*n).is_ok());

    let post = Record::with_capacity(16)
        .with("id", id)
        .with(
            "title",
            item.child_text(XmlNamespace::None, "title")
                .and_then(|t| short_text(t, 255)),
        )
        .with("slug", short(item, "post_name", 200))
        .with(
            "link",
            item.child_text(XmlNamespace::None, "link")
                .and_then(normalize_url),
        )
        .with(
            "guid",
            item.child_text(XmlNamespace::None, "guid")
                .map(plain_text)
                .filter(|g| !g.is_empty()),
        )
        .with(
            "author",
            item.child_text(XmlNamespace::DublinCore, "creator")
                .and_then(|a| short_text(a, 60)),
        )
        .with(
            "content",
            item.child_text(XmlNamespace::Content, "encoded")
                .map(|c| strip_markup(c, options.content_safelist.as_slice())),
        )
        .with(
            "excerpt",
            item.child_text(XmlNamespace::Excerpt, "encoded")
                .map(|c| strip_markup(c, options.content_safelist.as_slice())),
        )
        .with("status", short(item, "status", 20))
        .with("post_type", short(item, "post_type", 20))
        .with("parent_id", parse_int(wp(item, "post_parent")).filter(|p| *p > 0))
        .with("menu_order", menu_order)
        .with("comment_status", short(item, "comment_status", 20))
        .with(
            "published_at",
            item.child_text(XmlNamespace::None, "pubDate")
                .and_then(normalize_date),
        )
        .with("post_date", date(item, "post_date"))
        .with("post_date_gmt", date(item, "post_date_gmt"));

    let mut dependents = Vec::new();

    if options.postmeta {
        for meta in item.children_named(XmlNamespace::Wxr, "postmeta") {
            if let Some(record) = meta_record("post_id", id, meta) {
                dependents.push(TableRecord::new(POSTMETA, record));
            }
        }
    }

    if options.comments {
        for comment in item.children_named(XmlNamespace::Wxr, "comment") {
            extract_comment(id, comment, &options.content_safelist, &mut dependents);
        }
    }

    if options.terms {
        extract_terms(id, item, context, &mut dependents);
    }

    Ok(Extracted {
        primary: TableRecord::new(POSTS, post),
        dependents,
    })
}

fn meta_record(owner: &str, owner_id: i64, meta: &Node) -> Option<Record> {
    let key = wp(meta, "meta_key").and_then(|k| short_text(k, 255))?;
    let value = meta
        .child(XmlNamespace::Wxr, "meta_value")
        .map(|v| v.text.trim().to_string());
    Some(
        Record::with_capacity(3)
            .with(owner, owner_id)
            .with("meta_key", key)
            .with("meta_value", value),
    )
}

fn extract_comment(
    post_id: i64,
    comment: &Node,
    safelist: &[String],
    out: &mut Vec<TableRecord>,
) {
    let author = wp(comment, "comment_author").unwrap_or("");
    let when = wp(comment, "comment_date").unwrap_or("");
    let id = parse_int(wp(comment, "comment_id"))
        .unwrap_or_else(|| hashed_id(format!("{post_id}|{author}|{when}").as_bytes(), 31));

    let record = Record::with_capacity(13)
        .with("id", id)
        .with("post_id", post_id)
        .with("author", short(comment, "comment_author", 245))
        .with(
            "author_email",
            wp(comment, "comment_author_email").and_then(normalize_email),
        )
        .with(
            "author_url",
            wp(comment, "comment_author_url")
                .and_then(normalize_url)
                .filter(|u| u.chars().count() <= 200),
        )
        .with("author_ip", short(comment, "comment_author_IP", 100))
        .with("comment_date", date(comment, "comment_date"))
        .with("comment_date_gmt", date(comment, "comment_date_gmt"))
        .with(
            "content",
            wp(comment, "comment_content").map(|c| strip_markup(c, safelist)),
        )
        .with("approved", short(comment, "comment_approved", 20))
        .with("comment_type", short(comment, "comment_type", 20))
        .with(
            "parent_id",
            parse_int(wp(comment, "comment_parent")).filter(|p| *p > 0),
        )
        .with("user_id", parse_int(wp(comment, "comment_user_id")).filter(|u| *u > 0));
    out.push(TableRecord::new(COMMENTS, record));

    for meta in comment.children_named(XmlNamespace::Wxr, "commentmeta") {
        if let Some(record) = meta_record("comment_id", id, meta) {
            out.push(TableRecord::new(COMMENTMETA, record));
        }
    }
}

fn extract_terms(
    post_id: i64,
    item: &Node,
    context: &mut ExtractionContext,
    out: &mut Vec<TableRecord>,
) {
    let mut linked = HashSet::new();
    for category in item.children_named(XmlNamespace::None, "category") {
        let taxonomy = category.attribute("domain").unwrap_or("category");
        let name = plain_text(category.text.trim());
        let slug = category
            .attribute("nicename")
            .map(plain_text)
            .unwrap_or_default();
        if name.is_empty() && slug.is_empty() {
            tracing::debug!(post_id, "Skipping category without name or slug");
            continue;
        }

        let id = term_id(taxonomy, &slug, &name);
        if context.seen_terms.insert(id) {
            out.push(TableRecord::new(
                TERMS,
                Record::with_capacity(4)
                    .with("id", id)
                    .with("taxonomy", short_text(taxonomy, 32))
                    .with("slug", short_text(&slug, 200))
                    .with("name", short_text(&name, 200)),
            ));
        }
        if linked.insert(id) {
            out.push(TableRecord::new(
                TERM_RELATIONSHIPS,
                Record::with_capacity(3)
                    .with("post_id", post_id)
                    .with("term_id", id)
                    .with("taxonomy", short_text(taxonomy, 32)),
            ));
        }
    }
}

/// Extract a user from a `<wp:author>` element
pub fn extract_author(author: &Node) -> Result<Extracted, RecordError> {
    let login = wp(author, "author_login").and_then(|l| short_text(l, 60));
    let explicit_id = parse_int(wp(author, "author_id"));

    let id = match (explicit_id, &login) {
        (Some(id), _) => id,
        (None, Some(login)) => hashed_id(login.as_bytes(), 31),
        (None, None) => {
            return Err(RecordError::Extract(
                "author has neither an id nor a login".to_string(),
            ));
        }
    };

    let record = Record::with_capacity(6)
        .with("id", id)
        .with("login", login)
        .with("email", wp(author, "author_email").and_then(normalize_email))
        .with("display_name", short(author, "author_display_name", 250))
        .with("first_name", short(author, "author_first_name", 255))
        .with("last_name", short(author, "author_last_name", 255));

    Ok(Extracted {
        primary: TableRecord::new(USERS, record),
        dependents: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::wxr::{FragmentKind, WxrReader};

    fn parse(body: &str) -> Node {
        let xml = format!(
            r#"<rss xmlns:wp="http://wordpress.org/export/1.2/" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:excerpt="http://wordpress.org/export/1.2/excerpt/"><channel>{body}</channel></rss>"#
        );
        let fragment = WxrReader::new(xml.as_bytes()).next().unwrap().unwrap();
        fragment.root.unwrap()
    }

    #[test]
    fn test_post_id_from_explicit_field() {
        let item = parse("<item><wp:post_id>12</wp:post_id><guid>http://x.test/?p=99</guid></item>");
        assert_eq!(derive_post_id(&item), 12);
    }

    #[test]
    fn test_post_id_from_url() {
        let item = parse("<item><title>A</title><guid isPermaLink=\"false\">http://x.test/?p=42</guid></item>");
        assert_eq!(derive_post_id(&item), 42);

        let page = parse("<item><link>http://x.test/index.php?page_id=8</link></item>");
        assert_eq!(derive_post_id(&page), 8);
    }

    #[test]
    fn test_post_id_hash_is_stable() {
        let a = parse("<item><title>Hello</title><pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate></item>");
        let b = parse("<item><title>Hello</title><pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate></item>");
        let id = derive_post_id(&a);
        assert_eq!(id, derive_post_id(&b));
        assert!((0..=i32::MAX as i64).contains(&id));
    }

    #[test]
    fn test_extract_item_routes_dependents() {
        let item = parse(
            r#"<item>
                <title>Post &lt;b&gt;one&lt;/b&gt;</title>
                <dc:creator><![CDATA[admin]]></dc:creator>
                <content:encoded><![CDATA[<p onclick="x()">Body</p><script>bad()</script>]]></content:encoded>
                <wp:post_id>5</wp:post_id>
                <wp:post_date>0000-00-00 00:00:00</wp:post_date>
                <wp:status>publish</wp:status>
                <category domain="category" nicename="news"><![CDATA[News]]></category>
                <category domain="post_tag" nicename="rust"><![CDATA[Rust]]></category>
                <wp:postmeta><wp:meta_key>_edit_lock</wp:meta_key><wp:meta_value>1</wp:meta_value></wp:postmeta>
                <wp:comment>
                    <wp:comment_id>30</wp:comment_id>
                    <wp:comment_author_email>Bad Email</wp:comment_author_email>
                    <wp:comment_content>Nice</wp:comment_content>
                    <wp:commentmeta><wp:meta_key>akismet</wp:meta_key><wp:meta_value>ok</wp:meta_value></wp:commentmeta>
                </wp:comment>
            </item>"#,
        );

        let mut context = ExtractionContext::new();
        let extracted = extract_item(&item, &WxrOptions::default(), &mut context).unwrap();

        let post = &extracted.primary.record;
        assert_eq!(extracted.primary.table, POSTS);
        assert_eq!(post.get("id"), Some(&Value::Integer(5)));
        assert_eq!(post.get("title"), Some(&Value::Text("Post one".into())));
        assert_eq!(post.get("content"), Some(&Value::Text("<p>Body</p>".into())));
        assert_eq!(post.get("post_date"), Some(&Value::Null));

        let tables: Vec<&str> = extracted.dependents.iter().map(|d| d.table).collect();
        assert_eq!(
            tables,
            vec![
                POSTMETA,
                COMMENTS,
                COMMENTMETA,
                TERMS,
                TERM_RELATIONSHIPS,
                TERMS,
                TERM_RELATIONSHIPS
            ]
        );
        let comment = &extracted.dependents[1].record;
        assert_eq!(comment.get("author_email"), Some(&Value::Null));
        assert_eq!(context.terms_seen(), 2);
    }

    #[test]
    fn test_shared_terms_written_once_per_context() {
        let first = parse(r#"<item><wp:post_id>1</wp:post_id><category domain="category" nicename="news">News</category></item>"#);
        let second = parse(r#"<item><wp:post_id>2</wp:post_id><category domain="category" nicename="news">News</category></item>"#);

        let options = WxrOptions::default();
        let mut context = ExtractionContext::new();
        let a = extract_item(&first, &options, &mut context).unwrap();
        let b = extract_item(&second, &options, &mut context).unwrap();

        let count = |e: &Extracted, table: &str| e.dependents.iter().filter(|d| d.table == table).count();
        assert_eq!(count(&a, TERMS), 1);
        assert_eq!(count(&b, TERMS), 0);
        assert_eq!(count(&b, TERM_RELATIONSHIPS), 1);

        let mut fresh = ExtractionContext::new();
        let c = extract_item(&second, &options, &mut fresh).unwrap();
        assert_eq!(count(&c, TERMS), 1);
    }

    #[test]
    fn test_comment_content_uses_configured_safelist() {
        let item = parse(
            r#"<item><wp:post_id>1</wp:post_id><wp:comment><wp:comment_id>2</wp:comment_id><wp:comment_content><![CDATA[<p>See <code>x</code> <u>now</u></p>]]></wp:comment_content></wp:comment></item>"#,
        );
        let comment_content = |options: &WxrOptions| {
            let extracted = extract_item(&item, options, &mut ExtractionContext::new()).unwrap();
            extracted.dependents[0].record.get("content").cloned()
        };

        assert_eq!(
            comment_content(&WxrOptions::default()),
            Some(Value::Text("<p>See <code>x</code> now</p>".into()))
        );

        let options = WxrOptions {
            content_safelist: vec!["u".to_string()],
            ..WxrOptions::default()
        };
        assert_eq!(
            comment_content(&options),
            Some(Value::Text("See x <u>now</u>".into()))
        );
    }

    #[test]
    fn test_disabled_extractions() {
        let item = parse("<item><wp:post_id>1</wp:post_id><wp:postmeta><wp:meta_key>k</wp:meta_key></wp:postmeta><category nicename=\"a\">A</category></item>");
        let options = WxrOptions {
            postmeta: false,
            terms: false,
            ..WxrOptions::default()
        };
        let extracted = extract_item(&item, &options, &mut ExtractionContext::new()).unwrap();
        assert!(extracted.dependents.is_empty());

        let names: Vec<&str> = wxr_tables(&options).iter().map(|t| t.name).collect();
        assert_eq!(names, vec![POSTS, USERS, COMMENTS, COMMENTMETA]);
    }

    #[test]
    fn test_extract_author() {
        let xml = r#"<rss xmlns:wp="http://wordpress.org/export/1.2/"><channel><wp:author><wp:author_id>3</wp:author_id><wp:author_login>Editor</wp:author_login><wp:author_email>ED@x.test</wp:author_email></wp:author></channel></rss>"#;
        let fragment = WxrReader::new(xml.as_bytes()).next().unwrap().unwrap();
        assert_eq!(fragment.kind, FragmentKind::Author);

        let extracted = extract_author(fragment.root.as_ref().unwrap()).unwrap();
        let user = &extracted.primary.record;
        assert_eq!(extracted.primary.table, USERS);
        assert_eq!(user.get("id"), Some(&Value::Integer(3)));
        assert_eq!(user.get("email"), Some(&Value::Text("ed@x.test".into())));
    }

    #[test]
    fn test_author_without_identity_fails() {
        let xml = r#"<rss xmlns:wp="http://wordpress.org/export/1.2/"><channel><wp:author><wp:author_email>a@x.test</wp:author_email></wp:author></channel></rss>"#;
        let fragment = WxrReader::new(xml.as_bytes()).next().unwrap().unwrap();
        let err = extract_author(fragment.root.as_ref().unwrap()).unwrap_err();
        assert!(matches!(err, RecordError::Extract(_)));
    }
}
