//! Query language over track tags.
//!
//! ```text
//! word          keyword, substring of any search field
//! tag=word      substring of any value of tag
//! tag==word     some value equals word (__null__ means the tag is absent)
//! tag>n, tag<n  numeric comparison
//! tag~re        regular expression search
//! !X  X | Y  (X Y)  "quoted span"  \escape
//! ```
//!
//! Precedence from lowest: `|`, implicit conjunction, `!`, parentheses.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;

use common::tags::{is_internal, parse_number, NULL_VALUE};
use common::{fold, SortOptions, Track};
use regex::{Regex, RegexBuilder};

const NUMERIC_EPSILON: f64 = 1e-4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOptions {
    /// Tags searched by bare keywords.
    pub search_fields: Vec<String>,
    pub case_sensitive: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            search_fields: ["title", "artist", "album"]
                .iter()
                .map(|tag| tag.to_string())
                .collect(),
            case_sensitive: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at offset {offset}")]
pub struct QueryError {
    /// Byte offset of the offending token in the query text.
    pub offset: usize,
    pub kind: QueryErrorKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryErrorKind {
    UnbalancedParen,
    EmptyGroup,
    DanglingOperator(char),
    UnterminatedQuote,
    EmptyTag,
    InvalidNumber(String),
    InvalidRegex(String),
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::UnbalancedParen => write!(f, "unbalanced parenthesis"),
            QueryErrorKind::EmptyGroup => write!(f, "empty group"),
            QueryErrorKind::DanglingOperator(op) => write!(f, "operator '{op}' has no operand"),
            QueryErrorKind::UnterminatedQuote => write!(f, "unterminated quote"),
            QueryErrorKind::EmptyTag => write!(f, "missing tag name"),
            QueryErrorKind::InvalidNumber(value) => write!(f, "not a number: {value:?}"),
            QueryErrorKind::InvalidRegex(reason) => write!(f, "invalid regex: {reason}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Contains,
    Exact,
    Greater,
    Less,
    Regex,
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Word {
        field: Option<(String, Op)>,
        value: String,
    },
    Open,
    Close,
    Pipe,
    Bang,
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut word = WordBuilder::default();
    let mut quote_start: Option<usize> = None;

    while let Some((offset, ch)) = chars.next() {
        if quote_start.is_some() {
            match ch {
                '"' => quote_start = None,
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        word.push(escaped);
                    }
                }
                _ => word.push(ch),
            }
            continue;
        }
        match ch {
            '"' => {
                word.start(offset);
                quote_start = Some(offset);
            }
            '\\' => {
                word.start(offset);
                if let Some((_, escaped)) = chars.next() {
                    word.push(escaped);
                }
            }
            c if c.is_whitespace() => word.finish(&mut tokens),
            '(' | ')' | '|' => {
                word.finish(&mut tokens);
                let kind = match ch {
                    '(' => TokenKind::Open,
                    ')' => TokenKind::Close,
                    _ => TokenKind::Pipe,
                };
                tokens.push(Token { kind, offset });
            }
            '!' if word.is_empty() => tokens.push(Token {
                kind: TokenKind::Bang,
                offset,
            }),
            '=' | '>' | '<' | '~' if !word.has_op() => {
                word.start(offset);
                let op = match ch {
                    '=' if matches!(chars.peek(), Some((_, '='))) => {
                        chars.next();
                        Op::Exact
                    }
                    '=' => Op::Contains,
                    '>' => Op::Greater,
                    '<' => Op::Less,
                    _ => Op::Regex,
                };
                word.set_op(op);
            }
            _ => {
                word.start(offset);
                word.push(ch);
            }
        }
    }
    if let Some(offset) = quote_start {
        return Err(QueryError {
            offset,
            kind: QueryErrorKind::UnterminatedQuote,
        });
    }
    word.finish(&mut tokens);
    Ok(tokens)
}

#[derive(Default)]
struct WordBuilder {
    offset: Option<usize>,
    text: String,
    op: Option<(usize, Op)>,
}

impl WordBuilder {
    fn start(&mut self, offset: usize) {
        self.offset.get_or_insert(offset);
    }

    fn push(&mut self, ch: char) {
        self.text.push(ch);
    }

    fn is_empty(&self) -> bool {
        self.offset.is_none()
    }

    fn has_op(&self) -> bool {
        self.op.is_some()
    }

    fn set_op(&mut self, op: Op) {
        self.op = Some((self.text.len(), op));
    }

    fn finish(&mut self, tokens: &mut Vec<Token>) {
        let Some(offset) = self.offset.take() else {
            return;
        };
        let mut text = std::mem::take(&mut self.text);
        let field = self.op.take().map(|(at, op)| {
            let value = text.split_off(at);
            let tag = std::mem::replace(&mut text, value);
            (tag, op)
        });
        tokens.push(Token {
            kind: TokenKind::Word { field, value: text },
            offset,
        });
    }
}

#[derive(Clone, Debug)]
enum Node {
    Exact { tag: String, value: String },
    Contains { tag: String, value: String },
    Keyword { value: String },
    Greater { tag: String, value: f64 },
    Less { tag: String, value: f64 },
    Regex { tag: String, regex: Regex },
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn literal_len(&self) -> usize {
        match self {
            Node::Exact { value, .. } | Node::Contains { value, .. } | Node::Keyword { value } => {
                value.chars().count()
            }
            Node::Greater { .. } | Node::Less { .. } => 0,
            Node::Regex { regex, .. } => regex.as_str().chars().count(),
            Node::Not(child) => child.literal_len(),
            Node::And(children) => children.iter().map(Node::literal_len).sum(),
            Node::Or(left, right) => left.literal_len() + right.literal_len(),
        }
    }

    fn order_conjunctions(&mut self) {
        match self {
            Node::And(children) => {
                for child in children.iter_mut() {
                    child.order_conjunctions();
                }
                children.sort_by_key(|child| Reverse(child.literal_len()));
            }
            Node::Or(left, right) => {
                left.order_conjunctions();
                right.order_conjunctions();
            }
            Node::Not(child) => child.order_conjunctions(),
            _ => {}
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    options: &'a QueryOptions,
    text_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next_offset(&self) -> usize {
        self.peek().map(|token| token.offset).unwrap_or(self.text_len)
    }

    fn at_operand_end(&self) -> bool {
        matches!(
            self.peek().map(|token| &token.kind),
            None | Some(TokenKind::Pipe) | Some(TokenKind::Close)
        )
    }

    fn parse_or(&mut self) -> Result<Node, QueryError> {
        let left = self.parse_and()?;
        let Some(token) = self.peek() else {
            return Ok(left);
        };
        if token.kind != TokenKind::Pipe {
            return Ok(left);
        }
        self.pos += 1;
        if self.at_operand_end() {
            return Err(QueryError {
                offset: token.offset,
                kind: QueryErrorKind::DanglingOperator('|'),
            });
        }
        let right = self.parse_or()?;
        Ok(Node::Or(Box::new(left), Box::new(right)))
    }

    fn parse_and(&mut self) -> Result<Node, QueryError> {
        let mut children = Vec::new();
        while !self.at_operand_end() {
            children.push(self.parse_unary()?);
        }
        if children.is_empty() {
            let offset = self.next_offset();
            let kind = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Pipe) => QueryErrorKind::DanglingOperator('|'),
                Some(TokenKind::Close) if self.pos > 0
                    && self.tokens[self.pos - 1].kind == TokenKind::Open =>
                {
                    QueryErrorKind::EmptyGroup
                }
                _ => QueryErrorKind::UnbalancedParen,
            };
            return Err(QueryError { offset, kind });
        }
        if children.len() == 1 {
            return Ok(children.remove(0));
        }
        Ok(Node::And(children))
    }

    fn parse_unary(&mut self) -> Result<Node, QueryError> {
        let Some(token) = self.peek() else {
            return Err(QueryError {
                offset: self.text_len,
                kind: QueryErrorKind::UnbalancedParen,
            });
        };
        if token.kind == TokenKind::Bang {
            self.pos += 1;
            if self.at_operand_end() {
                return Err(QueryError {
                    offset: token.offset,
                    kind: QueryErrorKind::DanglingOperator('!'),
                });
            }
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, QueryError> {
        let Some(token) = self.peek() else {
            return Err(QueryError {
                offset: self.text_len,
                kind: QueryErrorKind::UnbalancedParen,
            });
        };
        self.pos += 1;
        match &token.kind {
            TokenKind::Open => {
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token {
                        kind: TokenKind::Close,
                        ..
                    }) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(QueryError {
                        offset: token.offset,
                        kind: QueryErrorKind::UnbalancedParen,
                    }),
                }
            }
            TokenKind::Word { field, value } => self.term(field.as_ref(), value, token.offset),
            TokenKind::Close => Err(QueryError {
                offset: token.offset,
                kind: QueryErrorKind::UnbalancedParen,
            }),
            TokenKind::Pipe => Err(QueryError {
                offset: token.offset,
                kind: QueryErrorKind::DanglingOperator('|'),
            }),
            TokenKind::Bang => Err(QueryError {
                offset: token.offset,
                kind: QueryErrorKind::DanglingOperator('!'),
            }),
        }
    }

    fn term(&self, field: Option<&(String, Op)>, value: &str, offset: usize) -> Result<Node, QueryError> {
        let case_sensitive = self.options.case_sensitive;
        let literal = |tag: &str| {
            if case_sensitive || is_internal(tag) || value == NULL_VALUE {
                value.to_string()
            } else {
                fold(value)
            }
        };
        let Some((tag, op)) = field else {
            let value = if case_sensitive { value.to_string() } else { fold(value) };
            return Ok(Node::Keyword { value });
        };
        if tag.is_empty() {
            return Err(QueryError {
                offset,
                kind: QueryErrorKind::EmptyTag,
            });
        }
        let tag = tag.clone();
        let node = match op {
            Op::Contains => Node::Contains {
                value: literal(&tag),
                tag,
            },
            Op::Exact => Node::Exact {
                value: literal(&tag),
                tag,
            },
            Op::Greater | Op::Less => {
                let number = parse_number(value).ok_or_else(|| QueryError {
                    offset,
                    kind: QueryErrorKind::InvalidNumber(value.to_string()),
                })?;
                if *op == Op::Greater {
                    Node::Greater { tag, value: number }
                } else {
                    Node::Less { tag, value: number }
                }
            }
            Op::Regex => {
                let regex = RegexBuilder::new(value)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|err| QueryError {
                        offset,
                        kind: QueryErrorKind::InvalidRegex(err.to_string()),
                    })?;
                Node::Regex { tag, regex }
            }
        };
        Ok(node)
    }
}

/// Outcome of evaluating a query against one track.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    pub matched: bool,
    /// Tags whose values produced positive leaf matches.
    pub tags: BTreeSet<String>,
}

impl Match {
    fn no() -> Self {
        Self::default()
    }

    fn yes(tags: BTreeSet<String>) -> Self {
        Self { matched: true, tags }
    }
}

/// A compiled query. Evaluation is pure.
#[derive(Clone, Debug)]
pub struct Query {
    root: Node,
    options: QueryOptions,
}

impl Query {
    pub fn compile(text: &str, options: &QueryOptions) -> Result<Self, QueryError> {
        let tokens = tokenize(text)?;
        let mut root = if tokens.is_empty() {
            Node::And(Vec::new())
        } else {
            let mut parser = Parser {
                tokens: &tokens,
                pos: 0,
                options,
                text_len: text.len(),
            };
            let root = parser.parse_or()?;
            if let Some(token) = parser.peek() {
                return Err(QueryError {
                    offset: token.offset,
                    kind: QueryErrorKind::UnbalancedParen,
                });
            }
            root
        };
        root.order_conjunctions();
        Ok(Self {
            root,
            options: options.clone(),
        })
    }

    /// True for a query that matches every track.
    pub fn is_empty(&self) -> bool {
        matches!(&self.root, Node::And(children) if children.is_empty())
    }

    pub fn matches(&self, track: &Track) -> bool {
        self.evaluate(track).matched
    }

    pub fn evaluate(&self, track: &Track) -> Match {
        self.eval(&self.root, track)
    }

    /// `(tag, value)` pairs of exact leaves in the top-level conjunction.
    /// Every match of the query has one of these values for each tag.
    pub fn exact_terms(&self) -> Vec<(&str, &str)> {
        let leaves: Vec<&Node> = match &self.root {
            Node::And(children) => children.iter().collect(),
            other => vec![other],
        };
        leaves
            .into_iter()
            .filter_map(|node| match node {
                Node::Exact { tag, value } if value != NULL_VALUE => {
                    Some((tag.as_str(), value.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    fn eval(&self, node: &Node, track: &Track) -> Match {
        match node {
            Node::Exact { tag, value } => self.exact(track, tag, value),
            Node::Contains { tag, value } => {
                if self.any_value(track, tag, |candidate| candidate.contains(value.as_str())) {
                    Match::yes(BTreeSet::from([tag.clone()]))
                } else {
                    Match::no()
                }
            }
            Node::Keyword { value } => {
                let tags: BTreeSet<String> = self
                    .options
                    .search_fields
                    .iter()
                    .filter(|tag| {
                        self.any_value(track, tag, |candidate| candidate.contains(value.as_str()))
                    })
                    .cloned()
                    .collect();
                if tags.is_empty() {
                    Match::no()
                } else {
                    Match::yes(tags)
                }
            }
            Node::Greater { tag, value } => self.compare(track, tag, |number| number > *value),
            Node::Less { tag, value } => self.compare(track, tag, |number| number < *value),
            Node::Regex { tag, regex } => {
                let hit = track
                    .get(tag)
                    .map(|values| values.iter().any(|candidate| regex.is_match(candidate)))
                    .unwrap_or(false);
                if hit {
                    Match::yes(BTreeSet::from([tag.clone()]))
                } else {
                    Match::no()
                }
            }
            Node::Not(child) => Match {
                matched: !self.eval(child, track).matched,
                tags: BTreeSet::new(),
            },
            Node::And(children) => {
                let mut tags = BTreeSet::new();
                for child in children {
                    let result = self.eval(child, track);
                    if !result.matched {
                        return Match::no();
                    }
                    tags.extend(result.tags);
                }
                Match::yes(tags)
            }
            Node::Or(left, right) => {
                let result = self.eval(left, track);
                if result.matched {
                    return result;
                }
                self.eval(right, track)
            }
        }
    }

    fn exact(&self, track: &Track, tag: &str, value: &str) -> Match {
        if value == NULL_VALUE {
            return Match {
                matched: track.get(tag).is_none(),
                tags: BTreeSet::new(),
            };
        }
        let expected_number = if is_internal(tag) {
            parse_number(value)
        } else {
            None
        };
        let hit = self.any_value(track, tag, |candidate| {
            if let (Some(expected), Some(actual)) = (expected_number, parse_number(candidate)) {
                return (expected - actual).abs() < NUMERIC_EPSILON;
            }
            candidate == value
        });
        if hit {
            Match::yes(BTreeSet::from([tag.to_string()]))
        } else {
            Match::no()
        }
    }

    fn compare(&self, track: &Track, tag: &str, test: impl Fn(f64) -> bool) -> Match {
        let hit = match track.get(tag) {
            Some(values) => values
                .iter()
                .any(|candidate| test(parse_number(candidate).unwrap_or(0.0))),
            None => test(0.0),
        };
        if hit {
            Match::yes(BTreeSet::from([tag.to_string()]))
        } else {
            Match::no()
        }
    }

    fn any_value(&self, track: &Track, tag: &str, test: impl Fn(&str) -> bool) -> bool {
        let Some(values) = track.get(tag) else {
            return false;
        };
        if self.options.case_sensitive || is_internal(tag) {
            values.iter().any(|candidate| test(candidate))
        } else {
            values.iter().any(|candidate| test(&fold(candidate)))
        }
    }
}

/// Orders tracks by the sort keys of `tags`, then by location.
pub fn sort_tracks<T: AsRef<Track>>(tracks: &mut [T], tags: &[&str], options: &SortOptions) {
    tracks.sort_by_cached_key(|track| {
        let track = track.as_ref();
        let mut keys: Vec<String> = tags.iter().map(|tag| track.sort_key(tag, options)).collect();
        keys.push(track.loc().to_string());
        keys
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(loc: &str, pairs: &[(&str, &str)]) -> Track {
        let mut track = Track::new(loc).unwrap();
        for (tag, value) in pairs {
            let mut values: Vec<String> = track.get(tag).map(|v| v.to_vec()).unwrap_or_default();
            values.push(value.to_string());
            track.set_tag(tag, values).unwrap();
        }
        track
    }

    fn compile(text: &str) -> Query {
        Query::compile(text, &QueryOptions::default()).unwrap()
    }

    fn error(text: &str) -> QueryError {
        Query::compile(text, &QueryOptions::default()).unwrap_err()
    }

    #[test]
    fn keyword_searches_configured_fields() {
        let t1 = track("file:///m/1.mp3", &[("title", "Hey"), ("artist", "A")]);
        let t2 = track("file:///m/2.mp3", &[("title", "Hoy"), ("artist", "B")]);
        let query = compile("he");
        let result = query.evaluate(&t1);
        assert!(result.matched);
        assert_eq!(result.tags, BTreeSet::from(["title".to_string()]));
        assert!(!query.matches(&t2));

        let genre_only = track("file:///m/3.mp3", &[("genre", "hey")]);
        assert!(!query.matches(&genre_only));
    }

    #[test]
    fn containment_and_exact() {
        let t = track("file:///m/1.mp3", &[("artist", "Aphex Twin")]);
        assert!(compile("artist=twin").matches(&t));
        assert!(!compile("artist==twin").matches(&t));
        assert!(compile("artist==\"aphex twin\"").matches(&t));
        assert!(!compile("album=twin").matches(&t));
    }

    #[test]
    fn null_matches_missing_tags() {
        let t = track("file:///m/1.mp3", &[("artist", "A")]);
        assert!(compile("genre==__null__").matches(&t));
        assert!(!compile("artist==__null__").matches(&t));
    }

    #[test]
    fn boolean_operators() {
        let query = compile("(artist=A | artist=B) !genre=jazz");
        let rock_a = track("file:///m/1.mp3", &[("artist", "A"), ("genre", "Rock")]);
        let jazz_b = track("file:///m/2.mp3", &[("artist", "B"), ("genre", "Jazz")]);
        let plain_b = track("file:///m/3.mp3", &[("artist", "B")]);
        let other = track("file:///m/4.mp3", &[("artist", "C")]);
        assert!(query.matches(&rock_a));
        assert!(!query.matches(&jazz_b));
        assert!(query.matches(&plain_b));
        assert!(!query.matches(&other));
    }

    #[test]
    fn pipe_binds_looser_than_conjunction() {
        let a = track("file:///m/1.mp3", &[("artist", "A")]);
        let b_only = track("file:///m/2.mp3", &[("artist", "B")]);
        let query = compile("artist=A genre=x | artist=B");
        assert!(!query.matches(&a));
        assert!(query.matches(&b_only));
    }

    #[test]
    fn negation_reports_no_tags() {
        let t = track("file:///m/1.mp3", &[("artist", "A"), ("title", "Song")]);
        let result = compile("title=song !artist=zzz").evaluate(&t);
        assert!(result.matched);
        assert_eq!(result.tags, BTreeSet::from(["title".to_string()]));
    }

    #[test]
    fn case_and_marks_fold_when_insensitive() {
        let t = track("file:///m/1.mp3", &[("artist", "Beyoncé")]);
        assert!(compile("artist=BEYONCE").matches(&t));
        assert!(compile("artist==beyonce").matches(&t));

        let sensitive = QueryOptions {
            case_sensitive: true,
            ..QueryOptions::default()
        };
        assert!(!Query::compile("artist=beyoncé", &sensitive).unwrap().matches(&t));
        assert!(Query::compile("artist=Beyoncé", &sensitive).unwrap().matches(&t));
    }

    #[test]
    fn internal_exact_matches_compare_numbers() {
        let t = track("file:///m/1.mp3", &[("__length", "215.00001")]);
        assert!(compile("__length==215").matches(&t));
        assert!(!compile("__length==216").matches(&t));
        assert!(compile("__length>200 __length<300").matches(&t));
        assert!(compile("__playcount<1").matches(&t));
    }

    #[test]
    fn regex_search() {
        let t = track("file:///m/1.mp3", &[("title", "Track 07")]);
        assert!(compile("title~\"^track \\\\d+$\"").matches(&t));
        assert!(!compile("title~^07").matches(&t));
        let err = error("title~\"(unclosed\"");
        assert!(matches!(err.kind, QueryErrorKind::InvalidRegex(_)));
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn quoting_and_escapes() {
        let t = track("file:///m/1.mp3", &[("title", "a=b (live)")]);
        assert!(compile("\"a=b (live)\"").matches(&t));
        assert!(compile("title=a\\=b").matches(&t));
        let t2 = track("file:///m/2.mp3", &[("title", "x|y")]);
        assert!(compile("x\\|y").matches(&t2));
    }

    #[test]
    fn empty_query_matches_everything() {
        let t = track("file:///m/1.mp3", &[]);
        let query = compile("   ");
        assert!(query.is_empty());
        assert!(query.matches(&t));
    }

    #[test]
    fn malformed_queries_report_offsets() {
        let err = error("(artist=A");
        assert_eq!(err.kind, QueryErrorKind::UnbalancedParen);
        assert_eq!(err.offset, 0);

        let err = error("artist=A)");
        assert_eq!(err.kind, QueryErrorKind::UnbalancedParen);
        assert_eq!(err.offset, 8);

        let err = error("a |");
        assert_eq!(err.kind, QueryErrorKind::DanglingOperator('|'));
        assert_eq!(err.offset, 2);

        let err = error("| a");
        assert_eq!(err.kind, QueryErrorKind::DanglingOperator('|'));
        assert_eq!(err.offset, 0);

        let err = error("a !");
        assert_eq!(err.kind, QueryErrorKind::DanglingOperator('!'));
        assert_eq!(err.offset, 2);

        let err = error("title=\"open");
        assert_eq!(err.kind, QueryErrorKind::UnterminatedQuote);
        assert_eq!(err.offset, 6);

        assert_eq!(error("=x").kind, QueryErrorKind::EmptyTag);
        assert_eq!(error("()").kind, QueryErrorKind::EmptyGroup);
        assert!(matches!(error("__length>abc").kind, QueryErrorKind::InvalidNumber(_)));
    }

    #[test]
    fn conjunctions_try_longest_literals_first() {
        let query = compile("a artist=\"much longer\"");
        match &query.root {
            Node::And(children) => assert!(matches!(&children[0], Node::Contains { .. })),
            other => panic!("unexpected root {other:?}"),
        }
    }

    #[test]
    fn exact_terms_come_from_top_level_conjunction() {
        let query = compile("artist==A title=x (album==B | album==C)");
        assert_eq!(query.exact_terms(), vec![("artist", "a")]);
        assert!(compile("genre==__null__").exact_terms().is_empty());
    }

    #[test]
    fn sorting_uses_sort_keys() {
        let mut tracks = vec![
            track("file:///m/2.mp3", &[("artist", "The Zombies")]),
            track("file:///m/1.mp3", &[("artist", "Abba")]),
            track("file:///m/3.mp3", &[("artist", "beatles")]),
        ];
        sort_tracks(&mut tracks, &["artist"], &SortOptions::default());
        let order: Vec<&str> = tracks.iter().map(|t| t.loc()).collect();
        assert_eq!(order, vec!["file:///m/1.mp3", "file:///m/3.mp3", "file:///m/2.mp3"]);
    }
}
