//! Tag expressions.
//!
//! ```text
//! expr := term ( "OR" term )*
//! term := atom ( ["AND"] atom )*      juxtaposition means AND
//! atom := TAG | "(" expr ")"
//! ```
//!
//! Operators are the upper-case words `AND` and `OR`; anything else is a
//! tag and is normalised like stored tags, so `red and blue` is the three tags
//! `red`, `and`, `blue`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{TagFsError, TagFsResult};
use crate::storage::types::{TagSet, normalize_tag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    Tag(String),
    And(Vec<TagExpr>),
    Or(Vec<TagExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    And,
    Or,
    Open,
    Close,
}

impl TagExpr {
    pub fn parse(input: &str) -> TagFsResult<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(TagFsError::InvalidQuery("a query needs at least one tag".into()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(TagFsError::InvalidQuery(format!("unexpected {:?}", tok)));
        }
        Ok(expr)
    }

    /// Conjunction of plain tags, the shape bulk commands build.
    pub fn all_of<I, S>(tags: I) -> TagFsResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms = tags
            .into_iter()
            .map(|t| normalize_tag(t.as_ref()).map(TagExpr::Tag))
            .collect::<TagFsResult<Vec<_>>>()?;
        match terms.len() {
            0 => Err(TagFsError::InvalidQuery("a query needs at least one tag".into())),
            1 => Ok(terms.remove(0)),
            _ => Ok(TagExpr::And(terms)),
        }
    }

    /// Every distinct tag mentioned.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        match self {
            TagExpr::Tag(t) => {
                out.insert(t.clone());
            }
            TagExpr::And(xs) | TagExpr::Or(xs) => xs.iter().for_each(|x| x.collect_tags(out)),
        }
    }

    /// Tags every match must carry. A missing shard for one of these can
    /// silently empty the whole result.
    pub fn required_tags(&self) -> BTreeSet<String> {
        match self {
            TagExpr::Tag(t) => BTreeSet::from([t.clone()]),
            TagExpr::And(xs) => xs.iter().flat_map(|x| x.required_tags()).collect(),
            TagExpr::Or(xs) => {
                let mut sets = xs.iter().map(|x| x.required_tags());
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, s| acc.intersection(&s).cloned().collect())
            }
        }
    }

    pub fn matches(&self, tags: &TagSet) -> bool {
        match self {
            TagExpr::Tag(t) => tags.contains(t),
            TagExpr::And(xs) => xs.iter().all(|x| x.matches(tags)),
            TagExpr::Or(xs) => xs.iter().any(|x| x.matches(tags)),
        }
    }

    /// Combines per-tag id sets: AND intersects, OR unions.
    pub fn evaluate(&self, per_tag: &HashMap<String, BTreeSet<String>>) -> BTreeSet<String> {
        match self {
            TagExpr::Tag(t) => per_tag.get(t).cloned().unwrap_or_default(),
            TagExpr::And(xs) => {
                let mut sets = xs.iter().map(|x| x.evaluate(per_tag));
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, s| acc.intersection(&s).cloned().collect())
            }
            TagExpr::Or(xs) => xs.iter().flat_map(|x| x.evaluate(per_tag)).collect(),
        }
    }
}

impl FromStr for TagExpr {
    type Err = TagFsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagExpr::parse(s)
    }
}

impl fmt::Display for TagExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, xs: &[TagExpr], op: &str| {
            for (i, x) in xs.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", op)?;
                }
                match x {
                    TagExpr::Tag(_) => write!(f, "{}", x)?,
                    _ => write!(f, "({})", x)?,
                }
            }
            Ok(())
        };
        match self {
            TagExpr::Tag(t) => write!(f, "{}", t),
            TagExpr::And(xs) => join(f, xs, "AND"),
            TagExpr::Or(xs) => join(f, xs, "OR"),
        }
    }
}

fn tokenize(input: &str) -> TagFsResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let mut flush = |word: &mut String, tokens: &mut Vec<Token>| -> TagFsResult<()> {
        if word.is_empty() {
            return Ok(());
        }
        let tok = match word.as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            w => Token::Tag(normalize_tag(w)?),
        };
        tokens.push(tok);
        word.clear();
        Ok(())
    };

    for c in input.chars() {
        match c {
            '(' | ')' => {
                flush(&mut word, &mut tokens)?;
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens)?,
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens)?;
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expr(&mut self) -> TagFsResult<TagExpr> {
        let mut terms = vec![self.term()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(flatten(terms, TagExpr::Or))
    }

    fn term(&mut self) -> TagFsResult<TagExpr> {
        let mut atoms = vec![self.atom()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    atoms.push(self.atom()?);
                }
                Some(Token::Tag(_)) | Some(Token::Open) => atoms.push(self.atom()?),
                _ => break,
            }
        }
        Ok(flatten(atoms, TagExpr::And))
    }

    fn atom(&mut self) -> TagFsResult<TagExpr> {
        match self.next() {
            Some(Token::Tag(t)) => Ok(TagExpr::Tag(t)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(TagFsError::InvalidQuery("unbalanced parenthesis".into())),
                }
            }
            Some(tok) => Err(TagFsError::InvalidQuery(format!("unexpected {:?}", tok))),
            None => Err(TagFsError::InvalidQuery("query ends with an operator".into())),
        }
    }
}

fn flatten(mut items: Vec<TagExpr>, wrap: fn(Vec<TagExpr>) -> TagExpr) -> TagExpr {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}
