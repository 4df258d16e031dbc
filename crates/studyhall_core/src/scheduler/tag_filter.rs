//! Boolean tag expressions.
//!
//! Textual form: tag names combined with `&` (and), `|` (or), `!` (not) and
//! parentheses. `!` binds tightest, then `&`, then `|`:
//!
//! ```text
//! algebra & !advanced
//! (fractions | decimals) & !review
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use crate::error::StudyError;

/// Boolean expression over tag names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Cards carrying the tag.
    Tag(String),
    /// Cards matching every operand.
    And(Vec<TagFilter>),
    /// Cards matching any operand.
    Or(Vec<TagFilter>),
    /// Cards not matching the operand.
    Not(Box<TagFilter>),
}

impl TagFilter {
    /// Shorthand for [`TagFilter::Tag`].
    pub fn tag(name: impl Into<String>) -> Self {
        TagFilter::Tag(name.into())
    }

    /// Whether a card carrying `tags` satisfies the expression.
    pub fn matches<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        match self {
            TagFilter::Tag(name) => tags.iter().any(|t| t.as_ref() == name),
            TagFilter::And(parts) => parts.iter().all(|p| p.matches(tags)),
            TagFilter::Or(parts) => parts.iter().any(|p| p.matches(tags)),
            TagFilter::Not(inner) => !inner.matches(tags),
        }
    }

    /// A set of tags at least one of which every matching card carries, when
    /// one can be derived. Lets callers enumerate candidates from tag indexes
    /// instead of the whole course.
    pub fn anchor_tags(&self) -> Option<BTreeSet<String>> {
        match self {
            TagFilter::Tag(name) => Some(BTreeSet::from([name.clone()])),
            TagFilter::And(parts) => parts
                .iter()
                .filter_map(TagFilter::anchor_tags)
                .min_by_key(BTreeSet::len),
            TagFilter::Or(parts) => parts.iter().try_fold(BTreeSet::new(), |mut acc, part| {
                acc.extend(part.anchor_tags()?);
                Some(acc)
            }),
            TagFilter::Not(_) => None,
        }
    }

    fn is_atomic(&self) -> bool {
        matches!(self, TagFilter::Tag(_) | TagFilter::Not(_))
    }
}

impl BitAnd for TagFilter {
    type Output = TagFilter;

    fn bitand(self, rhs: TagFilter) -> TagFilter {
        match self {
            TagFilter::And(mut parts) => {
                parts.push(rhs);
                TagFilter::And(parts)
            }
            lhs => TagFilter::And(vec![lhs, rhs]),
        }
    }
}

impl BitOr for TagFilter {
    type Output = TagFilter;

    fn bitor(self, rhs: TagFilter) -> TagFilter {
        match self {
            TagFilter::Or(mut parts) => {
                parts.push(rhs);
                TagFilter::Or(parts)
            }
            lhs => TagFilter::Or(vec![lhs, rhs]),
        }
    }
}

impl Not for TagFilter {
    type Output = TagFilter;

    fn not(self) -> TagFilter {
        TagFilter::Not(Box::new(self))
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagFilter::Tag(name) => f.write_str(name),
            TagFilter::Not(inner) if inner.is_atomic() => write!(f, "!{}", inner),
            TagFilter::Not(inner) => write!(f, "!({})", inner),
            TagFilter::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" & ")?;
                    }
                    if matches!(part, TagFilter::Or(_)) {
                        write!(f, "({})", part)?;
                    } else {
                        write!(f, "{}", part)?;
                    }
                }
                Ok(())
            }
            TagFilter::Or(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for TagFilter {
    type Err = StudyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            tokens: tokenize(s)?,
            pos: 0,
        };
        let filter = parser.or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(filter),
            Some(token) => Err(syntax_error(s, &format!("unexpected {}", token))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Tag(name) => write!(f, "tag '{}'", name),
            Token::And => f.write_str("'&'"),
            Token::Or => f.write_str("'|'"),
            Token::Not => f.write_str("'!'"),
            Token::Open => f.write_str("'('"),
            Token::Close => f.write_str("')'"),
        }
    }
}

fn syntax_error(input: &str, detail: &str) -> StudyError {
    StudyError::Validation(format!("invalid tag filter '{}': {}", input, detail))
}

fn tokenize(input: &str) -> Result<Vec<Token>, StudyError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            _ => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "&|!()".contains(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                tokens.push(Token::Tag(name));
            }
        }
    }
    if tokens.is_empty() {
        return Err(syntax_error(input, "empty expression"));
    }
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
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<TagFilter, StudyError> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            TagFilter::Or(parts)
        })
    }

    fn and(&mut self) -> Result<TagFilter, StudyError> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            TagFilter::And(parts)
        })
    }

    fn unary(&mut self) -> Result<TagFilter, StudyError> {
        match self.next() {
            Some(Token::Not) => Ok(!self.unary()?),
            Some(Token::Tag(name)) => Ok(TagFilter::Tag(name)),
            Some(Token::Open) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(StudyError::Validation("invalid tag filter: unclosed '('".into())),
                }
            }
            Some(token) => Err(StudyError::Validation(format!(
                "invalid tag filter: unexpected {}",
                token
            ))),
            None => Err(StudyError::Validation(
                "invalid tag filter: unexpected end of expression".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> TagFilter {
        s.parse().unwrap()
    }

    #[test]
    fn test_and_not_excludes_advanced() {
        let filter = parse("algebra & !advanced");
        assert!(filter.matches(&["algebra"]));
        assert!(!filter.matches(&["algebra", "advanced"]));
        assert!(!filter.matches(&["geometry"]));
    }

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(
            parse("a | b & c"),
            TagFilter::tag("a") | (TagFilter::tag("b") & TagFilter::tag("c"))
        );
        assert_eq!(
            parse("(a | b) & c"),
            (TagFilter::tag("a") | TagFilter::tag("b")) & TagFilter::tag("c")
        );
        assert_eq!(parse("!!a"), !!TagFilter::tag("a"));
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["algebra & !advanced", "(a | b) & !(c | d)", "a | b | c"] {
            assert_eq!(parse(text).to_string(), text);
            assert_eq!(parse(&parse(text).to_string()), parse(text));
        }
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["", "a &", "(a | b", "a b", "& a", ")"] {
            assert!(
                matches!(bad.parse::<TagFilter>(), Err(StudyError::Validation(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_anchor_tags() {
        assert_eq!(
            parse("algebra & !advanced").anchor_tags(),
            Some(BTreeSet::from(["algebra".to_string()]))
        );
        assert_eq!(
            parse("a | b").anchor_tags(),
            Some(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
        assert_eq!(parse("a | !b").anchor_tags(), None);
        assert_eq!(parse("!a").anchor_tags(), None);
    }
}
