//! RFC 4515 search filter codec.
//!
//! Filters are parsed into a [`FilterNode`] tree, transformed, and encoded back to string form.
//! Assertion values stay in their escaped string form throughout so that a parse followed by an
//! encode reproduces the client's value bytes exactly.

use ldap_proxy_core::Error;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing or encoding a filter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The input is not a valid RFC 4515 filter.
    #[error("invalid filter at offset {offset}: {message}")]
    Parse {
        /// Byte offset where parsing stopped.
        offset: usize,
        /// What was wrong.
        message: String,
    },

    /// The tree cannot be written as a valid filter string.
    #[error("cannot encode filter: {0}")]
    Serialize(String),
}

impl From<FilterError> for Error {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Parse { .. } => Self::FilterParse(err.to_string()),
            FilterError::Serialize(_) => Self::FilterSerialize(err.to_string()),
        }
    }
}

/// A parsed search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    /// `(&...)`
    And(Vec<FilterNode>),
    /// `(|...)`
    Or(Vec<FilterNode>),
    /// `(!...)`
    Not(Box<FilterNode>),
    /// `(attr=value)`
    Equality {
        /// Attribute description.
        attribute: String,
        /// Escaped assertion value.
        value: String,
    },
    /// `(attr=initial*any*final)`
    Substring {
        /// Attribute description.
        attribute: String,
        /// Leading fragment.
        initial: Option<String>,
        /// Middle fragments.
        any: Vec<String>,
        /// Trailing fragment.
        final_: Option<String>,
    },
    /// `(attr>=value)`
    GreaterOrEqual {
        /// Attribute description.
        attribute: String,
        /// Escaped assertion value.
        value: String,
    },
    /// `(attr<=value)`
    LessOrEqual {
        /// Attribute description.
        attribute: String,
        /// Escaped assertion value.
        value: String,
    },
    /// `(attr~=value)`
    Approx {
        /// Attribute description.
        attribute: String,
        /// Escaped assertion value.
        value: String,
    },
    /// `(attr=*)`
    Present(String),
    /// `(attr:dn:rule:=value)`
    Extensible {
        /// Attribute description, if any.
        attribute: Option<String>,
        /// Whether the `:dn` flag is set.
        dn_attributes: bool,
        /// Matching rule, if any.
        matching_rule: Option<String>,
        /// Escaped assertion value.
        value: String,
    },
}

impl FilterNode {
    /// Parses an RFC 4515 filter string.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Parse`] if the input is not a single well-formed filter.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let mut parser = Parser::new(input);
        parser.skip_whitespace();
        let node = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(node)
    }

    /// Encodes the tree as an RFC 4515 filter string.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Serialize`] if a node carries an invalid attribute description,
    /// an invalid value escape, or an empty AND/OR operand list.
    pub fn encode(&self) -> Result<String, FilterError> {
        let mut out = String::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// The attribute a comparison or presence node tests, if it is one.
    #[must_use]
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::Equality { attribute, .. }
            | Self::Substring { attribute, .. }
            | Self::GreaterOrEqual { attribute, .. }
            | Self::LessOrEqual { attribute, .. }
            | Self::Approx { attribute, .. }
            | Self::Present(attribute) => Some(attribute),
            Self::And(_) | Self::Or(_) | Self::Not(_) | Self::Extensible { .. } => None,
        }
    }

    fn write_to(&self, out: &mut String) -> Result<(), FilterError> {
        out.push('(');
        match self {
            Self::And(children) | Self::Or(children) => {
                if children.is_empty() {
                    return Err(FilterError::Serialize(
                        "AND/OR node without operands".to_string(),
                    ));
                }
                out.push(if matches!(self, Self::And(_)) { '&' } else { '|' });
                for child in children {
                    child.write_to(out)?;
                }
            }
            Self::Not(child) => {
                out.push('!');
                child.write_to(out)?;
            }
            Self::Equality { attribute, value } => write_item(out, attribute, "=", value)?,
            Self::GreaterOrEqual { attribute, value } => write_item(out, attribute, ">=", value)?,
            Self::LessOrEqual { attribute, value } => write_item(out, attribute, "<=", value)?,
            Self::Approx { attribute, value } => write_item(out, attribute, "~=", value)?,
            Self::Present(attribute) => {
                check_attribute(attribute)?;
                out.push_str(attribute);
                out.push_str("=*");
            }
            Self::Substring {
                attribute,
                initial,
                any,
                final_,
            } => {
                check_attribute(attribute)?;
                out.push_str(attribute);
                out.push('=');
                if let Some(initial) = initial {
                    check_value(initial)?;
                    out.push_str(initial);
                }
                out.push('*');
                for fragment in any {
                    if fragment.is_empty() {
                        return Err(FilterError::Serialize(
                            "empty substring fragment".to_string(),
                        ));
                    }
                    check_value(fragment)?;
                    out.push_str(fragment);
                    out.push('*');
                }
                if let Some(final_) = final_ {
                    check_value(final_)?;
                    out.push_str(final_);
                }
            }
            Self::Extensible {
                attribute,
                dn_attributes,
                matching_rule,
                value,
            } => {
                if attribute.is_none() && matching_rule.is_none() {
                    return Err(FilterError::Serialize(
                        "extensible match needs an attribute or a matching rule".to_string(),
                    ));
                }
                if let Some(attribute) = attribute {
                    check_attribute(attribute)?;
                    out.push_str(attribute);
                }
                if *dn_attributes {
                    out.push_str(":dn");
                }
                if let Some(rule) = matching_rule {
                    if rule.is_empty() || !rule.bytes().all(is_attribute_byte) {
                        return Err(FilterError::Serialize(format!(
                            "invalid matching rule `{rule}`"
                        )));
                    }
                    out.push(':');
                    out.push_str(rule);
                }
                check_value(value)?;
                out.push_str(":=");
                out.push_str(value);
            }
        }
        out.push(')');
        Ok(())
    }
}

impl FromStr for FilterNode {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Escapes raw assertion bytes for use inside a filter string.
///
/// The filter metacharacters and NUL are always hex-escaped. Bytes that are not part of valid
/// UTF-8 are hex-escaped as well.
#[must_use]
pub fn escape_value(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text
            .chars()
            .fold(String::with_capacity(raw.len()), |mut out, ch| {
                match ch {
                    '*' => out.push_str("\\2a"),
                    '(' => out.push_str("\\28"),
                    ')' => out.push_str("\\29"),
                    '\\' => out.push_str("\\5c"),
                    '\0' => out.push_str("\\00"),
                    _ => out.push(ch),
                }
                out
            }),
        Err(_) => raw
            .iter()
            .fold(String::with_capacity(raw.len() * 3), |mut out, byte| {
                if byte.is_ascii() && !matches!(*byte, b'*' | b'(' | b')' | b'\\' | 0) {
                    out.push(char::from(*byte));
                } else {
                    let _ = write!(out, "\\{byte:02x}");
                }
                out
            }),
    }
}

fn write_item(out: &mut String, attribute: &str, op: &str, value: &str) -> Result<(), FilterError> {
    check_attribute(attribute)?;
    check_value(value)?;
    out.push_str(attribute);
    out.push_str(op);
    out.push_str(value);
    Ok(())
}

fn check_attribute(attribute: &str) -> Result<(), FilterError> {
    if attribute.is_empty() || !attribute.bytes().all(is_attribute_byte) {
        return Err(FilterError::Serialize(format!(
            "invalid attribute description `{attribute}`"
        )));
    }
    Ok(())
}

fn check_value(value: &str) -> Result<(), FilterError> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if !bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                    || !bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit)
                {
                    return Err(FilterError::Serialize(format!(
                        "invalid escape in value `{value}`"
                    )));
                }
                i += 3;
            }
            b'*' | b'(' | b')' | 0 => {
                return Err(FilterError::Serialize(format!(
                    "unescaped metacharacter in value `{value}`"
                )));
            }
            _ => i += 1,
        }
    }
    Ok(())
}

const fn is_attribute_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b';' | b'_')
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Parse {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", char::from(byte))))
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_filter(&mut self) -> Result<FilterNode, FilterError> {
        self.expect(b'(')?;
        let node = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                FilterNode::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                FilterNode::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                self.skip_whitespace();
                let child = self.parse_filter()?;
                self.skip_whitespace();
                FilterNode::Not(Box::new(child))
            }
            Some(_) => self.parse_item()?,
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(node)
    }

    fn parse_list(&mut self) -> Result<Vec<FilterNode>, FilterError> {
        let mut children = Vec::new();
        self.skip_whitespace();
        while self.peek() == Some(b'(') {
            children.push(self.parse_filter()?);
            self.skip_whitespace();
        }
        if children.is_empty() {
            return Err(self.error("AND/OR needs at least one operand"));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> Result<FilterNode, FilterError> {
        let attribute = self.take_while(is_attribute_byte);

        if self.peek() == Some(b':') {
            return self.parse_extensible(attribute);
        }
        if attribute.is_empty() {
            return Err(self.error("missing attribute description"));
        }

        let op = match (self.peek(), self.input.get(self.pos + 1).copied()) {
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            }
            (Some(op @ (b'~' | b'>' | b'<')), Some(b'=')) => {
                self.pos += 2;
                op
            }
            _ => return Err(self.error("expected filter operator")),
        };

        let value_start = self.pos;
        let value = self.parse_value(op == b'=')?;
        let node = match op {
            b'~' => FilterNode::Approx { attribute, value },
            b'>' => FilterNode::GreaterOrEqual { attribute, value },
            b'<' => FilterNode::LessOrEqual { attribute, value },
            _ if value == "*" => FilterNode::Present(attribute),
            _ if value.contains('*') => substring(attribute, &value).ok_or(FilterError::Parse {
                offset: value_start,
                message: "malformed substring assertion".to_string(),
            })?,
            _ => FilterNode::Equality { attribute, value },
        };
        Ok(node)
    }

    fn parse_extensible(&mut self, attribute: String) -> Result<FilterNode, FilterError> {
        let mut dn_attributes = false;
        let mut matching_rule = None;
        loop {
            self.expect(b':')?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let token = self.take_while(is_attribute_byte);
            if token.is_empty() {
                return Err(self.error("empty extensible match component"));
            }
            if token.eq_ignore_ascii_case("dn") && !dn_attributes && matching_rule.is_none() {
                dn_attributes = true;
            } else if matching_rule.is_none() {
                matching_rule = Some(token);
            } else {
                return Err(self.error("too many extensible match components"));
            }
        }

        if attribute.is_empty() && matching_rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a matching rule"));
        }

        let value = self.parse_value(false)?;
        Ok(FilterNode::Extensible {
            attribute: (!attribute.is_empty()).then_some(attribute),
            dn_attributes,
            matching_rule,
            value,
        })
    }

    fn parse_value(&mut self, allow_star: bool) -> Result<String, FilterError> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            match byte {
                b')' => break,
                b'(' | 0 => return Err(self.error("unescaped metacharacter in value")),
                b'*' if !allow_star => {
                    return Err(self.error("unescaped `*` in assertion value"));
                }
                b'\\' => {
                    let valid = self
                        .input
                        .get(self.pos + 1..self.pos + 3)
                        .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
                    if !valid {
                        return Err(self.error("invalid escape sequence"));
                    }
                    self.pos += 3;
                }
                _ => self.pos += 1,
            }
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .map(str::to_string)
            .map_err(|_| self.error("value is not valid UTF-8"))
    }

    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }
}

fn substring(attribute: String, value: &str) -> Option<FilterNode> {
    let parts: Vec<&str> = value.split('*').collect();
    let (first, rest) = parts.split_first()?;
    let (last, middle) = rest.split_last()?;
    if middle.iter().any(|fragment| fragment.is_empty()) {
        return None;
    }
    Some(FilterNode::Substring {
        attribute,
        initial: (!first.is_empty()).then(|| (*first).to_string()),
        any: middle.iter().map(|fragment| (*fragment).to_string()).collect(),
        final_: (!last.is_empty()).then(|| (*last).to_string()),
    })
}
