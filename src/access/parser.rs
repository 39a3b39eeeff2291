//! Line-oriented parsing of access-file and group-file bodies (spec.md §6).

use thiserror::Error;

use crate::path;

use super::{ParsedAccess, Principal, Right};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown right {0:?} on line {1}")]
    UnknownRight(String, usize),
    #[error("malformed line {0}: {1:?}")]
    MalformedLine(usize, String),
    #[error("malformed principal {0:?} on line {1}")]
    MalformedPrincipal(String, usize),
}

fn right_from_token(tok: &str) -> Option<Right> {
    match tok.to_ascii_lowercase().as_str() {
        "r" | "read" => Some(Right::Read),
        "w" | "write" => Some(Right::Write),
        "c" | "create" => Some(Right::Create),
        "d" | "delete" => Some(Right::Delete),
        "l" | "list" => Some(Right::List),
        "any" | "*" => Some(Right::Any),
        _ => None,
    }
}

fn parse_principal(tok: &str, line_no: usize) -> Result<Principal, ParseError> {
    if tok.eq_ignore_ascii_case("all") {
        return Ok(Principal::All);
    }
    if let Some(domain) = tok.strip_prefix("*@") {
        if domain.is_empty() {
            return Err(ParseError::MalformedPrincipal(tok.to_string(), line_no));
        }
        return Ok(Principal::DomainWildcard(domain.to_string()));
    }
    if tok.contains('/') {
        let name = path::parse(tok)
            .map_err(|_| ParseError::MalformedPrincipal(tok.to_string(), line_no))?;
        return Ok(Principal::Group(name));
    }
    if path::validate_user(tok).is_ok() {
        return Ok(Principal::User(tok.to_string()));
    }
    Err(ParseError::MalformedPrincipal(tok.to_string(), line_no))
}

fn split_principals(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty())
}

/// Parse an `Access` file body: non-blank, non-comment lines of the form
/// `rights : principals`.
pub fn parse_access(body: &[u8]) -> Result<ParsedAccess, ParseError> {
    let text = String::from_utf8_lossy(body);
    let mut access = ParsedAccess::default();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (rights_part, principals_part) = line
            .split_once(':')
            .ok_or_else(|| ParseError::MalformedLine(line_no, raw_line.to_string()))?;

        let mut rights = Vec::new();
        for tok in rights_part.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let right = right_from_token(tok)
                .ok_or_else(|| ParseError::UnknownRight(tok.to_string(), line_no))?;
            rights.push(right);
        }
        if rights.is_empty() {
            return Err(ParseError::MalformedLine(line_no, raw_line.to_string()));
        }

        let mut principals = Vec::new();
        for tok in split_principals(principals_part) {
            principals.push(parse_principal(tok, line_no)?);
        }

        for right in rights {
            access.grants.entry(right).or_default().extend(principals.clone());
        }
    }

    Ok(access)
}

/// Parse a group-file body: whitespace- or comma-separated principals,
/// supporting nesting via group references (spec.md §6).
pub fn parse_group(body: &[u8]) -> Result<Vec<Principal>, ParseError> {
    let text = String::from_utf8_lossy(body);
    let mut principals = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        for tok in split_principals(line) {
            principals.push(parse_principal(tok, line_no)?);
        }
    }
    Ok(principals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_letter_and_word_rights() {
        let access = parse_access(b"r,w: ann@example.com\nlist : bob@example.com\n").unwrap();
        assert_eq!(access.grants[&Right::Read].len(), 1);
        assert_eq!(access.grants[&Right::Write].len(), 1);
        assert_eq!(access.grants[&Right::List].len(), 1);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let access = parse_access(b"# a comment\n\nread: ann@example.com # trailing comment\n").unwrap();
        assert_eq!(access.grants[&Right::Read].len(), 1);
    }

    #[test]
    fn parses_wildcard_all_and_group_principals() {
        let access =
            parse_access(b"read: *@example.com, all, ann@example.com/Group/friends\n").unwrap();
        let grants = &access.grants[&Right::Read];
        assert!(grants.contains(&Principal::DomainWildcard("example.com".into())));
        assert!(grants.contains(&Principal::All));
        assert!(grants
            .iter()
            .any(|p| matches!(p, Principal::Group(n) if n.to_string() == "ann@example.com/Group/friends")));
    }

    #[test]
    fn rejects_unknown_right() {
        assert!(parse_access(b"execute: ann@example.com\n").is_err());
    }

    #[test]
    fn rejects_line_without_colon() {
        assert!(parse_access(b"read ann@example.com\n").is_err());
    }

    #[test]
    fn group_file_parses_comma_and_whitespace_separated() {
        let principals = parse_group(b"ann@example.com, bob@example.com\ncarol@example.com").unwrap();
        assert_eq!(principals.len(), 3);
    }

    #[test]
    fn group_file_supports_nested_group_refs() {
        let principals = parse_group(b"ann@example.com/Group/inner").unwrap();
        assert_eq!(principals.len(), 1);
        assert!(matches!(&principals[0], Principal::Group(_)));
    }
}
