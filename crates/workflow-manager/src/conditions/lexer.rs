//! Tokenizer for condition strings.
//!
//! Quotes and placeholders are consumed whole before anything else is
//! matched, so `'AND'` or `{{tags[('0010','0040')]}}` never leak keywords or
//! operators into the token stream.

use super::expression::{Keyword, Operator};
use super::ConditionError;

/// Characters that may form a comparison operator.
const OPERATOR_CHARS: [char; 4] = ['!', '=', '<', '>'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Literal(String),
    Placeholder(String),
    Operator(Operator),
    Keyword(Keyword),
    /// Unquoted word that is not a keyword.
    Word(String),
    /// Run of punctuation that is not a known operator.
    Symbol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Character offset of the token's first character.
    pub index: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let kind = if c == '\'' {
            let end = find_char(&chars, i + 1, '\'').ok_or_else(|| {
                ConditionError::malformed(start, format!("Unterminated literal at index: {}", start))
            })?;
            i = end + 1;
            TokenKind::Literal(chars[start + 1..end].iter().collect())
        } else if c == '{' && chars.get(i + 1) == Some(&'{') {
            let end = find_closing_braces(&chars, i + 2).ok_or_else(|| {
                ConditionError::malformed(
                    start,
                    format!("Unterminated placeholder at index: {}", start),
                )
            })?;
            i = end + 2;
            let body: String = chars[start + 2..end].iter().collect();
            let body = body.trim();
            if body.is_empty() {
                return Err(ConditionError::malformed(
                    start,
                    format!("Empty placeholder at index: {}", start),
                ));
            }
            TokenKind::Placeholder(body.to_string())
        } else if OPERATOR_CHARS.contains(&c) {
            while i < chars.len() && OPERATOR_CHARS.contains(&chars[i]) {
                i += 1;
            }
            let symbol: String = chars[start..i].iter().collect();
            match Operator::from_symbol(&symbol) {
                Some(op) => TokenKind::Operator(op),
                None => TokenKind::Symbol(symbol),
            }
        } else if c.is_alphanumeric() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match Keyword::from_word(&word) {
                Some(keyword) => TokenKind::Keyword(keyword),
                None => TokenKind::Word(word),
            }
        } else {
            while i < chars.len() && !is_boundary(chars[i]) {
                i += 1;
            }
            TokenKind::Symbol(chars[start..i].iter().collect())
        };

        tokens.push(Token { kind, index: start });
    }

    Ok(tokens)
}

fn is_boundary(c: char) -> bool {
    c.is_whitespace() || c == '\'' || c == '{' || c.is_alphanumeric()
}

fn find_char(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars
        .iter()
        .skip(from)
        .position(|c| *c == needle)
        .map(|offset| from + offset)
}

fn find_closing_braces(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len().saturating_sub(1)).find(|&j| chars[j] == '}' && chars[j + 1] == '}')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_simple_comparison() {
        assert_eq!(
            kinds("'F' == 'F'"),
            vec![
                TokenKind::Literal("F".to_string()),
                TokenKind::Operator(Operator::Eq),
                TokenKind::Literal("F".to_string()),
            ]
        );
    }

    #[test]
    fn test_keywords_inside_quotes_are_literals() {
        assert_eq!(
            kinds("'AND' == 'OR'"),
            vec![
                TokenKind::Literal("AND".to_string()),
                TokenKind::Operator(Operator::Eq),
                TokenKind::Literal("OR".to_string()),
            ]
        );
    }

    #[test]
    fn test_placeholder_with_quotes_and_parens() {
        let tokens = kinds("{{context.dicom.tags[('0010','0040')]}} == 'F'");
        assert_eq!(
            tokens[0],
            TokenKind::Placeholder("context.dicom.tags[('0010','0040')]".to_string())
        );
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_placeholder_body_is_trimmed() {
        assert_eq!(
            kinds("{{ context.input.bucket }}")[0],
            TokenKind::Placeholder("context.input.bucket".to_string())
        );
    }

    #[test]
    fn test_operators_without_spaces() {
        assert_eq!(
            kinds("'a'!='b'")[1],
            TokenKind::Operator(Operator::Ne)
        );
        assert_eq!(kinds("'a'=>'b'")[1], TokenKind::Operator(Operator::Ge));
    }

    #[test]
    fn test_unknown_symbols() {
        assert_eq!(kinds("'a' = 'b'")[1], TokenKind::Symbol("=".to_string()));
        assert_eq!(kinds("'a' ~ 'b'")[1], TokenKind::Symbol("~".to_string()));
        assert_eq!(kinds("'a' === 'b'")[1], TokenKind::Symbol("===".to_string()));
    }

    #[test]
    fn test_token_indices() {
        let tokens = tokenize("'a' == 'b' or 'c' < 'd'").unwrap();
        let indices: Vec<usize> = tokens.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 4, 7, 11, 14, 18, 20]);
    }

    #[test]
    fn test_unterminated_literal() {
        let err = tokenize("'a' == 'b").unwrap_err();
        assert!(matches!(
            err,
            ConditionError::MalformedExpression { index: 7, .. }
        ));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = tokenize("{{context.input == 'x'").unwrap_err();
        assert!(matches!(
            err,
            ConditionError::MalformedExpression { index: 0, .. }
        ));
    }
}
