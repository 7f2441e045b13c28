//! Lexical scanning of SQL scripts.
//!
//! Used for syntax highlighting (token offsets and coarse token classes) and
//! for cutting multi-statement scripts at top-level semicolons. Nothing here
//! touches the engine.

use serde::Serialize;
use sqlparser::dialect::DuckDbDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, Whitespace};
use tracing::debug;

use crate::error::WebDbError;

/// Coarse token classes, numbered the way highlighters expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenType {
    Identifier = 0,
    NumericConstant = 1,
    StringConstant = 2,
    Operator = 3,
    Keyword = 4,
    Comment = 5,
}

/// Token start offsets and types as two aligned arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptTokens {
    pub offsets: Vec<u32>,
    pub types: Vec<u8>,
}

impl ScriptTokens {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn to_json(&self) -> Result<String, WebDbError> {
        serde_json::to_string(self)
            .map_err(|err| WebDbError::Conversion(format!("failed to encode tokens: {err}")))
    }
}

/// A token with its byte offset into the scanned text.
struct LocatedToken {
    offset: usize,
    token: Token,
}

/// Tokenize `text`. Tokens recognized before a lexing error are still returned.
pub fn tokenize(text: &str) -> ScriptTokens {
    collect_tokens(scan(text).0)
}

/// Offsets are `u32`; scanning stops at the first token that starts beyond that range.
fn collect_tokens(located: Vec<LocatedToken>) -> ScriptTokens {
    let mut tokens = ScriptTokens::default();
    for located in located {
        let Some(token_type) = classify(&located.token) else {
            continue;
        };
        let Ok(offset) = u32::try_from(located.offset) else {
            debug!(offset = located.offset, "token offset out of range, stopping");
            break;
        };
        tokens.offsets.push(offset);
        tokens.types.push(token_type as u8);
    }
    tokens
}

/// Split a script into statements at top-level semicolons.
///
/// Statements holding only whitespace or comments are dropped. Text that does
/// not lex is returned whole so the engine can report the problem.
pub fn split_statements(text: &str) -> Vec<&str> {
    let (located, complete) = scan(text);
    if !complete {
        return if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![text]
        };
    }

    let mut statements = Vec::new();
    let mut start = 0usize;
    let mut has_content = false;
    for token in located {
        match token.token {
            Token::SemiColon => {
                if has_content {
                    statements.push(text[start..token.offset].trim());
                }
                start = token.offset + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }
    if has_content {
        statements.push(text[start..].trim());
    }
    statements
}

fn scan(text: &str) -> (Vec<LocatedToken>, bool) {
    let dialect = DuckDbDialect {};
    let mut raw: Vec<TokenWithSpan> = Vec::new();
    let complete = match Tokenizer::new(&dialect, text).tokenize_with_location_into_buf(&mut raw)
    {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, recognized = raw.len(), "tokenizer stopped early");
            false
        }
    };

    let mut cursor = OffsetCursor::new(text);
    let located = raw
        .into_iter()
        .map(|token| LocatedToken {
            offset: cursor.advance_to(token.span.start),
            token: token.token,
        })
        .collect();
    (located, complete)
}

fn classify(token: &Token) -> Option<TokenType> {
    let token_type = match token {
        Token::EOF => return None,
        Token::Whitespace(Whitespace::SingleLineComment { .. })
        | Token::Whitespace(Whitespace::MultiLineComment(_)) => TokenType::Comment,
        Token::Whitespace(_) => return None,
        Token::Word(word) if word.quote_style.is_none() && word.keyword != Keyword::NoKeyword => {
            TokenType::Keyword
        }
        Token::Word(_) => TokenType::Identifier,
        Token::Number(_, _) => TokenType::NumericConstant,
        Token::SingleQuotedString(_)
        | Token::DoubleQuotedString(_)
        | Token::DollarQuotedString(_)
        | Token::NationalStringLiteral(_)
        | Token::EscapedStringLiteral(_)
        | Token::HexStringLiteral(_) => TokenType::StringConstant,
        _ => TokenType::Operator,
    };
    Some(token_type)
}

/// Converts tokenizer line/column locations into byte offsets.
///
/// Locations are 1-based and count characters; tokens arrive in order, so the
/// cursor only ever moves forward.
struct OffsetCursor<'a> {
    chars: std::str::CharIndices<'a>,
    len: usize,
    line: u64,
    column: u64,
    offset: usize,
}

impl<'a> OffsetCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices(),
            len: text.len(),
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    fn advance_to(&mut self, target: Location) -> usize {
        while (self.line, self.column) < (target.line, target.column) {
            match self.chars.next() {
                Some((index, ch)) => {
                    self.offset = index + ch.len_utf8();
                    if ch == '\n' {
                        self.line += 1;
                        self.column = 1;
                    } else {
                        self.column += 1;
                    }
                }
                None => {
                    self.offset = self.len;
                    break;
                }
            }
        }
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_one_yields_aligned_non_decreasing_arrays() {
        let tokens = tokenize("SELECT 1");
        assert_eq!(tokens.offsets, vec![0, 7]);
        assert_eq!(
            tokens.types,
            vec![TokenType::Keyword as u8, TokenType::NumericConstant as u8]
        );
        assert!(tokens.offsets.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn classifies_strings_identifiers_operators_and_comments() {
        let sql = "select \"Col\", 'x' -- note\nFROM t WHERE a >= 2";
        let tokens = tokenize(sql);
        assert_eq!(tokens.offsets.len(), tokens.types.len());

        let kinds: Vec<(usize, u8)> = tokens
            .offsets
            .iter()
            .map(|offset| *offset as usize)
            .zip(tokens.types.iter().copied())
            .collect();
        assert!(kinds.contains(&(7, TokenType::Identifier as u8)));
        assert!(kinds.contains(&(12, TokenType::Operator as u8)));
        assert!(kinds.contains(&(14, TokenType::StringConstant as u8)));
        assert!(kinds.contains(&(18, TokenType::Comment as u8)));
        let from = sql.find("FROM").map(|pos| pos as u32);
        assert_eq!(
            from.and_then(|pos| tokens.offsets.iter().position(|o| *o == pos))
                .map(|idx| tokens.types[idx]),
            Some(TokenType::Keyword as u8)
        );
    }

    #[test]
    fn offsets_are_byte_positions_for_multibyte_text() {
        let sql = "SELECT 'é', x";
        let tokens = tokenize(sql);
        let x_offset = sql.rfind('x').map(|pos| pos as u32);
        assert_eq!(tokens.offsets.last().copied(), x_offset);
    }

    #[test]
    fn unterminated_string_keeps_tokens_before_the_error() {
        let tokens = tokenize("SELECT 'oops");
        assert_eq!(tokens.offsets.first().copied(), Some(0));
        assert_eq!(tokens.types.first().copied(), Some(TokenType::Keyword as u8));
    }

    #[test]
    fn tokens_past_the_u32_range_are_dropped() {
        let far = u32::MAX as usize + 1;
        let located = vec![
            LocatedToken {
                offset: 0,
                token: Token::make_keyword("SELECT"),
            },
            LocatedToken {
                offset: far,
                token: Token::Number("1".to_string(), false),
            },
            LocatedToken {
                offset: far + 2,
                token: Token::Comma,
            },
        ];
        let tokens = collect_tokens(located);
        assert_eq!(tokens.offsets, vec![0]);
        assert_eq!(tokens.types, vec![TokenType::Keyword as u8]);
    }

    #[test]
    fn json_has_two_arrays() -> Result<(), WebDbError> {
        let json = tokenize("SELECT 1").to_json()?;
        assert_eq!(json, r#"{"offsets":[0,7],"types":[4,1]}"#);
        Ok(())
    }

    #[test]
    fn split_statements_ignores_semicolons_in_strings_and_empty_statements() {
        let statements =
            split_statements("CREATE TABLE t (s VARCHAR); ; INSERT INTO t VALUES ('a;b');\n-- done\n");
        assert_eq!(
            statements,
            vec!["CREATE TABLE t (s VARCHAR)", "INSERT INTO t VALUES ('a;b')"]
        );
    }

    #[test]
    fn split_statements_returns_unlexable_text_whole() {
        assert_eq!(split_statements("SELECT 'x"), vec!["SELECT 'x"]);
        assert!(split_statements("   ").is_empty());
    }
}
