use super::CompileError;

/// Lexical token of the rule expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
}

/// Tokenize an expression source string.
///
/// `and`/`or`/`not` are keyword synonyms for `&&`/`||`/`!`; `true` and
/// `false` lex as 1 and 0 since the language is numeric at its core.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;

        match c {
            ' ' | '\t' | '\r' | '\n' => pos += 1,
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::EqEq);
                    pos += 2;
                } else {
                    return Err(CompileError::new(pos, "expected '==' (assignment is not supported)"));
                }
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    pos += 2;
                } else {
                    tokens.push(Token::Not);
                    pos += 1;
                }
            }
            '&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    pos += 2;
                } else {
                    return Err(CompileError::new(pos, "expected '&&'"));
                }
            }
            '|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    pos += 2;
                } else {
                    return Err(CompileError::new(pos, "expected '||'"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = pos + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] as char != quote {
                    end += 1;
                }
                if end >= bytes.len() {
                    return Err(CompileError::new(pos, "unterminated string literal"));
                }
                tokens.push(Token::Str(source[start..end].to_string()));
                pos = end + 1;
            }
            '0'..='9' | '.' => {
                let start = pos;
                let mut end = pos;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_digit() || bytes[end] == b'.')
                {
                    end += 1;
                }
                let text = &source[start..end];
                let value: f64 = text
                    .parse()
                    .map_err(|_| CompileError::new(start, format!("invalid number {text:?}")))?;
                tokens.push(Token::Number(value));
                pos = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                let mut end = pos;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                let ident = &source[start..end];
                tokens.push(match ident {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Number(1.0),
                    "false" => Token::Number(0.0),
                    _ => Token::Ident(ident.to_string()),
                });
                pos = end;
            }
            other => {
                return Err(CompileError::new(
                    pos,
                    format!("unexpected character {other:?}"),
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_arithmetic() {
        let tokens = tokenize("amount * 2 + 1.5").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("amount".to_string()),
                Token::Star,
                Token::Number(2.0),
                Token::Plus,
                Token::Number(1.5),
            ]
        );
    }

    #[test]
    fn test_tokenize_comparison_and_logic() {
        let tokens = tokenize("amount > 100 && currency == 'USD'").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("amount".to_string()),
                Token::Gt,
                Token::Number(100.0),
                Token::And,
                Token::Ident("currency".to_string()),
                Token::EqEq,
                Token::Str("USD".to_string()),
            ]
        );
    }

    #[test]
    fn test_keyword_synonyms() {
        let tokens = tokenize("not a and b or true").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Not,
                Token::Ident("a".to_string()),
                Token::And,
                Token::Ident("b".to_string()),
                Token::Or,
                Token::Number(1.0),
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("currency == 'USD").is_err());
    }

    #[test]
    fn test_single_equals_rejected() {
        assert!(tokenize("amount = 5").is_err());
    }
}
