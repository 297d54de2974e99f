//! Tokenizer for the TypeScript subset accepted from learners.
//!
//! Whitespace and comments are not tokens; every token keeps its byte range
//! in the source so later passes can rewrite the original text in place.

use crate::core::traits::runner::CompileError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    String,
    /// A template literal without substitutions.
    Template,
    /// `` `...${ ``
    TemplateHead,
    /// `}...${`
    TemplateMiddle,
    /// `` }...` ``
    TemplateTail,
    Regex,
    Punct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub line: u32,
}

/// Maps byte offsets to 1-based line and column numbers.
#[derive(Debug)]
pub struct LineIndex<'a> {
    src: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(src: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(src.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();
        Self { src, line_starts }
    }

    pub fn line(&self, offset: usize) -> u32 {
        self.line_starts.partition_point(|&start| start <= offset) as u32
    }

    pub fn column(&self, offset: usize) -> u32 {
        let line_start = self.line_starts[self.line(offset) as usize - 1];
        let offset = offset.min(self.src.len());
        self.src
            .get(line_start..offset)
            .map_or(1, |prefix| prefix.chars().count() as u32 + 1)
    }

    pub fn error(&self, message: &str, offset: usize) -> CompileError {
        CompileError::at(message, self.line(offset), self.column(offset))
    }
}

const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".", "@",
];

/// Words after which a `/` starts a regular expression rather than a division.
const REGEX_PRECEDING_WORDS: &[&str] = &[
    "return",
    "typeof",
    "case",
    "do",
    "else",
    "in",
    "of",
    "new",
    "delete",
    "void",
    "throw",
    "instanceof",
    "yield",
    "await",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Brace {
    Block,
    Template,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    index: &'a LineIndex<'a>,
    tokens: Vec<Token>,
    braces: Vec<Brace>,
}

pub fn tokenize<'a>(src: &'a str, index: &'a LineIndex<'a>) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
        index,
        tokens: Vec::new(),
        braces: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_part(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric() || c == '\u{200c}' || c == '\u{200d}'
}

impl Lexer<'_> {
    fn run(&mut self) -> Result<(), CompileError> {
        if self.src.starts_with("#!") {
            self.pos = self.src.find('\n').unwrap_or(self.src.len());
        }

        loop {
            self.skip_trivia()?;
            let Some(c) = self.peek() else {
                return Ok(());
            };
            let start = self.pos;

            if is_ident_start(c) || (c == '#' && self.peek_at(1).is_some_and(is_ident_start)) {
                self.bump();
                self.eat_while(is_ident_part);
                self.push(TokenKind::Ident, start);
            } else if c.is_ascii_digit()
                || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit()))
            {
                self.number();
                self.push(TokenKind::Number, start);
            } else if c == '"' || c == '\'' {
                self.string(c)?;
                self.push(TokenKind::String, start);
            } else if c == '`' {
                self.bump();
                let kind = self.template_chunk(start, TokenKind::Template, TokenKind::TemplateHead)?;
                self.push(kind, start);
            } else if c == '/' && self.regex_allowed() {
                self.regex()?;
                self.push(TokenKind::Regex, start);
            } else if c == '}' && self.braces.last() == Some(&Brace::Template) {
                self.bump();
                let kind =
                    self.template_chunk(start, TokenKind::TemplateTail, TokenKind::TemplateMiddle)?;
                self.push(kind, start);
            } else {
                self.punct(start)?;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
    }

    fn push(&mut self, kind: TokenKind, start: usize) {
        self.tokens.push(Token {
            kind,
            start,
            end: self.pos,
            line: self.index.line(start),
        });
    }

    fn skip_trivia(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    self.eat_while(|c| c != '\n');
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start = self.pos;
                    match self.src[self.pos + 2..].find("*/") {
                        Some(end) => self.pos += end + 4,
                        None => return Err(self.index.error("'*/' expected", start)),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self) {
        let hex = self.src[self.pos..].starts_with("0x") || self.src[self.pos..].starts_with("0X");
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.bump();
                if !hex && (c == 'e' || c == 'E') && matches!(self.peek(), Some('+' | '-')) {
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<(), CompileError> {
        let start = self.pos;
        self.bump();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(()),
                Some('\\') => {
                    self.bump();
                }
                Some('\n') | None => {
                    return Err(self.index.error("Unterminated string literal", start));
                }
                Some(_) => {}
            }
        }
    }

    /// Scans template text after a backtick or a closing substitution brace.
    fn template_chunk(
        &mut self,
        start: usize,
        closed: TokenKind,
        open: TokenKind,
    ) -> Result<TokenKind, CompileError> {
        loop {
            match self.bump() {
                Some('`') => {
                    if closed == TokenKind::TemplateTail {
                        self.braces.pop();
                    }
                    return Ok(closed);
                }
                Some('\\') => {
                    self.bump();
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    if open == TokenKind::TemplateHead {
                        self.braces.push(Brace::Template);
                    }
                    return Ok(open);
                }
                Some(_) => {}
                None => return Err(self.index.error("Unterminated template literal", start)),
            }
        }
    }

    fn regex_allowed(&self) -> bool {
        let Some(prev) = self.tokens.last() else {
            return true;
        };
        let text = &self.src[prev.start..prev.end];
        match prev.kind {
            TokenKind::Punct => !matches!(text, ")" | "]" | "}" | "++" | "--"),
            TokenKind::Ident => REGEX_PRECEDING_WORDS.contains(&text),
            TokenKind::TemplateHead | TokenKind::TemplateMiddle => true,
            _ => false,
        }
    }

    fn regex(&mut self) -> Result<(), CompileError> {
        let start = self.pos;
        self.bump();
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump();
                }
                Some('[') => in_class = true,
                Some(']') => in_class = false,
                Some('/') if !in_class => break,
                Some('\n') | None => {
                    return Err(self
                        .index
                        .error("Unterminated regular expression literal", start));
                }
                Some(_) => {}
            }
        }
        self.eat_while(is_ident_part);
        Ok(())
    }

    fn punct(&mut self, start: usize) -> Result<(), CompileError> {
        let rest = &self.src[self.pos..];
        let Some(p) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) else {
            return Err(self.index.error("Invalid character", start));
        };
        // `a?.5:b` is a conditional, not optional chaining.
        let p = if *p == "?." && self.bytes.get(self.pos + 2).is_some_and(u8::is_ascii_digit) {
            "?"
        } else {
            p
        };
        if p == "@" {
            return Err(self.index.error("Decorators are not supported", start));
        }

        match p {
            "{" => self.braces.push(Brace::Block),
            "}" => {
                self.braces.pop();
            }
            _ => {}
        }
        self.pos += p.len();
        self.push(TokenKind::Punct, start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn lex(src: &str) -> Vec<(TokenKind, String)> {
        let index = LineIndex::new(src);
        tokenize(src, &index)
            .unwrap()
            .into_iter()
            .map(|t| (t.kind, src[t.start..t.end].to_string()))
            .collect()
    }

    fn lex_err(src: &str) -> CompileError {
        let index = LineIndex::new(src);
        tokenize(src, &index).unwrap_err()
    }

    #[test]
    fn test_skips_comments_and_whitespace() {
        let tokens = lex("let x = 1; // one\n/* two */ x++");

        assert_eq!(
            tokens.iter().map(|(_, text)| text).join(" "),
            "let x = 1 ; x ++"
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        let tokens = lex("a >>>= b ?? c?.d === e");

        assert_eq!(
            tokens.iter().map(|(_, text)| text).join(" "),
            "a >>>= b ?? c ?. d === e"
        );
    }

    #[test]
    fn test_division_and_regex() {
        let tokens = lex("const r = /a[/]b/gi; x = a / b / c; return /x/");

        let regexes = tokens
            .iter()
            .filter(|(kind, _)| *kind == TokenKind::Regex)
            .map(|(_, text)| text.as_str())
            .collect_vec();
        assert_eq!(regexes, vec!["/a[/]b/gi", "/x/"]);
    }

    #[test]
    fn test_template_with_substitutions() {
        let tokens = lex("`a ${ {b: 1}.b } c ${`nested ${d}`} e`");

        let kinds = tokens.iter().map(|(kind, _)| *kind).collect_vec();
        assert_eq!(kinds[0], TokenKind::TemplateHead);
        assert!(kinds.contains(&TokenKind::TemplateMiddle));
        assert_eq!(*kinds.last().unwrap(), TokenKind::TemplateTail);
        assert_eq!(tokens.last().unwrap().1, "} e`");
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("0xFF 1_000 1.5e-3 .25 10n");

        assert!(tokens.iter().all(|(kind, _)| *kind == TokenKind::Number));
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn test_unterminated_string_is_located() {
        let err = lex_err("let a = 1;\nlet s = 'open;\n");

        assert_eq!(err, CompileError::at("Unterminated string literal", 2, 9));
    }

    #[test]
    fn test_unterminated_template_and_comment() {
        assert_eq!(
            lex_err("let t = `abc").message,
            "Unterminated template literal"
        );
        assert_eq!(lex_err("x; /* never closed").message, "'*/' expected");
    }

    #[test]
    fn test_invalid_character() {
        assert_eq!(lex_err("let a = 1 \\ 2"), CompileError::at("Invalid character", 1, 11));
    }

    #[test]
    fn test_columns_count_characters() {
        let src = "let é = 'ü';\nlet b = \"";
        let err = lex_err(src);

        assert_eq!(err.location.unwrap().line, 2);
        assert_eq!(err.location.unwrap().column, Some(9));

        let index = LineIndex::new(src);
        assert_eq!(index.column(src.find('=').unwrap()), 7);
    }
}
