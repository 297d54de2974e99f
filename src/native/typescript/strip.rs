//! Type erasure for learner TypeScript.
//!
//! Works on the token stream and rewrites the original text in place: type
//! syntax is blanked out character by character, so every line and most
//! columns of the emitted JavaScript match the source the learner wrote.
//! Only enums and constructor parameter properties produce new code.

use super::lexer::{LineIndex, Token, TokenKind, tokenize};
use crate::core::traits::runner::CompileError;

/// Words that never end an operand, so a following `!`, `as` or `<` belongs
/// to the next expression.
const NON_OPERAND_WORDS: &[&str] = &[
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
    "let",
    "const",
    "var",
    "extends",
    "function",
    "class",
    "if",
    "while",
    "for",
    "switch",
    "try",
    "catch",
    "finally",
];

/// TypeScript-only member modifiers.
const MEMBER_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "readonly",
    "abstract",
    "override",
    "declare",
];

/// Modifiers that turn a constructor parameter into a property.
const PROPERTY_MODIFIERS: &[&str] = &["public", "private", "protected", "readonly", "override"];

/// Everything that may precede a member name in a class or object body.
const MEMBER_PREFIXES: &[&str] = &[
    "static",
    "async",
    "get",
    "set",
    "*",
    "accessor",
    "public",
    "private",
    "protected",
    "readonly",
    "abstract",
    "override",
    "declare",
];

/// Removes TypeScript syntax from `src`, leaving plain JavaScript.
pub fn strip_types(src: &str) -> Result<String, CompileError> {
    let index = LineIndex::new(src);
    let tokens = tokenize(src, &index)?;
    let pairs = match_brackets(src, &tokens, &index)?;
    Eraser::new(src, &tokens, &pairs, &index).run()
}

fn closer_for(kind: TokenKind, text: &str) -> char {
    match (kind, text) {
        (TokenKind::Punct, "(") => ')',
        (TokenKind::Punct, "[") => ']',
        _ => '}',
    }
}

/// Checks that brackets balance and nest, and pairs every opener with its
/// closer. A template head is paired with its tail.
fn match_brackets(
    src: &str,
    tokens: &[Token],
    index: &LineIndex,
) -> Result<Vec<Option<usize>>, CompileError> {
    let mut pairs = vec![None; tokens.len()];
    let mut open: Vec<(usize, Vec<usize>)> = Vec::new();

    for (i, tok) in tokens.iter().enumerate() {
        let text = &src[tok.start..tok.end];
        match (tok.kind, text) {
            (TokenKind::Punct, "(" | "[" | "{") | (TokenKind::TemplateHead, _) => {
                open.push((i, Vec::new()));
            }
            (TokenKind::TemplateMiddle, _) => match open.last_mut() {
                Some((opener, middles)) if tokens[*opener].kind == TokenKind::TemplateHead => {
                    middles.push(i);
                }
                Some((opener, _)) => {
                    let opener = tokens[*opener];
                    let expected = closer_for(opener.kind, &src[opener.start..opener.end]);
                    return Err(index.error(
                        &format!("Expected '{}' but found '}}'", expected),
                        tok.start,
                    ));
                }
                None => return Err(index.error("Unexpected '}'", tok.start)),
            },
            (TokenKind::Punct, ")" | "]" | "}") | (TokenKind::TemplateTail, _) => {
                let found = text.chars().next().unwrap_or('}');
                let Some((opener, middles)) = open.pop() else {
                    return Err(index.error(&format!("Unexpected '{}'", found), tok.start));
                };
                let opener_tok = tokens[opener];
                let expected = closer_for(opener_tok.kind, &src[opener_tok.start..opener_tok.end]);
                let template_mismatch =
                    (opener_tok.kind == TokenKind::TemplateHead) != (tok.kind == TokenKind::TemplateTail);
                if expected != found || template_mismatch {
                    return Err(index.error(
                        &format!("Expected '{}' but found '{}'", expected, found),
                        tok.start,
                    ));
                }
                pairs[opener] = Some(i);
                pairs[i] = Some(opener);
                for middle in middles {
                    pairs[middle] = Some(i);
                }
            }
            _ => {}
        }
    }

    match open.pop() {
        Some((opener, _)) => {
            let tok = tokens[opener];
            let text = if tok.kind == TokenKind::TemplateHead {
                "${"
            } else {
                &src[tok.start..tok.end]
            };
            Err(index.error(&format!("Unclosed '{}'", text), tok.start))
        }
        None => Ok(pairs),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameKind {
    Block,
    Object,
    ClassBody,
    Params,
    Group,
    Template,
}

/// A declaration whose parameter list is being read.
#[derive(Clone, Copy, Debug)]
struct Signature {
    start: usize,
    /// Overloads and abstract members have no body and vanish entirely.
    may_be_bodiless: bool,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    ternary: u32,
    decl: bool,
    signature: Option<Signature>,
    /// Names of constructor parameter properties.
    properties: Option<Vec<String>>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            ternary: 0,
            decl: false,
            signature: None,
            properties: None,
        }
    }

    fn params(signature: Option<Signature>, properties: Option<Vec<String>>) -> Self {
        Self {
            signature,
            properties,
            ..Self::new(FrameKind::Params)
        }
    }
}

/// `text: None` blanks the range; an empty range with text is an insertion.
#[derive(Debug)]
struct Edit {
    start: usize,
    end: usize,
    text: Option<String>,
}

#[derive(Debug)]
enum EnumValue {
    Number(f64),
    Computed(String),
    Text(String),
}

struct Eraser<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pairs: &'a [Option<usize>],
    index: &'a LineIndex<'a>,
    edits: Vec<Edit>,
    frames: Vec<Frame>,
    /// Last token that survives erasure.
    prev: Option<usize>,
    ternary_colon: Option<usize>,
    pending_function: Option<(usize, usize)>,
    pending_class: Option<usize>,
    pending_properties: Option<Vec<String>>,
}

fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.replace('_', "");
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(digits) = lower.strip_prefix("0x") {
        (digits, 16)
    } else if let Some(digits) = lower.strip_prefix("0b") {
        (digits, 2)
    } else if let Some(digits) = lower.strip_prefix("0o") {
        (digits, 8)
    } else {
        return text.parse().ok();
    };
    i64::from_str_radix(digits, radix).ok().map(|n| n as f64)
}

impl<'a> Eraser<'a> {
    fn new(
        src: &'a str,
        tokens: &'a [Token],
        pairs: &'a [Option<usize>],
        index: &'a LineIndex<'a>,
    ) -> Self {
        Self {
            src,
            tokens,
            pairs,
            index,
            edits: Vec::new(),
            frames: vec![Frame::new(FrameKind::Block)],
            prev: None,
            ternary_colon: None,
            pending_function: None,
            pending_class: None,
            pending_properties: None,
        }
    }

    fn run(mut self) -> Result<String, CompileError> {
        let mut i = 0;
        while i < self.tokens.len() {
            i = self.step(i)?;
        }
        Ok(self.render())
    }

    fn step(&mut self, i: usize) -> Result<usize, CompileError> {
        match self.tokens[i].kind {
            TokenKind::Ident => self.word(i),
            TokenKind::Punct => self.punct(i),
            TokenKind::TemplateHead => {
                self.frames.push(Frame::new(FrameKind::Template));
                self.keep(i)
            }
            TokenKind::TemplateMiddle => {
                self.frame_mut().ternary = 0;
                self.keep(i)
            }
            TokenKind::TemplateTail => {
                self.frames.pop();
                self.keep(i)
            }
            _ => self.keep(i),
        }
    }

    // Token helpers

    fn text(&self, i: usize) -> &'a str {
        let src: &'a str = self.src;
        self.tokens.get(i).map_or("", |tok| &src[tok.start..tok.end])
    }

    fn kind(&self, i: usize) -> Option<TokenKind> {
        self.tokens.get(i).map(|tok| tok.kind)
    }

    fn is(&self, i: usize, text: &str) -> bool {
        matches!(self.kind(i), Some(TokenKind::Punct | TokenKind::Ident)) && self.text(i) == text
    }

    fn same_line(&self, a: usize, b: usize) -> bool {
        match (self.tokens.get(a), self.tokens.get(b)) {
            (Some(a), Some(b)) => a.line == b.line,
            _ => false,
        }
    }

    fn pair(&self, i: usize) -> Result<usize, CompileError> {
        self.pairs
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| self.error_at("Type expected", i))
    }

    fn error_at(&self, message: &str, i: usize) -> CompileError {
        let offset = self.tokens.get(i).map_or(self.src.len(), |tok| tok.start);
        self.index.error(message, offset)
    }

    fn frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn depth(&self) -> usize {
        self.frames.len()
    }

    fn keep(&mut self, i: usize) -> Result<usize, CompileError> {
        self.prev = Some(i);
        Ok(i + 1)
    }

    fn is_expression_end(&self, i: usize) -> bool {
        match self.kind(i) {
            Some(TokenKind::Ident) => !NON_OPERAND_WORDS.contains(&self.text(i)),
            Some(TokenKind::Punct) => matches!(self.text(i), ")" | "]" | "}"),
            Some(TokenKind::TemplateHead | TokenKind::TemplateMiddle) | None => false,
            Some(_) => true,
        }
    }

    fn prev_ends_expression_on_line(&self, i: usize) -> bool {
        self.prev
            .is_some_and(|p| self.is_expression_end(p) && self.same_line(p, i))
    }

    fn at_statement_start(&self, i: usize) -> bool {
        let Some(p) = i.checked_sub(1) else {
            return true;
        };
        let on_new_line = self.tokens[p].line < self.tokens[i].line;
        match (self.tokens[p].kind, self.text(p)) {
            (TokenKind::Punct, ";" | "{" | "}") => true,
            (TokenKind::Punct, ")" | "]") => on_new_line,
            (TokenKind::Punct, _) => false,
            _ => on_new_line,
        }
    }

    /// For a member name at `name`, the index of the first token of the member.
    fn member_start(&self, name: usize) -> Option<usize> {
        let kind = self.frame().kind;
        if !matches!(kind, FrameKind::ClassBody | FrameKind::Object) {
            return None;
        }
        let mut q = match self.kind(name)? {
            TokenKind::Punct if self.is(name, "]") => self.pairs[name]?,
            TokenKind::Ident | TokenKind::String | TokenKind::Number => name,
            _ => return None,
        };
        while q > 0 && MEMBER_PREFIXES.contains(&self.text(q - 1)) {
            q -= 1;
        }

        let Some(before) = q.checked_sub(1) else {
            return Some(q);
        };
        let boundary = match self.text(before) {
            "{" | ";" | "}" => true,
            "," => kind == FrameKind::Object,
            _ => kind == FrameKind::ClassBody && !self.same_line(before, q),
        };
        boundary.then_some(q)
    }

    // Edits

    fn blank(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        self.edits
            .retain(|edit| edit.end <= start || edit.start >= end || edit.start == edit.end);
        self.edits.push(Edit {
            start,
            end,
            text: None,
        });
    }

    /// Blanks tokens `from..to`, including the trivia between them.
    fn blank_tokens(&mut self, from: usize, to: usize) {
        if from < to {
            self.blank(self.tokens[from].start, self.tokens[to - 1].end);
        }
    }

    fn replace(&mut self, start: usize, end: usize, text: String) {
        self.edits.push(Edit {
            start,
            end,
            text: Some(text),
        });
    }

    fn render(mut self) -> String {
        self.edits.sort_by_key(|edit| (edit.start, edit.end));
        let mut out = String::with_capacity(self.src.len());
        let mut pos = 0;

        for edit in self.edits {
            if edit.start < pos {
                continue;
            }
            out.push_str(&self.src[pos..edit.start]);
            let original = &self.src[edit.start..edit.end];
            match edit.text {
                None => out.extend(
                    original
                        .chars()
                        .map(|c| if c == '\n' || c == '\r' { c } else { ' ' }),
                ),
                Some(text) => {
                    let missing = original
                        .matches('\n')
                        .count()
                        .saturating_sub(text.matches('\n').count());
                    out.push_str(&text);
                    out.extend(std::iter::repeat_n('\n', missing));
                }
            }
            pos = edit.end;
        }

        out.push_str(&self.src[pos..]);
        out
    }

    // Identifiers and keywords

    fn word(&mut self, i: usize) -> Result<usize, CompileError> {
        let text = self.text(i);
        if i > 0 && (self.is(i - 1, ".") || self.is(i - 1, "?.")) {
            return self.keep(i);
        }

        let next_is_name = self.kind(i + 1) == Some(TokenKind::Ident) && self.same_line(i, i + 1);
        if next_is_name && self.at_statement_start(i) {
            match text {
                "interface" => return self.erase_interface(i),
                "type" if self.is(i + 2, "=") || self.is(i + 2, "<") => {
                    return self.erase_type_alias(i);
                }
                "declare" => return self.erase_declare(i),
                "enum" => return self.rewrite_enum(i, i + 1),
                "const" if self.is(i + 1, "enum") => return self.rewrite_enum(i, i + 2),
                "abstract" if self.is(i + 1, "class") => {
                    self.blank_tokens(i, i + 1);
                    return Ok(i + 1);
                }
                _ => {}
            }
        }

        let declares_binding = matches!(self.kind(i + 1), Some(TokenKind::Ident))
            || self.is(i + 1, "[")
            || self.is(i + 1, "{");
        let depth = self.depth();
        match text {
            "let" | "const" | "var" if declares_binding => self.frame_mut().decl = true,
            "in" | "of" => self.frame_mut().decl = false,
            "function" if !self.is(i + 1, ":") && !self.is(i + 1, ",") => {
                self.pending_function = Some((depth, i));
            }
            "class" if next_is_name || self.is(i + 1, "{") || self.is(i + 1, "<") => {
                self.pending_class = Some(depth);
            }
            "implements" if self.pending_class == Some(depth) => {
                return self.erase_implements(i);
            }
            "as" | "satisfies" if self.prev_ends_expression_on_line(i) => {
                if let Ok(end) = self.skip_type(i + 1) {
                    self.blank_tokens(i, end);
                    return Ok(end);
                }
            }
            _ => {}
        }

        let frame = self.frame();
        if frame.kind == FrameKind::ClassBody
            && MEMBER_MODIFIERS.contains(&text)
            && self.modifies_member(i)
        {
            self.blank_tokens(i, i + 1);
            return Ok(i + 1);
        }
        if frame.kind == FrameKind::Params
            && frame.properties.is_some()
            && PROPERTY_MODIFIERS.contains(&text)
            && self.kind(i + 1) == Some(TokenKind::Ident)
        {
            self.blank_tokens(i, i + 1);
            let name = self.text(i + 1);
            if !PROPERTY_MODIFIERS.contains(&name) {
                if let Some(properties) = self.frame_mut().properties.as_mut() {
                    properties.push(name.to_string());
                }
            }
            return Ok(i + 1);
        }
        if frame.kind == FrameKind::Params
            && text == "this"
            && self.is(i + 1, ":")
            && self.prev.is_some_and(|p| self.is(p, "("))
        {
            let end = self.skip_type(i + 2)?;
            let end = if self.is(end, ",") { end + 1 } else { end };
            self.blank_tokens(i, end);
            return Ok(end);
        }

        if self.is(i + 1, "<") {
            if let Some(end) = self.type_arguments(i) {
                self.prev = Some(i);
                self.blank_tokens(i + 1, end);
                return Ok(end);
            }
        }

        self.keep(i)
    }

    /// A modifier directly followed by the member it modifies.
    fn modifies_member(&self, i: usize) -> bool {
        let next = i + 1;
        self.same_line(i, next)
            && (matches!(
                self.kind(next),
                Some(TokenKind::Ident | TokenKind::String | TokenKind::Number)
            ) || self.is(next, "[")
                || self.is(next, "*"))
    }

    /// End of a type argument list following the identifier at `i`, when
    /// the list is there to be erased.
    fn type_arguments(&self, i: usize) -> Option<usize> {
        let end = self.skip_angle(i + 1)?;
        let depth = self.depth();
        let declares = self.pending_function.is_some_and(|(d, _)| d == depth)
            || self.pending_class == Some(depth);
        let member = self.member_start(i).is_some();
        let after_new = self.prev.is_some_and(|p| self.is(p, "new"));
        let call = self.is(end, "(");

        (declares || member || after_new || call).then_some(end)
    }

    // Punctuation

    fn punct(&mut self, i: usize) -> Result<usize, CompileError> {
        match self.text(i) {
            "(" => {
                let frame = self.classify_paren(i);
                self.frames.push(frame);
                self.keep(i)
            }
            "[" => {
                if self.frame().kind == FrameKind::ClassBody && self.is_index_signature(i) {
                    return self.erase_index_signature(i);
                }
                self.frames.push(Frame::new(FrameKind::Group));
                self.keep(i)
            }
            "{" => {
                self.open_brace(i);
                self.keep(i)
            }
            ")" | "]" | "}" => {
                let frame = self.frames.pop();
                self.prev = Some(i);
                match frame {
                    Some(frame) if frame.kind == FrameKind::Params => self.after_params(i, frame),
                    _ => Ok(i + 1),
                }
            }
            ":" => self.colon(i),
            "?" => self.question(i),
            "!" if self.prev.is_some_and(|p| {
                self.is_expression_end(p) && self.tokens[p].end == self.tokens[i].start
            }) =>
            {
                self.blank_tokens(i, i + 1);
                Ok(i + 1)
            }
            ";" => {
                self.frame_mut().decl = false;
                self.keep(i)
            }
            "<" => match self.generic_prefix(i).or_else(|| self.angle_assertion(i)) {
                Some(end) => {
                    self.blank_tokens(i, end);
                    Ok(end)
                }
                None => self.keep(i),
            },
            _ => self.keep(i),
        }
    }

    /// Type parameters of a class expression or a generic arrow function.
    fn generic_prefix(&self, i: usize) -> Option<usize> {
        if self.prev.is_some_and(|p| self.is_expression_end(p)) {
            return None;
        }
        let end = self.skip_angle(i)?;
        if self.pending_class == Some(self.depth()) && self.prev.is_some_and(|p| self.is(p, "class")) {
            return Some(end);
        }
        if !self.is(end, "(") {
            return None;
        }
        let close = self.pairs[end]?;
        let arrow = self.is(close + 1, "=>")
            || (self.is(close + 1, ":")
                && self
                    .skip_type(close + 2)
                    .is_ok_and(|after| self.is(after, "=>")));
        arrow.then_some(end)
    }

    /// `<T>expr`, the prefix form of `expr as T`.
    fn angle_assertion(&self, i: usize) -> Option<usize> {
        if self.prev.is_some_and(|p| self.is_expression_end(p)) {
            return None;
        }
        let end = self.skip_angle(i)?;
        self.is_operand_start(end).then_some(end)
    }

    fn is_operand_start(&self, i: usize) -> bool {
        match self.kind(i) {
            Some(TokenKind::Ident) => !matches!(self.text(i), "in" | "of" | "instanceof" | "extends"),
            Some(TokenKind::Punct) => {
                matches!(self.text(i), "(" | "[" | "{" | "!" | "~" | "-" | "+" | "<")
            }
            Some(_) => true,
            None => false,
        }
    }

    fn classify_paren(&mut self, i: usize) -> Frame {
        let depth = self.depth();
        if let Some((d, start)) = self.pending_function {
            if d == depth {
                self.pending_function = None;
                let signature = Signature {
                    start,
                    may_be_bodiless: self.at_statement_start(start),
                };
                return Frame::params(Some(signature), None);
            }
        }

        let Some(p) = self.prev else {
            return Frame::new(FrameKind::Group);
        };
        if self.is(p, "catch") {
            return Frame::params(None, None);
        }
        if let Some(start) = self.member_start(p) {
            let in_class = self.frame().kind == FrameKind::ClassBody;
            let signature = Signature {
                start,
                may_be_bodiless: in_class,
            };
            let properties = (in_class && self.is(p, "constructor")).then(Vec::new);
            return Frame::params(Some(signature), properties);
        }

        let Some(close) = self.pairs[i] else {
            return Frame::new(FrameKind::Group);
        };
        let arrow = self.is(close + 1, "=>")
            || (self.is(close + 1, ":")
                && self
                    .skip_type(close + 2)
                    .is_ok_and(|after| self.is(after, "=>")));
        if arrow {
            Frame::params(None, None)
        } else {
            Frame::new(FrameKind::Group)
        }
    }

    fn after_params(&mut self, close: usize, frame: Frame) -> Result<usize, CompileError> {
        let mut j = close + 1;
        if self.is(j, ":") {
            let end = self.skip_type(j + 1)?;
            self.blank_tokens(j, end);
            j = end;
        }

        if let Some(signature) = frame.signature {
            let has_body = self.is(j, "{") || self.is(j, "=>");
            if !has_body && signature.may_be_bodiless {
                let end = if self.is(j, ";") { j + 1 } else { j };
                self.blank_tokens(signature.start, end);
                self.prev = signature.start.checked_sub(1);
                return Ok(end);
            }
        }

        if let Some(properties) = frame.properties.filter(|p| !p.is_empty()) {
            if self.is(j, "{") {
                self.pending_properties = Some(properties);
            }
        }
        Ok(j)
    }

    fn open_brace(&mut self, i: usize) {
        let depth = self.depth();
        let kind = if self.pending_class == Some(depth) {
            self.pending_class = None;
            FrameKind::ClassBody
        } else if self.opens_block() {
            FrameKind::Block
        } else {
            FrameKind::Object
        };
        self.frames.push(Frame::new(kind));

        if kind == FrameKind::Block {
            if let Some(properties) = self.pending_properties.take() {
                self.insert_properties(i, &properties);
            }
        }
    }

    fn opens_block(&self) -> bool {
        let Some(p) = self.prev else {
            return true;
        };
        match (self.tokens[p].kind, self.text(p)) {
            (TokenKind::Punct, ")" | ";" | "{" | "}" | "=>") => true,
            (TokenKind::Punct, ":") => {
                self.ternary_colon != Some(p) && self.frame().kind == FrameKind::Block
            }
            (TokenKind::Punct, _) => false,
            (TokenKind::Ident, word) => {
                !NON_OPERAND_WORDS.contains(&word) || matches!(word, "else" | "do" | "try" | "finally")
            }
            _ => false,
        }
    }

    fn insert_properties(&mut self, open: usize, properties: &[String]) {
        let assignments: String = properties
            .iter()
            .map(|name| format!(" this.{0} = {0};", name))
            .collect();

        let mut at = self.tokens[open].end;
        let mut text = assignments.clone();
        if self.is(open + 1, "super") && self.is(open + 2, "(") {
            if let Some(close) = self.pairs[open + 2] {
                if self.is(close + 1, ";") {
                    at = self.tokens[close + 1].end;
                } else {
                    at = self.tokens[close].end;
                    text = format!(";{}", assignments);
                }
            }
        }
        self.replace(at, at, text);
    }

    fn colon(&mut self, i: usize) -> Result<usize, CompileError> {
        if self.frame().ternary > 0 {
            self.frame_mut().ternary -= 1;
            self.ternary_colon = Some(i);
            return self.keep(i);
        }

        let annotates = match self.frame().kind {
            FrameKind::Params | FrameKind::ClassBody => true,
            _ => self.prev.is_some_and(|p| self.is_declared_binding(p)),
        };
        if annotates {
            let end = self.skip_type(i + 1)?;
            self.blank_tokens(i, end);
            Ok(end)
        } else {
            self.keep(i)
        }
    }

    /// Whether `p` ends a binding introduced by `let`, `const` or `var`.
    fn is_declared_binding(&self, p: usize) -> bool {
        let start = if self.is(p, "]") || self.is(p, "}") {
            match self.pairs[p] {
                Some(opener) => opener,
                None => return false,
            }
        } else if self.kind(p) == Some(TokenKind::Ident) {
            p
        } else {
            return false;
        };
        let Some(before) = start.checked_sub(1) else {
            return false;
        };
        matches!(self.text(before), "let" | "const" | "var")
            || (self.is(before, ",") && self.frame().decl)
    }

    fn question(&mut self, i: usize) -> Result<usize, CompileError> {
        let optional = match self.frame().kind {
            FrameKind::Params => {
                self.is(i + 1, ":") || self.is(i + 1, ",") || self.is(i + 1, ")")
            }
            FrameKind::ClassBody => self.prev.is_some_and(|p| self.member_start(p).is_some()),
            _ => false,
        };
        if optional {
            self.blank_tokens(i, i + 1);
            Ok(i + 1)
        } else {
            self.frame_mut().ternary += 1;
            self.keep(i)
        }
    }

    // Declarations without a runtime counterpart

    fn erase_interface(&mut self, i: usize) -> Result<usize, CompileError> {
        let mut j = i + 2;
        if self.is(j, "<") {
            j = self
                .skip_angle(j)
                .ok_or_else(|| self.error_at("'>' expected", j))?;
        }
        if self.is(j, "extends") {
            j = self.skip_type(j + 1)?;
            while self.is(j, ",") {
                j = self.skip_type(j + 1)?;
            }
        }
        if !self.is(j, "{") {
            return Err(self.error_at("'{' expected", j));
        }
        let end = self.pair(j)? + 1;
        self.blank_tokens(i, end);
        Ok(end)
    }

    fn erase_type_alias(&mut self, i: usize) -> Result<usize, CompileError> {
        let mut j = i + 2;
        if self.is(j, "<") {
            j = self
                .skip_angle(j)
                .ok_or_else(|| self.error_at("'>' expected", j))?;
        }
        if !self.is(j, "=") {
            return Err(self.error_at("'=' expected", j));
        }
        let mut end = self.skip_type(j + 1)?;
        if self.is(end, ";") {
            end += 1;
        }
        self.blank_tokens(i, end);
        Ok(end)
    }

    /// `declare` statements end at `;`, at the end of a braced body, or at the
    /// end of the line.
    fn erase_declare(&mut self, i: usize) -> Result<usize, CompileError> {
        let mut j = i + 1;
        while j < self.tokens.len() {
            if j > i + 2 && !self.same_line(j - 1, j) {
                let continues = self.kind(j - 1) == Some(TokenKind::Punct)
                    && !matches!(self.text(j - 1), ")" | "]" | "}");
                if !continues {
                    break;
                }
            }
            if self.is(j, ";") {
                j += 1;
                break;
            }
            if self.is(j, "{") {
                j = self.pair(j)? + 1;
                if self.is(j, ";") {
                    j += 1;
                }
                break;
            }
            j = match self.pairs[j] {
                Some(close) if close > j => close + 1,
                _ => j + 1,
            };
        }
        self.blank_tokens(i, j);
        Ok(j)
    }

    fn erase_implements(&mut self, i: usize) -> Result<usize, CompileError> {
        let mut j = i + 1;
        while j < self.tokens.len() && !self.is(j, "{") {
            j = match self.pairs[j] {
                Some(close) if close > j => close + 1,
                _ => j + 1,
            };
        }
        self.blank_tokens(i, j);
        Ok(j)
    }

    fn is_index_signature(&self, i: usize) -> bool {
        let Some(before) = i.checked_sub(1) else {
            return false;
        };
        let at_member = matches!(self.text(before), "{" | ";" | "}" | "readonly" | "static")
            || !self.same_line(before, i);
        at_member && self.kind(i + 1) == Some(TokenKind::Ident) && self.is(i + 2, ":")
    }

    fn erase_index_signature(&mut self, i: usize) -> Result<usize, CompileError> {
        let close = self.pair(i)?;
        if !self.is(close + 1, ":") {
            return Err(self.error_at("':' expected", close + 1));
        }
        let mut end = self.skip_type(close + 2)?;
        if self.is(end, ";") {
            end += 1;
        }
        self.blank_tokens(i, end);
        Ok(end)
    }

    // Enums

    fn rewrite_enum(&mut self, start: usize, name: usize) -> Result<usize, CompileError> {
        let open = name + 1;
        if !self.is(open, "{") {
            return Err(self.error_at("'{' expected", open));
        }
        let close = self.pair(open)?;
        let ident = self.text(name);

        self.replace(
            self.tokens[start].start,
            self.tokens[open].end,
            format!("var {0}; (function ({0}) {{", ident),
        );

        let mut members: Vec<String> = Vec::new();
        let mut last: Option<EnumValue> = None;
        let mut j = open + 1;
        while j < close {
            let member = match self.kind(j) {
                Some(TokenKind::Ident) => self.text(j).to_string(),
                Some(TokenKind::String) => {
                    let quoted = self.text(j);
                    quoted[1..quoted.len() - 1].to_string()
                }
                _ => return Err(self.error_at("Enum member expected", j)),
            };
            let key = js_string(&member);
            let name_tok = j;
            j += 1;

            let value = if self.is(j, "=") {
                let expr_start = j + 1;
                let mut k = expr_start;
                while k < close && !self.is(k, ",") {
                    k = match self.pairs[k] {
                        Some(pair) if pair > k => pair + 1,
                        _ => k + 1,
                    };
                }
                if k == expr_start {
                    return Err(self.error_at("Expression expected", k));
                }
                j = k;
                self.enum_initializer(ident, &members, expr_start, k)
            } else {
                match &last {
                    None => EnumValue::Number(0.0),
                    Some(EnumValue::Number(n)) => EnumValue::Number(n + 1.0),
                    Some(EnumValue::Computed(_)) => EnumValue::Computed(format!(
                        "{}[{}] + 1",
                        ident,
                        js_string(members.last().map_or("", String::as_str))
                    )),
                    Some(EnumValue::Text(_)) => {
                        return Err(self.error_at("Enum member must have initializer", name_tok));
                    }
                }
            };

            let code = match &value {
                EnumValue::Number(n) => {
                    format!("{0}[{0}[{1}] = {2}] = {1};", ident, key, format_number(*n))
                }
                EnumValue::Computed(expr) => format!("{0}[{0}[{1}] = {2}] = {1};", ident, key, expr),
                EnumValue::Text(literal) => format!("{0}[{1}] = {2};", ident, key, literal),
            };
            self.replace(self.tokens[name_tok].start, self.tokens[j - 1].end, code);

            if self.is(j, ",") {
                self.blank_tokens(j, j + 1);
                j += 1;
            } else if j != close {
                return Err(self.error_at("',' expected", j));
            }
            members.push(member);
            last = Some(value);
        }

        self.replace(
            self.tokens[close].start,
            self.tokens[close].end,
            format!("}})({0} || ({0} = {{}}));", ident),
        );
        self.prev = Some(close);
        Ok(close + 1)
    }

    fn enum_initializer(&self, ident: &str, members: &[String], from: usize, to: usize) -> EnumValue {
        let single = to - from == 1;
        match self.kind(from) {
            Some(TokenKind::Number) if single => {
                if let Some(n) = parse_number(self.text(from)) {
                    return EnumValue::Number(n);
                }
            }
            Some(TokenKind::String | TokenKind::Template) if single => {
                return EnumValue::Text(self.text(from).to_string());
            }
            Some(TokenKind::Punct)
                if to - from == 2
                    && self.is(from, "-")
                    && self.kind(from + 1) == Some(TokenKind::Number) =>
            {
                if let Some(n) = parse_number(self.text(from + 1)) {
                    return EnumValue::Number(-n);
                }
            }
            _ => {}
        }

        let mut expr = String::new();
        for k in from..to {
            if k > from {
                expr.push_str(&self.src[self.tokens[k - 1].end..self.tokens[k].start]);
            }
            let text = self.text(k);
            let member_ref = self.kind(k) == Some(TokenKind::Ident)
                && members.iter().any(|m| m == text)
                && !(k > from && self.is(k - 1, "."));
            if member_ref {
                expr.push_str(&format!("{}.{}", ident, text));
            } else {
                expr.push_str(text);
            }
        }
        EnumValue::Computed(expr)
    }

    // Types

    /// Index of the first token after the type starting at `i`.
    fn skip_type(&self, i: usize) -> Result<usize, CompileError> {
        let mut i = i;
        if self.is(i, "|") || self.is(i, "&") {
            i += 1;
        }
        loop {
            i = self.skip_type_operand(i)?;
            if self.is(i, "|") || self.is(i, "&") {
                i += 1;
                continue;
            }
            if self.is(i, "extends") && self.same_line(i - 1, i) {
                let check = self.skip_type_operand(i + 1)?;
                if !self.is(check, "?") {
                    return Err(self.error_at("'?' expected", check));
                }
                let then = self.skip_type(check + 1)?;
                if !self.is(then, ":") {
                    return Err(self.error_at("':' expected", then));
                }
                return self.skip_type(then + 1);
            }
            return Ok(i);
        }
    }

    fn skip_type_operand(&self, i: usize) -> Result<usize, CompileError> {
        let mut i = i;
        while matches!(
            self.text(i),
            "keyof" | "readonly" | "unique" | "infer" | "asserts"
        ) && self.kind(i) == Some(TokenKind::Ident)
            && (self.kind(i + 1) == Some(TokenKind::Ident)
                || self.is(i + 1, "(")
                || self.is(i + 1, "[")
                || self.is(i + 1, "{"))
        {
            i += 1;
        }

        let Some(kind) = self.kind(i) else {
            return Err(self.error_at("Type expected", i));
        };
        let mut end = match (kind, self.text(i)) {
            (TokenKind::Punct, "(") => {
                let close = self.pair(i)?;
                if self.is(close + 1, "=>") {
                    return self.skip_type(close + 2);
                }
                close + 1
            }
            (TokenKind::Punct, "[" | "{") | (TokenKind::TemplateHead, _) => self.pair(i)? + 1,
            (TokenKind::Punct, "<") => {
                let params = self
                    .skip_angle(i)
                    .ok_or_else(|| self.error_at("'>' expected", i))?;
                if !self.is(params, "(") {
                    return Err(self.error_at("'(' expected", params));
                }
                let close = self.pair(params)?;
                if !self.is(close + 1, "=>") {
                    return Err(self.error_at("'=>' expected", close + 1));
                }
                return self.skip_type(close + 2);
            }
            (TokenKind::Punct, "-") if self.kind(i + 1) == Some(TokenKind::Number) => i + 2,
            (TokenKind::Number | TokenKind::String | TokenKind::Template, _) => i + 1,
            (TokenKind::Ident, "new") => return self.skip_type_operand(i + 1),
            (TokenKind::Ident, "typeof") if self.kind(i + 1) == Some(TokenKind::Ident) => {
                self.skip_entity(i + 1)?
            }
            (TokenKind::Ident, _) => {
                let j = self.skip_entity(i)?;
                if self.is(j, "is") && self.same_line(i, j) {
                    return self.skip_type(j + 1);
                }
                j
            }
            _ => return Err(self.error_at("Type expected", i)),
        };

        while self.is(end, "[") && self.same_line(end - 1, end) {
            end = self.pair(end)? + 1;
        }
        Ok(end)
    }

    /// End of a dotted name such as `a.b.C<T>` or `import('m').C` starting at `i`.
    fn skip_entity(&self, i: usize) -> Result<usize, CompileError> {
        let mut j = if self.is(i, "import") && self.is(i + 1, "(") {
            self.pair(i + 1)? + 1
        } else {
            i + 1
        };
        while self.is(j, ".") && self.kind(j + 1) == Some(TokenKind::Ident) {
            j += 2;
        }
        if self.is(j, "<") {
            if let Some(end) = self.skip_angle(j) {
                j = end;
            }
        }
        Ok(j)
    }

    /// Index after the `>` closing the angle list opened at `i`, or `None`
    /// when the tokens cannot be a type parameter or argument list.
    fn skip_angle(&self, i: usize) -> Option<usize> {
        let mut depth: i32 = 0;
        let mut j = i;
        while let Some(tok) = self.tokens.get(j) {
            let text = self.text(j);
            match (tok.kind, text) {
                (TokenKind::Punct, "<") => depth += 1,
                (TokenKind::Punct, ">" | ">>" | ">>>") => {
                    depth -= text.len() as i32;
                    if depth == 0 {
                        return Some(j + 1);
                    }
                    if depth < 0 {
                        return None;
                    }
                }
                (TokenKind::Punct, "(" | "[" | "{") | (TokenKind::TemplateHead, _) => {
                    j = self.pairs[j]?;
                }
                (
                    TokenKind::Punct,
                    "," | "." | "|" | "&" | "=>" | "=" | "?" | ":" | "-" | "...",
                ) => {}
                (
                    TokenKind::Ident | TokenKind::Number | TokenKind::String | TokenKind::Template,
                    _,
                ) => {}
                _ => return None,
            }
            j += 1;
        }
        None
    }
}
