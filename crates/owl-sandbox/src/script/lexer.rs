use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: usize,
}

const OPS3: &[&str] = &["**=", "//="];
const OPS2: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=",
];
const OPS1: &[&str] = &[
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

/// Split source into tokens, turning leading whitespace into
/// `Indent`/`Dedent` pairs. Newlines inside brackets are ignored.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        let needs = matches!(
            self.tokens.last(),
            Some(t) if !matches!(t.tok, Tok::Newline | Tok::Indent | Tok::Dedent)
        );
        if needs {
            self.push(Tok::Newline);
        }
    }

    fn run(&mut self) -> Result<(), ScriptError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            let c = self.chars[self.pos];
            match c {
                '\n' => {
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '0'..='9' => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.name(),
                '"' | '\'' => self.string(c)?,
                _ => self.operator()?,
            }
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measure the indentation of a logical line. Returns false when the
    /// line was blank or a comment and has been consumed.
    fn indentation(&mut self) -> Result<bool, ScriptError> {
        let mut col = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => col += 1,
                '\t' => col += 8 - col % 8,
                '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }

        let current = *self.indents.last().unwrap_or(&0);
        if col > current {
            self.indents.push(col);
            self.push(Tok::Indent);
        } else {
            while col < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if col != *self.indents.last().unwrap_or(&0) {
                return Err(ScriptError::syntax(self.line, "inconsistent indentation"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<(), ScriptError> {
        let mut text = String::new();
        let mut is_float = false;

        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '_' {
                // digit separator
            } else if c == '.' && !is_float && self.peek(1).is_some_and(|n| n.is_ascii_digit()) {
                is_float = true;
                text.push(c);
            } else if (c == 'e' || c == 'E') && !text.contains('e') {
                let sign = matches!(self.peek(1), Some('+') | Some('-'));
                let digit_at = if sign { 2 } else { 1 };
                if !self.peek(digit_at).is_some_and(|n| n.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                text.push('e');
                if sign {
                    self.pos += 1;
                    text.push(self.chars[self.pos]);
                }
            } else {
                break;
            }
            self.pos += 1;
        }

        let tok = if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| ScriptError::syntax(self.line, format!("bad number '{}'", text)))?;
            Tok::Float(value)
        } else {
            let value = text.parse::<i64>().map_err(|_| {
                ScriptError::syntax(self.line, format!("integer literal too large: {}", text))
            })?;
            Tok::Int(value)
        };
        self.push(tok);
        Ok(())
    }

    fn name(&mut self) {
        let mut text = String::new();
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(Tok::Name(text));
    }

    fn string(&mut self, quote: char) -> Result<(), ScriptError> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            let c = match self.peek(0) {
                None | Some('\n') => {
                    return Err(ScriptError::syntax(self.line, "unterminated string"));
                }
                Some(c) => c,
            };
            self.pos += 1;
            if c == quote {
                break;
            }
            if c == '\\' {
                let escaped = self
                    .peek(0)
                    .ok_or_else(|| ScriptError::syntax(self.line, "unterminated string"))?;
                self.pos += 1;
                let ch = match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    '\\' => '\\',
                    '\'' => '\'',
                    '"' => '"',
                    // unknown escapes keep their backslash
                    other => {
                        text.push('\\');
                        other
                    }
                };
                text.push(ch);
            } else {
                text.push(c);
            }
        }
        self.push(Tok::Str(text));
        Ok(())
    }

    fn operator(&mut self) -> Result<(), ScriptError> {
        for (width, table) in [(3, OPS3), (2, OPS2), (1, OPS1)] {
            if self.pos + width > self.chars.len() {
                continue;
            }
            let candidate: String = self.chars[self.pos..self.pos + width].iter().collect();
            if let Some(op) = table.iter().find(|op| **op == candidate) {
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => {
                        if self.depth == 0 {
                            return Err(ScriptError::syntax(
                                self.line,
                                format!("unmatched '{}'", op),
                            ));
                        }
                        self.depth -= 1;
                    }
                    _ => {}
                }
                self.pos += width;
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        Err(ScriptError::syntax(
            self.line,
            format!("unexpected character '{}'", self.chars[self.pos]),
        ))
    }
}
