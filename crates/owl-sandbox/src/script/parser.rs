use super::lexer::{tokenize, Tok, Token};
use super::value::ScriptValue;
use super::{ScriptError, BUILTINS, METHODS};

/// Deepest expression or block nesting accepted.
const MAX_NESTING: usize = 64;

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    fn from_token(op: &str) -> Option<Self> {
        Some(match op {
            "+" | "+=" => Self::Add,
            "-" | "-=" => Self::Sub,
            "*" | "*=" => Self::Mul,
            "/" | "/=" => Self::Div,
            "//" | "//=" => Self::FloorDiv,
            "%" | "%=" => Self::Mod,
            "**" | "**=" => Self::Pow,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(ScriptValue),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    IfElse {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Method {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        value: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
    },
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Subscript { value: Expr, index: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign {
        target: Target,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
    },
    Expr(Expr),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
    },
    For {
        vars: Vec<String>,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
    Pass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

/// A parsed snippet, ready to run any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// Parse snippet source. Forbidden constructs are reported here, before
/// anything runs.
pub fn parse(source: &str) -> Result<Program, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        loop_depth: 0,
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    depth: usize,
}

fn check_name(name: &str) -> Result<(), ScriptError> {
    if name.starts_with("__") {
        return Err(ScriptError::Security(format!(
            "access to '{}' is not allowed",
            name
        )));
    }
    Ok(())
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("too deeply nested"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(self.line(), message)
    }

    fn unexpected(&self) -> ScriptError {
        let found = match self.peek() {
            Tok::Name(n) => format!("'{}'", n),
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(_) => "string".to_string(),
            Tok::Op(op) => format!("'{}'", op),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        self.error(format!("unexpected {}", found))
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ScriptError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek().clone() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                check_name(&name)?;
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn end_of_statement(&mut self) -> Result<(), ScriptError> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    // ── Statements ───────────────────────────────────────────────

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(n) => Some(n.clone()),
            Tok::Indent => return Err(self.error("unexpected indent")),
            _ => None,
        };

        let kind = match keyword.as_deref() {
            Some("if") => self.if_statement()?,
            Some("while") => {
                self.advance();
                let test = self.expr()?;
                let body = self.loop_body()?;
                StmtKind::While { test, body }
            }
            Some("for") => self.for_statement()?,
            Some(kw @ ("break" | "continue")) => {
                if self.loop_depth == 0 {
                    return Err(self.error(format!("'{}' outside loop", kw)));
                }
                let kind = if kw == "break" {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                };
                self.advance();
                self.end_of_statement()?;
                kind
            }
            Some("pass") => {
                self.advance();
                self.end_of_statement()?;
                StmtKind::Pass
            }
            Some("import" | "from") => {
                return Err(ScriptError::Security(
                    "import statements are not allowed".into(),
                ));
            }
            Some(kw @ ("global" | "nonlocal")) => {
                return Err(ScriptError::Security(format!(
                    "'{}' statements are not allowed",
                    kw
                )));
            }
            Some(kw) if KEYWORDS.contains(&kw) && !matches!(kw, "not" | "lambda") => {
                return Err(self.error(format!("unsupported statement '{}'", kw)));
            }
            _ => self.simple_statement()?,
        };

        Ok(Stmt { kind, line })
    }

    fn simple_statement(&mut self) -> Result<StmtKind, ScriptError> {
        let expr = self.expr()?;

        let kind = if self.eat_op("=") {
            let target = self.target(expr)?;
            let value = self.expr()?;
            StmtKind::Assign { target, value }
        } else if let Some(op) = match self.peek() {
            Tok::Op(o) if o.ends_with('=') && o.len() > 1 && !matches!(*o, "==" | "!=" | "<=" | ">=") => {
                BinOp::from_token(o)
            }
            _ => None,
        } {
            self.advance();
            let target = self.target(expr)?;
            let value = self.expr()?;
            StmtKind::AugAssign { target, op, value }
        } else {
            StmtKind::Expr(expr)
        };

        self.end_of_statement()?;
        Ok(kind)
    }

    fn target(&self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    fn if_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let mut branches = Vec::new();
        let test = self.expr()?;
        branches.push((test, self.block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let test = self.expr()?;
                branches.push((test, self.block()?));
            } else if self.eat_keyword("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn for_statement(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let mut vars = vec![self.expect_name()?];
        while self.eat_op(",") {
            vars.push(self.expect_name()?);
        }
        if !self.eat_keyword("in") {
            return Err(self.error("expected 'in'"));
        }
        let iter = self.expr()?;
        let body = self.loop_body()?;
        Ok(StmtKind::For { vars, iter, body })
    }

    fn loop_body(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    /// `:` followed by either an indented suite or a single statement.
    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.nested(Self::suite)
    }

    fn suite(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_op(":")?;
        if !self.at(&Tok::Newline) {
            return Ok(vec![self.statement()?]);
        }
        self.advance();
        if !self.at(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();

        let mut body = Vec::new();
        while !self.at(&Tok::Dedent) && !self.at(&Tok::Eof) {
            body.push(self.statement()?);
        }
        if self.at(&Tok::Dedent) {
            self.advance();
        }
        Ok(body)
    }

    // ── Expressions ──────────────────────────────────────────────

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr, ScriptError> {
        if self.at_keyword("lambda") {
            return Err(self.error("lambda expressions are not supported"));
        }
        let body = self.or_expr()?;
        if self.eat_keyword("if") {
            let test = self.or_expr()?;
            if !self.eat_keyword("else") {
                return Err(self.error("expected 'else' in conditional expression"));
            }
            let orelse = self.expr()?;
            return Ok(Expr::IfElse {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.nested(Self::not_expr)?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let first = self.arith()?;
        let mut rest = Vec::new();

        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    self.advance();
                    let op = if self.eat_keyword("not") {
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    };
                    rest.push((op, self.arith()?));
                    continue;
                }
                Tok::Name(n) if n == "not" => {
                    self.advance();
                    if !self.eat_keyword("in") {
                        return Err(self.error("expected 'in' after 'not'"));
                    }
                    rest.push((CmpOp::NotIn, self.arith()?));
                    continue;
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::factor)?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Pos(Box::new(self.nested(Self::factor)?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.primary()?;
        if self.eat_op("**") {
            // right-associative, binds tighter than unary minus on the left
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;

        loop {
            if self.at_op("(") {
                let func = match expr {
                    Expr::Name(ref name) => name.clone(),
                    _ => {
                        return Err(ScriptError::Security(
                            "only builtin functions and whitelisted methods may be called".into(),
                        ))
                    }
                };
                if !BUILTINS.contains(&func.as_str()) {
                    return Err(ScriptError::Security(format!(
                        "call to '{}' is not allowed",
                        func
                    )));
                }
                self.advance();
                let (args, kwargs) = self.arguments()?;
                expr = Expr::Call { func, args, kwargs };
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let name = match self.advance() {
                    Tok::Name(n) => n,
                    _ => return Err(self.error("expected attribute name")),
                };
                check_name(&name)?;
                if !self.at_op("(") {
                    return Err(ScriptError::Security(format!(
                        "attribute access '.{}' is not allowed",
                        name
                    )));
                }
                if !METHODS.contains(&name.as_str()) {
                    return Err(ScriptError::Security(format!(
                        "method '{}' is not allowed",
                        name
                    )));
                }
                self.advance();
                let (args, kwargs) = self.arguments()?;
                if !kwargs.is_empty() {
                    return Err(self.error("methods do not take keyword arguments"));
                }
                expr = Expr::Method {
                    receiver: Box::new(expr),
                    name,
                    args,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn subscript(&mut self, value: Expr) -> Result<Expr, ScriptError> {
        let lower = if self.at_op(":") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };

        if self.eat_op(":") {
            let upper = if self.at_op("]") {
                None
            } else {
                Some(Box::new(self.expr()?))
            };
            self.expect_op("]")?;
            return Ok(Expr::Slice {
                value: Box::new(value),
                lower,
                upper,
            });
        }

        self.expect_op("]")?;
        match lower {
            Some(index) => Ok(Expr::Subscript {
                value: Box::new(value),
                index,
            }),
            None => Err(self.error("empty subscript")),
        }
    }

    /// Arguments after an opening parenthesis, through the closing one.
    fn arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.at_op(")") {
            let keyword = match (self.peek(), self.tokens.get(self.pos + 1).map(|t| &t.tok)) {
                (Tok::Name(n), Some(Tok::Op("="))) => Some(n.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                check_name(&name)?;
                self.advance();
                self.advance();
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expr()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        let start = self.pos;
        let line = self.line();
        match self.advance() {
            Tok::Int(i) => Ok(Expr::Const(ScriptValue::Int(i))),
            Tok::Float(f) => Ok(Expr::Const(ScriptValue::Float(f))),
            Tok::Str(s) => {
                let mut text = s;
                while let Tok::Str(next) = self.peek() {
                    text.push_str(next);
                    self.advance();
                }
                Ok(Expr::Const(ScriptValue::Str(text)))
            }
            Tok::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Const(ScriptValue::Bool(true))),
                "False" => Ok(Expr::Const(ScriptValue::Bool(false))),
                "None" => Ok(Expr::Const(ScriptValue::None)),
                "import" | "from" => Err(ScriptError::Security(
                    "import statements are not allowed".into(),
                )),
                kw if KEYWORDS.contains(&kw) => {
                    Err(ScriptError::syntax(line, format!("unexpected '{}'", kw)))
                }
                _ => {
                    check_name(&name)?;
                    Ok(Expr::Name(name))
                }
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.expr()?;
                if self.at_op(",") {
                    let mut items = vec![first];
                    while self.eat_op(",") {
                        if self.at_op(")") {
                            break;
                        }
                        items.push(self.expr()?);
                    }
                    self.expect_op(")")?;
                    return Ok(Expr::List(items));
                }
                self.expect_op(")")?;
                Ok(first)
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                while !self.at_op("]") {
                    items.push(self.expr()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.at_op("}") {
                    let key = self.expr()?;
                    self.expect_op(":")?;
                    let value = self.expr()?;
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(entries))
            }
            _ => {
                self.pos = start;
                Err(self.unexpected())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security(src: &str) -> bool {
        matches!(parse(src), Err(ScriptError::Security(_)))
    }

    fn syntax(src: &str) -> bool {
        matches!(parse(src), Err(ScriptError::Syntax { .. }))
    }

    #[test]
    fn parses_assignment() {
        let program = parse("result = x + 1").unwrap();
        assert_eq!(program.body.len(), 1);
        let StmtKind::Assign { target, value } = &program.body[0].kind else {
            panic!("expected assignment");
        };
        assert_eq!(target, &Target::Name("result".into()));
        assert!(matches!(value, Expr::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn parses_control_flow() {
        let src = "\
total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    elif i > 7:
        break
    else:
        total += i
while total > 100: total -= 1
";
        let program = parse(src).unwrap();
        assert_eq!(program.body.len(), 3);
        assert_eq!(program.body[1].line, 2);
        assert!(matches!(program.body[2].kind, StmtKind::While { .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let program = parse("x = 2 ** 3 ** 2").unwrap();
        let StmtKind::Assign { value, .. } = &program.body[0].kind else {
            panic!();
        };
        let Expr::Binary { right, .. } = value else {
            panic!();
        };
        assert!(matches!(**right, Expr::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn rejects_imports_and_scope_statements() {
        assert!(security("import os"));
        assert!(security("from os import path"));
        assert!(security("x = 1\nif x:\n    import sys\n"));
        assert!(security("global x"));
    }

    #[test]
    fn rejects_non_whitelisted_calls() {
        assert!(security("open('/etc/passwd')"));
        assert!(security("x = eval('1')"));
        assert!(security("exec('x = 1')"));
        assert!(security("s = 'a'.format(1)"));
        assert!(security("xs[0]()"));
    }

    #[test]
    fn rejects_dunder_and_attributes() {
        assert!(security("x = __builtins__"));
        assert!(security("x = ''.__class__"));
        assert!(security("y = x.real"));
    }

    #[test]
    fn syntax_errors() {
        assert!(syntax("def f():\n    pass\n"));
        assert!(syntax("class A: pass"));
        assert!(syntax("break"));
        assert!(syntax("x = "));
        assert!(syntax("1 = x"));
        assert!(syntax("f = lambda: 1"));
        assert!(syntax("if x\n    y = 1\n"));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("x = {}1{}", "(".repeat(500), ")".repeat(500));
        assert!(syntax(&src));
        assert!(syntax(&format!("x = {}1", "-".repeat(500))));
    }

    #[test]
    fn keyword_arguments_and_slices() {
        let program = parse("ys = sorted(xs, reverse=True)[1:]").unwrap();
        let StmtKind::Assign { value, .. } = &program.body[0].kind else {
            panic!();
        };
        let Expr::Slice { value, lower, upper } = value else {
            panic!("expected slice");
        };
        assert!(lower.is_some());
        assert!(upper.is_none());
        assert!(matches!(&**value, Expr::Call { kwargs, .. } if kwargs.len() == 1));
    }
}
