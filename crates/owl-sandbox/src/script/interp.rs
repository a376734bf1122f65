use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::parser::{BinOp, CmpOp, Expr, Program, Stmt, StmtKind, Target};
use super::value::ScriptValue;
use super::ScriptError;

/// How often the wall-clock deadline is consulted, in steps.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Size limits applied to every value a snippet builds.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_string_len: usize,
    pub max_collection_len: usize,
    /// Bytes a single run may allocate for built values, summed over the run.
    pub max_alloc_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string_len: 1_000_000,
            max_collection_len: 100_000,
            max_alloc_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Limits {
    fn check(&self, value: &ScriptValue) -> Result<(), ScriptError> {
        match value {
            ScriptValue::Str(s) if s.len() > self.max_string_len => {
                // byte length is an upper bound; only count chars when close
                if s.chars().count() > self.max_string_len {
                    return Err(ScriptError::Limit(format!(
                        "string longer than {} characters",
                        self.max_string_len
                    )));
                }
                Ok(())
            }
            ScriptValue::List(items) if items.len() > self.max_collection_len => Err(
                ScriptError::Limit(format!("list longer than {} items", self.max_collection_len)),
            ),
            ScriptValue::Dict(map) if map.len() > self.max_collection_len => Err(
                ScriptError::Limit(format!("dict larger than {} items", self.max_collection_len)),
            ),
            _ => Ok(()),
        }
    }

    fn check_len(&self, len: usize, what: &str) -> Result<(), ScriptError> {
        let max = if what == "string" {
            self.max_string_len
        } else {
            self.max_collection_len
        };
        if len > max {
            return Err(ScriptError::Limit(format!(
                "{} would exceed {} items",
                what, max
            )));
        }
        Ok(())
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
}

/// A subscript chain rooted at a variable, with its indices already evaluated.
struct Place {
    root: String,
    path: Vec<ScriptValue>,
}

/// Tree-walking evaluator for one run of one program.
pub struct Interpreter {
    vars: BTreeMap<String, ScriptValue>,
    limits: Limits,
    cancel: CancellationToken,
    deadline: Instant,
    steps: u64,
    allocated: usize,
}

impl Interpreter {
    pub fn new(
        inputs: BTreeMap<String, ScriptValue>,
        limits: Limits,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            vars: inputs,
            limits,
            cancel,
            deadline,
            steps: 0,
            allocated: 0,
        }
    }

    /// Execute the program and return the final top-level namespace.
    pub fn run(mut self, program: &Program) -> Result<BTreeMap<String, ScriptValue>, ScriptError> {
        self.exec_block(&program.body)?;
        Ok(self.vars)
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if self.cancel.is_cancelled() {
            return Err(ScriptError::Interrupted);
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
            return Err(ScriptError::Interrupted);
        }
        Ok(())
    }

    /// Account for `bytes` about to be allocated. Called before the
    /// allocation so oversized results are never built.
    fn charge(&mut self, bytes: usize) -> Result<(), ScriptError> {
        self.allocated = self.allocated.saturating_add(bytes);
        if self.allocated > self.limits.max_alloc_bytes {
            return Err(ScriptError::Limit(format!(
                "snippet allocated more than {} bytes",
                self.limits.max_alloc_bytes
            )));
        }
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            self.tick()?;
            match self.exec(stmt).map_err(|e| e.at_line(stmt.line))? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::Assign { target, value } => {
                let value = self.eval(value)?;
                let place = self.place_of_target(target)?;
                self.write(&place, value)?;
            }
            StmtKind::AugAssign { target, op, value } => {
                let place = self.place_of_target(target)?;
                let rhs = self.eval(value)?;
                let current = if place.path.is_empty() {
                    self.vars
                        .remove(&place.root)
                        .ok_or_else(|| undefined(&place.root))?
                } else {
                    self.read(&place)?
                };
                let updated = self.augment(*op, current, rhs)?;
                self.write(&place, updated)?;
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { test, body } => loop {
                self.tick()?;
                if !self.eval(test)?.truthy() {
                    break;
                }
                if let Flow::Break = self.exec_block(body)? {
                    break;
                }
            },
            StmtKind::For { vars, iter, body } => {
                let items = iterate(&self.eval(iter)?)?;
                for item in items {
                    self.tick()?;
                    self.bind_loop_vars(vars, item)?;
                    if let Flow::Break = self.exec_block(body)? {
                        break;
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
        }
        Ok(Flow::Normal)
    }

    fn bind_loop_vars(&mut self, vars: &[String], item: ScriptValue) -> Result<(), ScriptError> {
        if let [single] = vars {
            self.vars.insert(single.clone(), item);
            return Ok(());
        }
        match item {
            ScriptValue::List(parts) if parts.len() == vars.len() => {
                for (name, part) in vars.iter().zip(parts) {
                    self.vars.insert(name.clone(), part);
                }
                Ok(())
            }
            other => Err(ScriptError::runtime(format!(
                "cannot unpack {} into {} names",
                other.type_name(),
                vars.len()
            ))),
        }
    }

    // ── Places ───────────────────────────────────────────────────

    fn place_of_target(&mut self, target: &Target) -> Result<Place, ScriptError> {
        match target {
            Target::Name(name) => Ok(Place {
                root: name.clone(),
                path: Vec::new(),
            }),
            Target::Subscript { value, index } => {
                let mut place = self
                    .place_of(value)?
                    .ok_or_else(|| ScriptError::runtime("cannot assign into a temporary value"))?;
                place.path.push(self.eval(index)?);
                Ok(place)
            }
        }
    }

    /// Resolve `name[i][j]...` to a place. Other expressions are not places.
    fn place_of(&mut self, expr: &Expr) -> Result<Option<Place>, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Some(Place {
                root: name.clone(),
                path: Vec::new(),
            })),
            Expr::Subscript { value, index } => match self.place_of(value)? {
                Some(mut place) => {
                    place.path.push(self.eval(index)?);
                    Ok(Some(place))
                }
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn read(&self, place: &Place) -> Result<ScriptValue, ScriptError> {
        let mut current = self.lookup(&place.root)?;
        for index in &place.path {
            current = subscript_ref(current, index)?;
        }
        Ok(current.clone())
    }

    fn place_mut(&mut self, place: &Place) -> Result<&mut ScriptValue, ScriptError> {
        let mut current = self
            .vars
            .get_mut(&place.root)
            .ok_or_else(|| undefined(&place.root))?;
        for index in &place.path {
            current = subscript_mut(current, index)?;
        }
        Ok(current)
    }

    fn write(&mut self, place: &Place, value: ScriptValue) -> Result<(), ScriptError> {
        let Some((last, parents)) = place.path.split_last() else {
            self.vars.insert(place.root.clone(), value);
            return Ok(());
        };
        self.charge(value.approx_bytes())?;
        let limits = self.limits;
        let parent = self.place_mut(&Place {
            root: place.root.clone(),
            path: parents.to_vec(),
        })?;
        match parent {
            ScriptValue::List(items) => {
                let i = list_index(items.len(), last)?;
                items[i] = value;
                Ok(())
            }
            ScriptValue::Dict(map) => {
                map.insert(dict_key(last)?, value);
                limits.check_len(map.len(), "dict")
            }
            other => Err(ScriptError::runtime(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn lookup(&self, name: &str) -> Result<&ScriptValue, ScriptError> {
        self.vars.get(name).ok_or_else(|| undefined(name))
    }

    // ── Expressions ──────────────────────────────────────────────

    fn eval(&mut self, expr: &Expr) -> Result<ScriptValue, ScriptError> {
        match expr {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name).cloned(),
            Expr::List(items) => {
                self.limits.check_len(items.len(), "list")?;
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.charge(values.iter().map(ScriptValue::approx_bytes).sum())?;
                Ok(ScriptValue::List(values))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = dict_key(&self.eval(k)?)?;
                    let value = self.eval(v)?;
                    map.insert(key, value);
                }
                let dict = ScriptValue::Dict(map);
                self.limits.check(&dict)?;
                self.charge(dict.approx_bytes())?;
                Ok(dict)
            }
            Expr::Neg(operand) => match self.eval(operand)? {
                ScriptValue::Float(f) => Ok(ScriptValue::Float(-f)),
                v => match v.as_int() {
                    Some(i) => i.checked_neg().map(ScriptValue::Int).ok_or_else(overflow),
                    None => Err(ScriptError::runtime(format!(
                        "bad operand type for unary -: '{}'",
                        v.type_name()
                    ))),
                },
            },
            Expr::Pos(operand) => match self.eval(operand)? {
                ScriptValue::Float(f) => Ok(ScriptValue::Float(f)),
                v => v.as_int().map(ScriptValue::Int).ok_or_else(|| {
                    ScriptError::runtime(format!(
                        "bad operand type for unary +: '{}'",
                        v.type_name()
                    ))
                }),
            },
            Expr::Not(operand) => Ok(ScriptValue::Bool(!self.eval(operand)?.truthy())),
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.binary(*op, &l, &r)
            }
            Expr::And(left, right) => {
                let l = self.eval(left)?;
                if !l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let l = self.eval(left)?;
                if l.truthy() {
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first)?;
                for (op, expr) in rest {
                    let right = self.eval(expr)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(ScriptValue::Bool(false));
                    }
                    left = right;
                }
                Ok(ScriptValue::Bool(true))
            }
            Expr::IfElse { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut named = BTreeMap::new();
                for (name, expr) in kwargs {
                    named.insert(name.clone(), self.eval(expr)?);
                }
                self.call_builtin(func, args, named)
            }
            Expr::Method {
                receiver,
                name,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let limits = self.limits;
                if is_mutating(name) {
                    self.charge(args.iter().map(ScriptValue::approx_bytes).sum())?;
                    if let Some(place) = self.place_of(receiver)? {
                        let target = self.place_mut(&place)?;
                        return call_method(target, name, args, &limits);
                    }
                }
                let mut value = self.eval(receiver)?;
                self.charge(method_cost(&value, name, &args))?;
                call_method(&mut value, name, args, &limits)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval(index)?;
                if let ScriptValue::Str(s) = &container {
                    let chars: Vec<char> = s.chars().collect();
                    let i = list_index(chars.len(), &index)?;
                    return Ok(ScriptValue::Str(chars[i].to_string()));
                }
                subscript_ref(&container, &index).cloned()
            }
            Expr::Slice {
                value,
                lower,
                upper,
            } => {
                let container = self.eval(value)?;
                let lower = match lower {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                let upper = match upper {
                    Some(e) => Some(self.eval(e)?),
                    None => None,
                };
                slice(&container, lower.as_ref(), upper.as_ref())
            }
        }
    }

    /// `+=` on a string or list appends in place and is charged for the
    /// appended part only.
    fn augment(
        &mut self,
        op: BinOp,
        current: ScriptValue,
        rhs: ScriptValue,
    ) -> Result<ScriptValue, ScriptError> {
        match (op, current, rhs) {
            (BinOp::Add, ScriptValue::Str(mut a), ScriptValue::Str(b)) => {
                self.limits
                    .check_len(a.chars().count() + b.chars().count(), "string")?;
                self.charge(b.len())?;
                a.push_str(&b);
                Ok(ScriptValue::Str(a))
            }
            (BinOp::Add, ScriptValue::List(mut a), ScriptValue::List(b)) => {
                self.limits.check_len(a.len() + b.len(), "list")?;
                self.charge(list_bytes(&b))?;
                a.extend(b);
                Ok(ScriptValue::List(a))
            }
            (op, current, rhs) => self.binary(op, &current, &rhs),
        }
    }

    fn binary(
        &mut self,
        op: BinOp,
        left: &ScriptValue,
        right: &ScriptValue,
    ) -> Result<ScriptValue, ScriptError> {
        use ScriptValue::{List, Str};

        let result = match (op, left, right) {
            (BinOp::Add, Str(a), Str(b)) => {
                self.limits
                    .check_len(a.chars().count() + b.chars().count(), "string")?;
                self.charge(a.len() + b.len())?;
                Str(format!("{}{}", a, b))
            }
            (BinOp::Add, List(a), List(b)) => {
                self.limits.check_len(a.len() + b.len(), "list")?;
                self.charge(list_bytes(a) + list_bytes(b))?;
                List(a.iter().chain(b).cloned().collect())
            }
            (BinOp::Mul, Str(s), n) | (BinOp::Mul, n, Str(s)) if n.as_int().is_some() => {
                let times = n.as_int().unwrap_or(0).max(0) as usize;
                if s.is_empty() || times == 0 {
                    return Ok(Str(String::new()));
                }
                self.limits
                    .check_len(s.chars().count().saturating_mul(times), "string")?;
                self.charge(s.len().saturating_mul(times))?;
                Str(s.repeat(times))
            }
            (BinOp::Mul, List(items), n) | (BinOp::Mul, n, List(items)) if n.as_int().is_some() => {
                let times = n.as_int().unwrap_or(0).max(0) as usize;
                if items.is_empty() || times == 0 {
                    return Ok(List(Vec::new()));
                }
                self.limits
                    .check_len(items.len().saturating_mul(times), "list")?;
                self.charge(list_bytes(items).saturating_mul(times))?;
                let mut out = Vec::with_capacity(items.len() * times);
                for _ in 0..times {
                    self.tick()?;
                    out.extend(items.iter().cloned());
                }
                List(out)
            }
            (op, a, b) if a.is_number() && b.is_number() => arithmetic(op, a, b)?,
            (op, a, b) => {
                return Err(ScriptError::runtime(format!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    op.symbol(),
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        Ok(result)
    }

    fn call_builtin(
        &mut self,
        func: &str,
        args: Vec<ScriptValue>,
        mut kwargs: BTreeMap<String, ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let reverse = if func == "sorted" {
            kwargs
                .remove("reverse")
                .map(|v| v.truthy())
                .unwrap_or(false)
        } else {
            false
        };
        if let Some(name) = kwargs.keys().next() {
            return Err(ScriptError::runtime(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, name
            )));
        }

        let result = match func {
            "len" => {
                let [v] = arity::<1>(func, args)?;
                match v {
                    ScriptValue::Str(s) => ScriptValue::Int(s.chars().count() as i64),
                    ScriptValue::List(items) => ScriptValue::Int(items.len() as i64),
                    ScriptValue::Dict(map) => ScriptValue::Int(map.len() as i64),
                    other => {
                        return Err(ScriptError::runtime(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                }
            }
            "str" => match args.into_iter().next() {
                None => ScriptValue::Str(String::new()),
                Some(v) => ScriptValue::Str(v.to_string()),
            },
            "int" => {
                let [v] = arity::<1>(func, args)?;
                to_int(&v)?
            }
            "float" => {
                let [v] = arity::<1>(func, args)?;
                to_float(&v)?
            }
            "bool" => match args.into_iter().next() {
                None => ScriptValue::Bool(false),
                Some(v) => ScriptValue::Bool(v.truthy()),
            },
            "abs" => {
                let [v] = arity::<1>(func, args)?;
                match v {
                    ScriptValue::Float(f) => ScriptValue::Float(f.abs()),
                    other => match other.as_int() {
                        Some(i) => ScriptValue::Int(i.checked_abs().ok_or_else(overflow)?),
                        None => {
                            return Err(ScriptError::runtime(format!(
                                "bad operand type for abs(): '{}'",
                                other.type_name()
                            )))
                        }
                    },
                }
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    iterate(&args[0])?
                } else {
                    args
                };
                let mut iter = items.into_iter();
                let mut best = iter
                    .next()
                    .ok_or_else(|| ScriptError::runtime(format!("{}() arg is an empty sequence", func)))?;
                let wanted = if func == "min" {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                for item in iter {
                    if item.compare(&best)? == wanted {
                        best = item;
                    }
                }
                best
            }
            "sum" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(ScriptError::runtime("sum() takes 1 or 2 arguments"));
                }
                let mut total = args.get(1).cloned().unwrap_or(ScriptValue::Int(0));
                for item in iterate(&args[0])? {
                    self.tick()?;
                    total = self.binary(BinOp::Add, &total, &item)?;
                }
                total
            }
            "round" => round(args)?,
            "range" => range(args, &self.limits)?,
            "sorted" => {
                let [v] = arity::<1>(func, args)?;
                let mut items = iterate(&v)?;
                sort_values(&mut items)?;
                if reverse {
                    items.reverse();
                }
                ScriptValue::List(items)
            }
            "list" => match args.into_iter().next() {
                None => ScriptValue::List(Vec::new()),
                Some(v) => ScriptValue::List(iterate(&v)?),
            },
            "any" => {
                let [v] = arity::<1>(func, args)?;
                ScriptValue::Bool(iterate(&v)?.iter().any(ScriptValue::truthy))
            }
            "all" => {
                let [v] = arity::<1>(func, args)?;
                ScriptValue::Bool(iterate(&v)?.iter().all(ScriptValue::truthy))
            }
            "print" => {
                let line: Vec<String> = args.iter().map(|v| v.to_string()).collect();
                tracing::debug!(target: "owl_sandbox::print", "{}", line.join(" "));
                ScriptValue::None
            }
            other => {
                return Err(ScriptError::Security(format!(
                    "call to '{}' is not allowed",
                    other
                )))
            }
        };
        Ok(result)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn undefined(name: &str) -> ScriptError {
    ScriptError::runtime(format!("name '{}' is not defined", name))
}

fn overflow() -> ScriptError {
    ScriptError::runtime("integer overflow")
}

fn arity<const N: usize>(func: &str, args: Vec<ScriptValue>) -> Result<[ScriptValue; N], ScriptError> {
    let got = args.len();
    args.try_into().map_err(|_| {
        ScriptError::runtime(format!(
            "{}() takes {} argument{} ({} given)",
            func,
            N,
            if N == 1 { "" } else { "s" },
            got
        ))
    })
}

fn is_mutating(method: &str) -> bool {
    matches!(method, "append" | "extend" | "pop")
}

fn iterate(value: &ScriptValue) -> Result<Vec<ScriptValue>, ScriptError> {
    match value {
        ScriptValue::List(items) => Ok(items.clone()),
        ScriptValue::Str(s) => Ok(s.chars().map(|c| ScriptValue::Str(c.to_string())).collect()),
        ScriptValue::Dict(map) => Ok(map.keys().cloned().map(ScriptValue::Str).collect()),
        other => Err(ScriptError::runtime(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn dict_key(value: &ScriptValue) -> Result<String, ScriptError> {
    match value {
        ScriptValue::Str(s) => Ok(s.clone()),
        other => Err(ScriptError::runtime(format!(
            "dict keys must be strings, not '{}'",
            other.type_name()
        ))),
    }
}

/// Normalise a possibly negative index against `len`.
fn list_index(len: usize, index: &ScriptValue) -> Result<usize, ScriptError> {
    let i = match index {
        ScriptValue::Int(i) => *i,
        ScriptValue::Bool(b) => *b as i64,
        other => {
            return Err(ScriptError::runtime(format!(
                "indices must be integers, not '{}'",
                other.type_name()
            )))
        }
    };
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ScriptError::runtime("index out of range"));
    }
    Ok(resolved as usize)
}

fn subscript_ref<'a>(
    container: &'a ScriptValue,
    index: &ScriptValue,
) -> Result<&'a ScriptValue, ScriptError> {
    match container {
        ScriptValue::List(items) => Ok(&items[list_index(items.len(), index)?]),
        ScriptValue::Dict(map) => {
            let key = dict_key(index)?;
            map.get(&key)
                .ok_or_else(|| ScriptError::runtime(format!("key '{}' not found", key)))
        }
        ScriptValue::Str(_) => Err(ScriptError::runtime(
            "'str' object does not support item assignment",
        )),
        other => Err(ScriptError::runtime(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn subscript_mut<'a>(
    container: &'a mut ScriptValue,
    index: &ScriptValue,
) -> Result<&'a mut ScriptValue, ScriptError> {
    match container {
        ScriptValue::List(items) => {
            let i = list_index(items.len(), index)?;
            Ok(&mut items[i])
        }
        ScriptValue::Dict(map) => {
            let key = dict_key(index)?;
            map.get_mut(&key)
                .ok_or_else(|| ScriptError::runtime(format!("key '{}' not found", key)))
        }
        other => Err(ScriptError::runtime(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn slice_bounds(
    len: usize,
    lower: Option<&ScriptValue>,
    upper: Option<&ScriptValue>,
) -> Result<(usize, usize), ScriptError> {
    let clamp = |v: Option<&ScriptValue>, default: usize| -> Result<usize, ScriptError> {
        match v {
            None | Some(ScriptValue::None) => Ok(default),
            Some(v) => {
                let i = v.as_int().ok_or_else(|| {
                    ScriptError::runtime("slice indices must be integers or None")
                })?;
                let resolved = if i < 0 { i + len as i64 } else { i };
                Ok(resolved.clamp(0, len as i64) as usize)
            }
        }
    };
    let start = clamp(lower, 0)?;
    let end = clamp(upper, len)?;
    Ok((start, end.max(start)))
}

fn slice(
    container: &ScriptValue,
    lower: Option<&ScriptValue>,
    upper: Option<&ScriptValue>,
) -> Result<ScriptValue, ScriptError> {
    match container {
        ScriptValue::List(items) => {
            let (start, end) = slice_bounds(items.len(), lower, upper)?;
            Ok(ScriptValue::List(items[start..end].to_vec()))
        }
        ScriptValue::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), lower, upper)?;
            Ok(ScriptValue::Str(chars[start..end].iter().collect()))
        }
        other => Err(ScriptError::runtime(format!(
            "'{}' object is not sliceable",
            other.type_name()
        ))),
    }
}

fn arithmetic(op: BinOp, a: &ScriptValue, b: &ScriptValue) -> Result<ScriptValue, ScriptError> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return int_arithmetic(op, x, y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    let zero_div = || ScriptError::runtime("float division by zero");
    let value = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(zero_div());
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero_div());
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(zero_div());
            }
            x - y * (x / y).floor()
        }
        BinOp::Pow => x.powf(y),
    };
    Ok(ScriptValue::Float(value))
}

fn int_arithmetic(op: BinOp, x: i64, y: i64) -> Result<ScriptValue, ScriptError> {
    let zero_div = || ScriptError::runtime("integer division or modulo by zero");
    let value = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div => {
            if y == 0 {
                return Err(ScriptError::runtime("division by zero"));
            }
            return Ok(ScriptValue::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero_div());
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            if x % y != 0 && ((x < 0) != (y < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero_div());
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (y < 0)) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if y < 0 {
                return Ok(ScriptValue::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).ok_or_else(overflow)?
        }
    };
    Ok(ScriptValue::Int(value))
}

fn compare(op: CmpOp, left: &ScriptValue, right: &ScriptValue) -> Result<bool, ScriptError> {
    Ok(match op {
        CmpOp::Eq => left.loose_eq(right),
        CmpOp::NotEq => !left.loose_eq(right),
        CmpOp::Lt => left.compare(right)? == Ordering::Less,
        CmpOp::LtE => left.compare(right)? != Ordering::Greater,
        CmpOp::Gt => left.compare(right)? == Ordering::Greater,
        CmpOp::GtE => left.compare(right)? != Ordering::Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => left.type_name() == right.type_name() && left == right,
        CmpOp::IsNot => !(left.type_name() == right.type_name() && left == right),
    })
}

fn contains(container: &ScriptValue, item: &ScriptValue) -> Result<bool, ScriptError> {
    match (container, item) {
        (ScriptValue::Str(haystack), ScriptValue::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        (ScriptValue::Str(_), other) => Err(ScriptError::runtime(format!(
            "'in <string>' requires string as left operand, not '{}'",
            other.type_name()
        ))),
        (ScriptValue::List(items), item) => Ok(items.iter().any(|v| v.loose_eq(item))),
        (ScriptValue::Dict(map), ScriptValue::Str(key)) => Ok(map.contains_key(key)),
        (ScriptValue::Dict(_), _) => Ok(false),
        (other, _) => Err(ScriptError::runtime(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn sort_values(items: &mut [ScriptValue]) -> Result<(), ScriptError> {
    let mut failure = None;
    items.sort_by(|a, b| match a.compare(b) {
        Ok(ord) => ord,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn to_int(value: &ScriptValue) -> Result<ScriptValue, ScriptError> {
    match value {
        ScriptValue::Float(f) => {
            if !f.is_finite() || f.abs() >= 9.2e18 {
                return Err(ScriptError::runtime(format!("cannot convert {} to int", f)));
            }
            Ok(ScriptValue::Int(f.trunc() as i64))
        }
        ScriptValue::Str(s) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(ScriptValue::Int)
            .map_err(|_| {
                ScriptError::runtime(format!("invalid literal for int(): '{}'", s))
            }),
        other => other.as_int().map(ScriptValue::Int).ok_or_else(|| {
            ScriptError::runtime(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn to_float(value: &ScriptValue) -> Result<ScriptValue, ScriptError> {
    match value {
        ScriptValue::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(ScriptValue::Float)
            .map_err(|_| {
                ScriptError::runtime(format!("could not convert string to float: '{}'", s))
            }),
        other => other.as_f64().map(ScriptValue::Float).ok_or_else(|| {
            ScriptError::runtime(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

/// Round half to even, as Python does.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

fn round(args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
    let mut args = args.into_iter();
    let value = args
        .next()
        .ok_or_else(|| ScriptError::runtime("round() missing required argument"))?;
    let digits = match args.next() {
        None | Some(ScriptValue::None) => None,
        Some(d) => Some(
            d.as_int()
                .ok_or_else(|| ScriptError::runtime("round() digits must be an integer"))?,
        ),
    };

    match (&value, digits) {
        (ScriptValue::Float(f), None) => {
            let r = round_half_even(*f);
            if !r.is_finite() || r.abs() >= 9.2e18 {
                return Err(ScriptError::runtime(format!("cannot round {} to int", f)));
            }
            Ok(ScriptValue::Int(r as i64))
        }
        (ScriptValue::Float(f), Some(d)) => {
            let scale = 10f64.powi(d.clamp(-308, 308) as i32);
            Ok(ScriptValue::Float(round_half_even(f * scale) / scale))
        }
        (v, _) => v.as_int().map(ScriptValue::Int).ok_or_else(|| {
            ScriptError::runtime(format!(
                "type '{}' doesn't define __round__",
                v.type_name()
            ))
        }),
    }
}

fn range(args: Vec<ScriptValue>, limits: &Limits) -> Result<ScriptValue, ScriptError> {
    let ints = args
        .iter()
        .map(|a| {
            a.as_int().ok_or_else(|| {
                ScriptError::runtime(format!(
                    "'{}' object cannot be interpreted as an integer",
                    a.type_name()
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(ScriptError::runtime("range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(ScriptError::runtime("range() arg 3 must not be zero"));
    }

    let span = if step > 0 {
        (stop as i128 - start as i128).max(0)
    } else {
        (start as i128 - stop as i128).max(0)
    };
    let step_abs = (step as i128).abs();
    let len = (span + step_abs - 1) / step_abs;
    if len > limits.max_collection_len as i128 {
        return Err(ScriptError::Limit(format!(
            "range of {} items exceeds {}",
            len, limits.max_collection_len
        )));
    }

    let values = (0..len as i64)
        .map(|i| ScriptValue::Int(start + i * step))
        .collect();
    Ok(ScriptValue::List(values))
}

fn expect_str<'a>(method: &str, value: &'a ScriptValue) -> Result<&'a str, ScriptError> {
    match value {
        ScriptValue::Str(s) => Ok(s),
        other => Err(ScriptError::runtime(format!(
            "{}() argument must be str, not '{}'",
            method,
            other.type_name()
        ))),
    }
}

fn str_arg<'a>(method: &str, args: &'a [ScriptValue], i: usize) -> Result<&'a str, ScriptError> {
    let value = args.get(i).ok_or_else(|| {
        ScriptError::runtime(format!("{}() missing argument {}", method, i + 1))
    })?;
    expect_str(method, value)
}

/// Optional strip characters; `None` means whitespace.
fn strip_chars(args: &[ScriptValue]) -> Result<Option<Vec<char>>, ScriptError> {
    match args.first() {
        None | Some(ScriptValue::None) => Ok(None),
        Some(v) => Ok(Some(expect_str("strip", v)?.chars().collect())),
    }
}

fn char_index(haystack: &str, byte_index: Option<usize>) -> i64 {
    match byte_index {
        Some(b) => haystack[..b].chars().count() as i64,
        None => -1,
    }
}

fn list_bytes(items: &[ScriptValue]) -> usize {
    items.iter().map(ScriptValue::approx_bytes).sum()
}

/// Upper bound on the bytes a non-mutating method call will allocate.
fn method_cost(receiver: &ScriptValue, name: &str, args: &[ScriptValue]) -> usize {
    let s = match receiver {
        ScriptValue::Str(s) => s,
        ScriptValue::Dict(map) if matches!(name, "keys" | "values" | "items") => {
            return receiver.approx_bytes().saturating_add(map.len().saturating_mul(16));
        }
        _ => return 0,
    };
    let arg_str = |i: usize| match args.get(i) {
        Some(ScriptValue::Str(a)) => Some(a.as_str()),
        _ => None,
    };
    match name {
        "replace" => match (arg_str(0), arg_str(1)) {
            (Some(from), Some(to)) => {
                let matches = if from.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(from).count()
                };
                s.len().saturating_add(matches.saturating_mul(to.len()))
            }
            _ => 0,
        },
        "join" => match args.first() {
            Some(ScriptValue::List(items)) => {
                let parts: usize = items.iter().map(ScriptValue::approx_bytes).sum();
                parts.saturating_add(s.len().saturating_mul(items.len()))
            }
            Some(other) => other.approx_bytes().saturating_mul(s.len().max(1)),
            None => 0,
        },
        // case mapping can grow a character to at most three
        "upper" | "lower" => s.len().saturating_mul(3),
        "strip" | "lstrip" | "rstrip" | "split" => s.len(),
        _ => 0,
    }
}

fn call_method(
    receiver: &mut ScriptValue,
    name: &str,
    args: Vec<ScriptValue>,
    limits: &Limits,
) -> Result<ScriptValue, ScriptError> {
    let result = match &mut *receiver {
        ScriptValue::Str(s) => string_method(s, name, &args)?,
        ScriptValue::List(items) => list_method(items, name, args)?,
        ScriptValue::Dict(map) => dict_method(map, name, args)?,
        other => {
            return Err(ScriptError::runtime(format!(
                "'{}' object has no method '{}'",
                other.type_name(),
                name
            )))
        }
    };
    limits.check(receiver)?;
    limits.check(&result)?;
    Ok(result)
}

fn string_method(s: &str, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
    use ScriptValue::{Bool, Int, List, Str};

    Ok(match name {
        "lower" => Str(s.to_lowercase()),
        "upper" => Str(s.to_uppercase()),
        "strip" => Str(match strip_chars(args)? {
            None => s.trim().to_string(),
            Some(cs) => s.trim_matches(|c| cs.contains(&c)).to_string(),
        }),
        "lstrip" => Str(match strip_chars(args)? {
            None => s.trim_start().to_string(),
            Some(cs) => s.trim_start_matches(|c| cs.contains(&c)).to_string(),
        }),
        "rstrip" => Str(match strip_chars(args)? {
            None => s.trim_end().to_string(),
            Some(cs) => s.trim_end_matches(|c| cs.contains(&c)).to_string(),
        }),
        "split" => {
            let parts: Vec<ScriptValue> = match args.first() {
                None | Some(ScriptValue::None) => {
                    s.split_whitespace().map(|p| Str(p.to_string())).collect()
                }
                Some(sep) => {
                    let sep = expect_str(name, sep)?;
                    if sep.is_empty() {
                        return Err(ScriptError::runtime("empty separator"));
                    }
                    s.split(sep).map(|p| Str(p.to_string())).collect()
                }
            };
            List(parts)
        }
        "join" => {
            let items = match args.first() {
                Some(v) => iterate(v)?,
                None => return Err(ScriptError::runtime("join() missing argument")),
            };
            let parts = items
                .iter()
                .map(|v| expect_str(name, v).map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            Str(parts.join(s))
        }
        "replace" => Str(s.replace(str_arg(name, args, 0)?, str_arg(name, args, 1)?)),
        "startswith" => Bool(s.starts_with(str_arg(name, args, 0)?)),
        "endswith" => Bool(s.ends_with(str_arg(name, args, 0)?)),
        "find" => Int(char_index(s, s.find(str_arg(name, args, 0)?))),
        "index" => {
            let needle = str_arg(name, args, 0)?;
            match s.find(needle) {
                Some(b) => Int(char_index(s, Some(b))),
                None => return Err(ScriptError::runtime("substring not found")),
            }
        }
        "count" => {
            let needle = str_arg(name, args, 0)?;
            if needle.is_empty() {
                Int(s.chars().count() as i64 + 1)
            } else {
                Int(s.matches(needle).count() as i64)
            }
        }
        _ => {
            return Err(ScriptError::runtime(format!(
                "'str' object has no method '{}'",
                name
            )))
        }
    })
}

fn list_method(
    items: &mut Vec<ScriptValue>,
    name: &str,
    args: Vec<ScriptValue>,
) -> Result<ScriptValue, ScriptError> {
    Ok(match name {
        "append" => {
            let [v] = arity::<1>(name, args)?;
            items.push(v);
            ScriptValue::None
        }
        "extend" => {
            let [v] = arity::<1>(name, args)?;
            items.extend(iterate(&v)?);
            ScriptValue::None
        }
        "pop" => {
            if items.is_empty() {
                return Err(ScriptError::runtime("pop from empty list"));
            }
            let i = match args.first() {
                None => items.len() - 1,
                Some(index) => list_index(items.len(), index)?,
            };
            items.remove(i)
        }
        "index" => {
            let [v] = arity::<1>(name, args)?;
            match items.iter().position(|x| x.loose_eq(&v)) {
                Some(i) => ScriptValue::Int(i as i64),
                None => return Err(ScriptError::runtime(format!("{} is not in list", v.repr()))),
            }
        }
        "count" => {
            let [v] = arity::<1>(name, args)?;
            ScriptValue::Int(items.iter().filter(|x| x.loose_eq(&v)).count() as i64)
        }
        _ => {
            return Err(ScriptError::runtime(format!(
                "'list' object has no method '{}'",
                name
            )))
        }
    })
}

fn dict_method(
    map: &mut BTreeMap<String, ScriptValue>,
    name: &str,
    args: Vec<ScriptValue>,
) -> Result<ScriptValue, ScriptError> {
    Ok(match name {
        "get" => {
            let mut args = args.into_iter();
            let key = args
                .next()
                .ok_or_else(|| ScriptError::runtime("get() missing argument"))?;
            let default = args.next().unwrap_or(ScriptValue::None);
            match key {
                ScriptValue::Str(k) => map.get(&k).cloned().unwrap_or(default),
                _ => default,
            }
        }
        "keys" => ScriptValue::List(map.keys().cloned().map(ScriptValue::Str).collect()),
        "values" => ScriptValue::List(map.values().cloned().collect()),
        "items" => ScriptValue::List(
            map.iter()
                .map(|(k, v)| ScriptValue::List(vec![ScriptValue::Str(k.clone()), v.clone()]))
                .collect(),
        ),
        "pop" => {
            let mut args = args.into_iter();
            let key = dict_key(
                &args
                    .next()
                    .ok_or_else(|| ScriptError::runtime("pop() missing argument"))?,
            )?;
            match (map.remove(&key), args.next()) {
                (Some(v), _) => v,
                (None, Some(default)) => default,
                (None, None) => {
                    return Err(ScriptError::runtime(format!("key '{}' not found", key)))
                }
            }
        }
        _ => {
            return Err(ScriptError::runtime(format!(
                "'dict' object has no method '{}'",
                name
            )))
        }
    })
}
