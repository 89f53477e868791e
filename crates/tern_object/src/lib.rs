use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tern_code::Instructions;
use tern_syntax::{BlockStmt, Ident};

/// The closed set of runtime values. Composite values share their payloads
/// through `Rc`, which is also what the language's reference-equality
/// semantics observe.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Null,
    Str(Rc<String>),
    Array(Rc<Vec<Value>>),
    Hash(Rc<IndexMap<HashKey, HashPair>>),
    /// Wrapper the tree-walker uses to unwind out of nested blocks. Never a
    /// top-level result.
    ReturnValue(Rc<Value>),
    /// A runtime error as a first-class value (tree-walker and builtins).
    Error(String),
    /// The tree-walker's closure: parameters, body, and captured environment.
    Function(Rc<FunctionValue>),
    /// A compiled function body living in the constant pool.
    CompiledFunction(Rc<CompiledFunction>),
    /// The VM's only runtime callable.
    Closure(Rc<ClosureValue>),
    Builtin(Builtin),
}

#[derive(Debug)]
pub struct FunctionValue {
    pub params: Vec<Ident>,
    pub body: BlockStmt,
    pub env: Rc<RefCell<Environment>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_parameters: usize,
}

#[derive(Debug)]
pub struct ClosureValue {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// Kind tags, used for dispatch and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Integer,
    Boolean,
    Null,
    Str,
    Array,
    Hash,
    ReturnValue,
    Error,
    Function,
    CompiledFunction,
    Closure,
    Builtin,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Integer => "INTEGER",
            ValueKind::Boolean => "BOOLEAN",
            ValueKind::Null => "NULL",
            ValueKind::Str => "STRING",
            ValueKind::Array => "ARRAY",
            ValueKind::Hash => "HASH",
            ValueKind::ReturnValue => "RETURN_VALUE",
            ValueKind::Error => "ERROR",
            ValueKind::Function => "FUNCTION",
            ValueKind::CompiledFunction => "COMPILED_FUNCTION",
            ValueKind::Closure => "CLOSURE",
            ValueKind::Builtin => "BUILTIN",
        };
        write!(f, "{name}")
    }
}

/// Identifies a hashable value: its kind plus a 64-bit hash. Strings hash
/// with 64-bit FNV-1a over their UTF-8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub kind: ValueKind,
    pub value: u64,
}

/// A hash entry keeps the original key alongside the value so `inspect` can
/// reproduce it.
#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Integer,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Null => ValueKind::Null,
            Value::Str(_) => ValueKind::Str,
            Value::Array(_) => ValueKind::Array,
            Value::Hash(_) => ValueKind::Hash,
            Value::ReturnValue(_) => ValueKind::ReturnValue,
            Value::Error(_) => ValueKind::Error,
            Value::Function(_) => ValueKind::Function,
            Value::CompiledFunction(_) => ValueKind::CompiledFunction,
            Value::Closure(_) => ValueKind::Closure,
            Value::Builtin(_) => ValueKind::Builtin,
        }
    }

    /// `Integer`, `Boolean`, and `Str` are the only hashable kinds.
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Int(value) => Some(HashKey {
                kind: ValueKind::Integer,
                value: *value as u64,
            }),
            Value::Bool(value) => Some(HashKey {
                kind: ValueKind::Boolean,
                value: u64::from(*value),
            }),
            Value::Str(value) => Some(HashKey {
                kind: ValueKind::Str,
                value: fnv1a_64(value.as_bytes()),
            }),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn inspect(&self) -> String {
        match self {
            Value::Int(value) => value.to_string(),
            Value::Bool(value) => value.to_string(),
            Value::Null => "null".to_string(),
            Value::Str(value) => value.as_ref().clone(),
            Value::Array(elements) => {
                let items = elements
                    .iter()
                    .map(Value::inspect)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{items}]")
            }
            Value::Hash(pairs) => {
                let items = pairs
                    .values()
                    .map(|pair| format!("{}: {}", pair.key.inspect(), pair.value.inspect()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{items}}}")
            }
            Value::ReturnValue(inner) => inner.inspect(),
            Value::Error(message) => format!("ERROR: {message}"),
            Value::Function(func) => {
                let params = func
                    .params
                    .iter()
                    .map(|param| param.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("func({params}) {{\n{}\n}}", func.body)
            }
            Value::CompiledFunction(func) => {
                format!("CompiledFunction[{:p}]", Rc::as_ptr(func))
            }
            Value::Closure(closure) => format!("Closure[{:p}]", Rc::as_ptr(closure)),
            Value::Builtin(builtin) => format!("builtin function {}", builtin.name),
        }
    }
}

/// Structural equality, for tests and constant-pool bookkeeping. The
/// language's own `==` goes through [`runtime_eq`] instead.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::ReturnValue(a), Value::ReturnValue(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::CompiledFunction(a), Value::CompiledFunction(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            _ => false,
        }
    }
}

/// The `==`/`!=` semantics both engines share: numeric comparison when both
/// sides are integers, reference equality otherwise. The singleton kinds
/// (booleans, null) degenerate to value equality; strings and composites
/// compare by pointer, so two separately-built equal strings are unequal.
pub fn runtime_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Hash(a), Value::Hash(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
        (Value::CompiledFunction(a), Value::CompiledFunction(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
        _ => false,
    }
}

/// The general truthiness rule: only `null` and `false` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// The stricter coercion `&&`/`||` use: zero, the empty string, and empty
/// containers also count as false.
pub fn coerce_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(value) => *value,
        Value::Null => false,
        Value::Int(value) => *value != 0,
        Value::Str(value) => !value.is_empty(),
        Value::Array(elements) => !elements.is_empty(),
        Value::Hash(pairs) => !pairs.is_empty(),
        _ => true,
    }
}

/// A lexical environment for the tree-walking evaluator: a store plus an
/// optional enclosing environment.
#[derive(Debug, Default)]
pub struct Environment {
    store: HashMap<String, Value>,
    outer: Option<Rc<RefCell<Environment>>>,
}

impl Environment {
    pub fn new() -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment::default()))
    }

    pub fn new_enclosed(outer: Rc<RefCell<Environment>>) -> Rc<RefCell<Environment>> {
        Rc::new(RefCell::new(Environment {
            store: HashMap::new(),
            outer: Some(outer),
        }))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        match self.store.get(name) {
            Some(value) => Some(value.clone()),
            None => self
                .outer
                .as_ref()
                .and_then(|outer| outer.borrow().get(name)),
        }
    }

    /// Bind `name` in this environment.
    pub fn set(&mut self, name: &str, value: Value) {
        self.store.insert(name.to_string(), value);
    }

    /// Rebind `name` where it was defined, walking outward. Returns false if
    /// no enclosing environment defines it.
    pub fn assign(&mut self, name: &str, value: Value) -> bool {
        if let Some(slot) = self.store.get_mut(name) {
            *slot = value;
            return true;
        }
        match &self.outer {
            Some(outer) => outer.borrow_mut().assign(name, value),
            None => false,
        }
    }
}

/// A builtin exposed to the language. The table order below is what
/// `GetBuiltin` operands index, so it is frozen.
#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: fn(Vec<Value>) -> Value,
}

pub const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "len",
        func: builtin_len,
    },
    Builtin {
        name: "print",
        func: builtin_print,
    },
    Builtin {
        name: "first",
        func: builtin_first,
    },
    Builtin {
        name: "last",
        func: builtin_last,
    },
    Builtin {
        name: "rest",
        func: builtin_rest,
    },
    Builtin {
        name: "push",
        func: builtin_push,
    },
    Builtin {
        name: "pop",
        func: builtin_pop,
    },
    Builtin {
        name: "split",
        func: builtin_split,
    },
    Builtin {
        name: "join",
        func: builtin_join,
    },
];

pub fn builtin_by_name(name: &str) -> Option<Builtin> {
    BUILTINS.iter().find(|builtin| builtin.name == name).copied()
}

fn wrong_arg_count(got: usize, expected: usize) -> Value {
    Value::Error(format!(
        "Wrong number of arguments. Got: {got}, Expected: {expected}"
    ))
}

fn builtin_len(args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return wrong_arg_count(args.len(), 1);
    }
    match &args[0] {
        Value::Str(value) => Value::Int(value.len() as i64),
        Value::Array(elements) => Value::Int(elements.len() as i64),
        other => Value::Error(format!(
            "Argument to `len` not supported. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_print(args: Vec<Value>) -> Value {
    for arg in &args {
        println!("{}", arg.inspect());
    }
    Value::Null
}

fn builtin_first(args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return wrong_arg_count(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => elements.first().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "Argument to `first` must be an Array. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_last(args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return wrong_arg_count(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => elements.last().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "Argument to `last` must be an Array. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_rest(args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return wrong_arg_count(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::Array(Rc::new(elements[1..].to_vec()))
            }
        }
        other => Value::Error(format!(
            "Argument to `rest` must be an Array. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_push(args: Vec<Value>) -> Value {
    if args.len() != 2 {
        return wrong_arg_count(args.len(), 2);
    }
    match &args[0] {
        Value::Array(elements) => {
            let mut extended = elements.as_ref().clone();
            extended.push(args[1].clone());
            Value::Array(Rc::new(extended))
        }
        other => Value::Error(format!(
            "Argument to `push` must be an Array. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_pop(args: Vec<Value>) -> Value {
    if args.len() != 1 {
        return wrong_arg_count(args.len(), 1);
    }
    match &args[0] {
        Value::Array(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::Array(Rc::new(elements[..elements.len() - 1].to_vec()))
            }
        }
        other => Value::Error(format!(
            "Argument to `pop` must be an Array. Got: {}",
            other.kind()
        )),
    }
}

fn builtin_split(args: Vec<Value>) -> Value {
    if args.len() != 2 {
        return wrong_arg_count(args.len(), 2);
    }
    let (text, separator) = match (&args[0], &args[1]) {
        (Value::Str(text), Value::Str(separator)) => (text, separator),
        _ => {
            return Value::Error(format!(
                "Arguments to `split` must be Strings. Got: {}, {}",
                args[0].kind(),
                args[1].kind()
            ))
        }
    };

    // An empty separator splits into single-character strings.
    let parts: Vec<Value> = if separator.is_empty() {
        text.chars()
            .map(|ch| Value::Str(Rc::new(ch.to_string())))
            .collect()
    } else {
        text.split(separator.as_str())
            .map(|part| Value::Str(Rc::new(part.to_string())))
            .collect()
    };

    Value::Array(Rc::new(parts))
}

fn builtin_join(args: Vec<Value>) -> Value {
    if args.len() != 2 {
        return wrong_arg_count(args.len(), 2);
    }
    let (elements, separator) = match (&args[0], &args[1]) {
        (Value::Array(elements), Value::Str(separator)) => (elements, separator),
        _ => {
            return Value::Error(format!(
                "Arguments to `join` must be an Array and a String. Got: {}, {}",
                args[0].kind(),
                args[1].kind()
            ))
        }
    };

    let mut parts = Vec::with_capacity(elements.len());
    for element in elements.iter() {
        match element {
            Value::Str(part) => parts.push(part.as_str().to_string()),
            other => {
                return Value::Error(format!(
                    "Elements passed to `join` must be Strings. Got: {}",
                    other.kind()
                ))
            }
        }
    }

    Value::Str(Rc::new(parts.join(separator.as_str())))
}
