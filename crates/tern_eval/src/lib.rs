use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use tern_object::{
    builtin_by_name, coerce_to_bool, is_truthy, runtime_eq, Environment, FunctionValue, HashPair,
    Value,
};
use tern_syntax::{BlockStmt, Expr, FunctionLit, Ident, InfixOp, PostfixOp, PrefixOp, Program, Stmt};

/// Runtime failures are ordinary [`Value::Error`] values: they short-circuit
/// block evaluation the same way a `return` does and surface to the caller.
fn error_at(line: usize, message: String) -> Value {
    Value::Error(format!("{message} on line {line}"))
}

/// Evaluate a whole program. A `return` at the top level unwraps to its
/// inner value; the wrapper itself never escapes.
pub fn eval_program(program: &Program, env: &Rc<RefCell<Environment>>) -> Value {
    let mut result = Value::Null;

    for stmt in &program.statements {
        result = eval_stmt(stmt, env);
        match result {
            Value::ReturnValue(inner) => return inner.as_ref().clone(),
            Value::Error(_) => return result,
            _ => {}
        }
    }

    result
}

fn eval_stmt(stmt: &Stmt, env: &Rc<RefCell<Environment>>) -> Value {
    match stmt {
        Stmt::Let { name, value, .. } | Stmt::Const { name, value, .. } => {
            let value = eval_expr(value, env);
            if value.is_error() {
                return value;
            }
            env.borrow_mut().set(&name.name, value);
            Value::Null
        }
        Stmt::Return { value, .. } => {
            let result = match value {
                Some(expr) => eval_expr(expr, env),
                None => Value::Null,
            };
            if result.is_error() {
                return result;
            }
            Value::ReturnValue(Rc::new(result))
        }
        Stmt::Expr { expr, .. } => eval_expr(expr, env),
        Stmt::Block(block) => eval_block(block, env),
    }
}

/// Blocks propagate `ReturnValue` and `Error` results unchanged so they keep
/// unwinding through enclosing blocks.
fn eval_block(block: &BlockStmt, env: &Rc<RefCell<Environment>>) -> Value {
    let mut result = Value::Null;

    for stmt in &block.stmts {
        result = eval_stmt(stmt, env);
        if matches!(result, Value::ReturnValue(_) | Value::Error(_)) {
            return result;
        }
    }

    result
}

fn eval_expr(expr: &Expr, env: &Rc<RefCell<Environment>>) -> Value {
    match expr {
        Expr::Int { value, .. } => Value::Int(*value),
        Expr::Str { value, .. } => Value::Str(Rc::new(value.clone())),
        Expr::Bool { value, .. } => Value::Bool(*value),
        Expr::Ident(ident) => eval_identifier(ident, env),
        Expr::Prefix { op, right, line } => {
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_prefix(*op, right, *line)
        }
        Expr::Infix {
            op, left, right, line
        } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_infix(*op, left, right, *line)
        }
        Expr::Postfix { name, op, line } => eval_postfix(name, *op, *line, env),
        Expr::If {
            condition,
            consequence,
            alternative,
            ..
        } => {
            let condition = eval_expr(condition, env);
            if condition.is_error() {
                return condition;
            }
            if is_truthy(&condition) {
                eval_block(consequence, env)
            } else if let Some(alternative) = alternative {
                eval_block(alternative, env)
            } else {
                Value::Null
            }
        }
        Expr::Array { elements, .. } => {
            let elements = match eval_expressions(elements, env) {
                Ok(elements) => elements,
                Err(err) => return err,
            };
            Value::Array(Rc::new(elements))
        }
        Expr::Hash { pairs, line } => eval_hash_literal(pairs, *line, env),
        Expr::Index { left, index, line } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let index = eval_expr(index, env);
            if index.is_error() {
                return index;
            }
            eval_index(left, index, *line)
        }
        Expr::Function(func) => eval_function_literal(func, env),
        Expr::Call { callee, args, line } => {
            let callee = eval_expr(callee, env);
            if callee.is_error() {
                return callee;
            }
            let args = match eval_expressions(args, env) {
                Ok(args) => args,
                Err(err) => return err,
            };
            apply_function(callee, args, *line)
        }
    }
}

fn eval_identifier(ident: &Ident, env: &Rc<RefCell<Environment>>) -> Value {
    if let Some(value) = env.borrow().get(&ident.name) {
        return value;
    }
    if let Some(builtin) = builtin_by_name(&ident.name) {
        return Value::Builtin(builtin);
    }
    error_at(ident.line, format!("Identifier not found: {}", ident.name))
}

fn eval_prefix(op: PrefixOp, right: Value, line: usize) -> Value {
    match op {
        PrefixOp::Bang => Value::Bool(!is_truthy(&right)),
        PrefixOp::Minus => match right {
            Value::Int(value) => Value::Int(value.wrapping_neg()),
            other => error_at(line, format!("Unknown operator: -{}", other.kind())),
        },
    }
}

fn eval_infix(op: InfixOp, left: Value, right: Value, line: usize) -> Value {
    // Logical operators coerce any operand kinds; both sides were already
    // evaluated, so there is no short-circuit.
    if matches!(op, InfixOp::And | InfixOp::Or) {
        let left = coerce_to_bool(&left);
        let right = coerce_to_bool(&right);
        return Value::Bool(match op {
            InfixOp::And => left && right,
            _ => left || right,
        });
    }

    match (&left, &right) {
        (Value::Int(left), Value::Int(right)) => eval_integer_infix(op, *left, *right, line),
        _ => match op {
            InfixOp::Eq => Value::Bool(runtime_eq(&left, &right)),
            InfixOp::NotEq => Value::Bool(!runtime_eq(&left, &right)),
            InfixOp::Add if left.kind() == right.kind() => match (&left, &right) {
                (Value::Str(left), Value::Str(right)) => {
                    Value::Str(Rc::new(format!("{left}{right}")))
                }
                _ => error_at(
                    line,
                    format!("Unknown operator: {} {op} {}", left.kind(), right.kind()),
                ),
            },
            _ if left.kind() != right.kind() => error_at(
                line,
                format!("Type mismatch: {} {op} {}", left.kind(), right.kind()),
            ),
            _ => error_at(
                line,
                format!("Unknown operator: {} {op} {}", left.kind(), right.kind()),
            ),
        },
    }
}

fn eval_integer_infix(op: InfixOp, left: i64, right: i64, line: usize) -> Value {
    match op {
        InfixOp::Add => Value::Int(left.wrapping_add(right)),
        InfixOp::Sub => Value::Int(left.wrapping_sub(right)),
        InfixOp::Mul => Value::Int(left.wrapping_mul(right)),
        InfixOp::Div => {
            if right == 0 {
                error_at(line, "division by zero".to_string())
            } else {
                Value::Int(left.wrapping_div(right))
            }
        }
        InfixOp::Mod => {
            if right == 0 {
                error_at(line, "division by zero".to_string())
            } else {
                Value::Int(left.wrapping_rem(right))
            }
        }
        InfixOp::Lt => Value::Bool(left < right),
        InfixOp::Gt => Value::Bool(left > right),
        InfixOp::Le => Value::Bool(left <= right),
        InfixOp::Ge => Value::Bool(left >= right),
        InfixOp::Eq => Value::Bool(left == right),
        InfixOp::NotEq => Value::Bool(left != right),
        InfixOp::And | InfixOp::Or => unreachable!("logical operators handled before dispatch"),
    }
}

/// `x++`/`x--`: the expression's value is the binding's value before the
/// update; the binding is rebound where it was defined.
fn eval_postfix(name: &Ident, op: PostfixOp, line: usize, env: &Rc<RefCell<Environment>>) -> Value {
    let Some(current) = env.borrow().get(&name.name) else {
        return error_at(line, format!("Identifier not found: {}", name.name));
    };
    let Value::Int(value) = current else {
        return error_at(line, format!("Unknown operator: {}{op}", current.kind()));
    };

    let updated = match op {
        PostfixOp::Incr => value.wrapping_add(1),
        PostfixOp::Decr => value.wrapping_sub(1),
    };
    env.borrow_mut().assign(&name.name, Value::Int(updated));

    Value::Int(value)
}

fn eval_expressions(
    exprs: &[Expr],
    env: &Rc<RefCell<Environment>>,
) -> Result<Vec<Value>, Value> {
    let mut results = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let value = eval_expr(expr, env);
        if value.is_error() {
            return Err(value);
        }
        results.push(value);
    }
    Ok(results)
}

fn eval_hash_literal(
    pairs: &[(Expr, Expr)],
    line: usize,
    env: &Rc<RefCell<Environment>>,
) -> Value {
    let mut entries = IndexMap::new();

    for (key_expr, value_expr) in pairs {
        let key = eval_expr(key_expr, env);
        if key.is_error() {
            return key;
        }
        let Some(hash_key) = key.hash_key() else {
            return error_at(line, format!("Unusable as a hash key: {}", key.kind()));
        };
        let value = eval_expr(value_expr, env);
        if value.is_error() {
            return value;
        }
        entries.insert(hash_key, HashPair { key, value });
    }

    Value::Hash(Rc::new(entries))
}

fn eval_index(left: Value, index: Value, line: usize) -> Value {
    match (&left, &index) {
        (Value::Array(elements), Value::Int(i)) => {
            if *i < 0 || *i as usize >= elements.len() {
                Value::Null
            } else {
                elements[*i as usize].clone()
            }
        }
        (Value::Hash(pairs), _) => match index.hash_key() {
            Some(hash_key) => pairs
                .get(&hash_key)
                .map(|pair| pair.value.clone())
                .unwrap_or(Value::Null),
            None => error_at(line, format!("Unusable as a hash key: {}", index.kind())),
        },
        _ => error_at(
            line,
            format!("Index operator not supported: {}", left.kind()),
        ),
    }
}

fn eval_function_literal(func: &FunctionLit, env: &Rc<RefCell<Environment>>) -> Value {
    Value::Function(Rc::new(FunctionValue {
        params: func.params.clone(),
        body: func.body.clone(),
        env: env.clone(),
    }))
}

fn apply_function(callee: Value, args: Vec<Value>, line: usize) -> Value {
    match callee {
        Value::Function(func) => {
            if args.len() != func.params.len() {
                return error_at(
                    line,
                    format!(
                        "Wrong number of arguments. Got: {}, Expected: {}",
                        args.len(),
                        func.params.len()
                    ),
                );
            }
            let call_env = Environment::new_enclosed(func.env.clone());
            for (param, arg) in func.params.iter().zip(args) {
                call_env.borrow_mut().set(&param.name, arg);
            }
            let result = eval_block(&func.body, &call_env);
            unwrap_return_value(result)
        }
        Value::Builtin(builtin) => (builtin.func)(args),
        other => error_at(line, format!("Not a function: {}", other.kind())),
    }
}

fn unwrap_return_value(value: Value) -> Value {
    match value {
        Value::ReturnValue(inner) => inner.as_ref().clone(),
        other => other,
    }
}
