use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tern_code::{make, read_u16, read_u8, Instructions, Opcode};
use tern_object::{
    coerce_to_bool, is_truthy, runtime_eq, ClosureValue, CompiledFunction, HashPair, Value,
    BUILTINS,
};
use tern_syntax::{BlockStmt, Expr, FunctionLit, InfixOp, PostfixOp, PrefixOp, Program, Stmt};

/// Capacity of the value stack.
pub const STACK_SIZE: usize = 2048;
/// Upper limit on global bindings.
pub const GLOBALS_SIZE: usize = 65536;
/// Upper limit on nested call frames.
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

/// Maps identifiers to `(scope, index)` pairs. Tables chain outward through
/// `outer`; one table per function scope. Resolving a local of an enclosing
/// function records it in `free_symbols` and rewrites it as a `Free` symbol
/// at every intermediate table on the way back down.
#[derive(Debug, Default)]
pub struct SymbolTable {
    store: HashMap<String, Symbol>,
    pub num_definitions: usize,
    outer: Option<Box<SymbolTable>>,
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        SymbolTable {
            outer: Some(Box::new(outer)),
            ..SymbolTable::default()
        }
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// The binding name of the function currently being compiled, resolved
    /// to `CurrentClosure` rather than captured as a free variable.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: self.free_symbols.len(),
        };
        self.free_symbols.push(original);
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        if matches!(symbol.scope, SymbolScope::Global | SymbolScope::Builtin) {
            return Some(symbol);
        }
        Some(self.define_free(symbol))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    UndefinedVariable { name: String, line: usize },
    InvalidPostfixTarget { name: String, line: usize },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UndefinedVariable { name, line } => {
                write!(f, "compile error on line {line}: undefined variable {name}")
            }
            CompileError::InvalidPostfixTarget { name, line } => {
                write!(
                    f,
                    "compile error on line {line}: postfix target must be a global or local binding: {name}"
                )
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// What the compiler hands the VM: one instruction stream for the top level
/// plus the constant pool it references.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(index, builtin.name);
        }
        Compiler {
            constants: Vec::new(),
            symbol_table,
            scopes: vec![CompilationScope::default()],
        }
    }

    /// Rebuild a compiler around state preserved from an earlier run, so a
    /// REPL can keep its globals and constant pool across lines.
    pub fn new_with_state(symbol_table: SymbolTable, constants: Vec<Value>) -> Self {
        Compiler {
            constants,
            symbol_table,
            scopes: vec![CompilationScope::default()],
        }
    }

    /// Hand the symbol table and constant pool back for the next
    /// [`Compiler::new_with_state`].
    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbol_table, self.constants)
    }

    pub fn compile(&mut self, program: &Program) -> Result<Bytecode, CompileError> {
        self.scopes = vec![CompilationScope::default()];

        for stmt in &program.statements {
            self.compile_stmt(stmt)?;
        }

        Ok(self.bytecode())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.scopes[self.scope_index()].instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    fn scope_index(&self) -> usize {
        self.scopes.len() - 1
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, value, .. } | Stmt::Const { name, value, .. } => {
                // Define before compiling the value so a function literal can
                // resolve its own binding name.
                let symbol = self.symbol_table.define(&name.name);

                if let Expr::Function(func) = value {
                    let mut named = func.clone();
                    named.name = Some(name.name.clone());
                    self.compile_function_literal(&named)?;
                } else {
                    self.compile_expr(value)?;
                }

                match symbol.scope {
                    SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
                    _ => self.emit(Opcode::SetLocal, &[symbol.index]),
                };
                Ok(())
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => {
                        self.compile_expr(value)?;
                        self.emit(Opcode::ReturnValue, &[]);
                    }
                    None => {
                        self.emit(Opcode::Return, &[]);
                    }
                }
                Ok(())
            }
            Stmt::Expr { expr, .. } => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Stmt::Block(block) => self.compile_block(block),
        }
    }

    fn compile_block(&mut self, block: &BlockStmt) -> Result<(), CompileError> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Ident(ident) => match self.symbol_table.resolve(&ident.name) {
                Some(symbol) => {
                    self.load_symbol(&symbol);
                    Ok(())
                }
                None => Err(CompileError::UndefinedVariable {
                    name: ident.name.clone(),
                    line: ident.line,
                }),
            },
            Expr::Int { value, .. } => {
                let index = self.add_constant(Value::Int(*value));
                self.emit(Opcode::Constant, &[index]);
                Ok(())
            }
            Expr::Str { value, .. } => {
                let index = self.add_constant(Value::Str(Rc::new(value.clone())));
                self.emit(Opcode::Constant, &[index]);
                Ok(())
            }
            Expr::Bool { value, .. } => {
                if *value {
                    self.emit(Opcode::True, &[]);
                } else {
                    self.emit(Opcode::False, &[]);
                }
                Ok(())
            }
            Expr::Prefix { op, right, .. } => {
                self.compile_expr(right)?;
                match op {
                    PrefixOp::Bang => self.emit(Opcode::Bang, &[]),
                    PrefixOp::Minus => self.emit(Opcode::Minus, &[]),
                };
                Ok(())
            }
            Expr::Infix { op, left, right, .. } => self.compile_infix(*op, left, right),
            Expr::Postfix { name, op, line } => {
                let Some(symbol) = self.symbol_table.resolve(&name.name) else {
                    return Err(CompileError::UndefinedVariable {
                        name: name.name.clone(),
                        line: *line,
                    });
                };
                // The VM finds the slot to write back by re-reading the load
                // emitted here, so only direct global/local loads qualify.
                match symbol.scope {
                    SymbolScope::Global | SymbolScope::Local => self.load_symbol(&symbol),
                    _ => {
                        return Err(CompileError::InvalidPostfixTarget {
                            name: name.name.clone(),
                            line: *line,
                        })
                    }
                }
                match op {
                    PostfixOp::Incr => self.emit(Opcode::PlusPlus, &[]),
                    PostfixOp::Decr => self.emit(Opcode::MinusMinus, &[]),
                };
                Ok(())
            }
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                self.compile_expr(condition)?;

                // Placeholder target, patched after the consequence.
                let jump_not_truthy_pos = self.emit(Opcode::JumpNotTruthy, &[9999]);

                self.compile_block(consequence)?;
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_pop();
                }

                let jump_pos = self.emit(Opcode::Jump, &[9999]);

                let after_consequence = self.current_instructions().len();
                self.change_operand(jump_not_truthy_pos, after_consequence);

                match alternative {
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                    Some(alternative) => {
                        self.compile_block(alternative)?;
                        if self.last_instruction_is(Opcode::Pop) {
                            self.remove_last_pop();
                        }
                    }
                }

                let after_alternative = self.current_instructions().len();
                self.change_operand(jump_pos, after_alternative);

                Ok(())
            }
            Expr::Array { elements, .. } => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
                Ok(())
            }
            Expr::Hash { pairs, .. } => {
                // Sort keys by their source form so compilation is
                // deterministic.
                let mut sorted: Vec<&(Expr, Expr)> = pairs.iter().collect();
                sorted.sort_by_key(|(key, _)| key.to_string());

                for (key, value) in sorted {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2]);
                Ok(())
            }
            Expr::Index { left, index, .. } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Opcode::Index, &[]);
                Ok(())
            }
            Expr::Function(func) => self.compile_function_literal(func),
            Expr::Call { callee, args, .. } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Call, &[args.len()]);
                Ok(())
            }
        }
    }

    fn compile_infix(&mut self, op: InfixOp, left: &Expr, right: &Expr) -> Result<(), CompileError> {
        match op {
            // `<` compiles as `>` with swapped operands.
            InfixOp::Lt => {
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Opcode::GreaterThan, &[]);
            }
            // `<=` and `>=` are the negated strict comparisons.
            InfixOp::Le => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Opcode::GreaterThan, &[]);
                self.emit(Opcode::Bang, &[]);
            }
            InfixOp::Ge => {
                self.compile_expr(right)?;
                self.compile_expr(left)?;
                self.emit(Opcode::GreaterThan, &[]);
                self.emit(Opcode::Bang, &[]);
            }
            _ => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                match op {
                    InfixOp::Add => self.emit(Opcode::Add, &[]),
                    InfixOp::Sub => self.emit(Opcode::Sub, &[]),
                    InfixOp::Mul => self.emit(Opcode::Mul, &[]),
                    InfixOp::Div => self.emit(Opcode::Div, &[]),
                    InfixOp::Mod => self.emit(Opcode::Mod, &[]),
                    InfixOp::Eq => self.emit(Opcode::EqualEqual, &[]),
                    InfixOp::NotEq => self.emit(Opcode::NotEqual, &[]),
                    InfixOp::Gt => self.emit(Opcode::GreaterThan, &[]),
                    InfixOp::And => self.emit(Opcode::And, &[]),
                    InfixOp::Or => self.emit(Opcode::Or, &[]),
                    InfixOp::Lt | InfixOp::Le | InfixOp::Ge => unreachable!("handled above"),
                };
            }
        }
        Ok(())
    }

    fn compile_function_literal(&mut self, func: &FunctionLit) -> Result<(), CompileError> {
        self.enter_scope();

        if let Some(name) = &func.name {
            self.symbol_table.define_function_name(name);
        }
        for param in &func.params {
            self.symbol_table.define(&param.name);
        }

        self.compile_block(&func.body)?;

        // The last expression of a body is its return value; a body that
        // ends some other way returns null.
        if self.last_instruction_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_is(Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[]);
        }

        let (instructions, free_symbols, num_locals) = self.leave_scope();

        // Rebuild each captured binding on the stack, outermost first, so
        // `Closure` can collect them.
        for symbol in &free_symbols {
            self.load_symbol(symbol);
        }

        let fn_index = self.add_constant(Value::CompiledFunction(Rc::new(CompiledFunction {
            instructions,
            num_locals,
            num_parameters: func.params.len(),
        })));
        self.emit(Opcode::Closure, &[fn_index, free_symbols.len()]);

        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[]),
        };
    }

    /// Constant indices are handed out once and stay stable; the pool is
    /// deliberately not deduplicated so each literal keeps its own identity.
    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let instruction = make(op, operands);
        let position = self.add_instruction(&instruction);
        self.set_last_instruction(op, position);
        position
    }

    fn add_instruction(&mut self, instruction: &[u8]) -> usize {
        let scope = self.scopes.last_mut().expect("a scope is always active");
        let position = scope.instructions.len();
        scope.instructions.extend(instruction);
        position
    }

    fn set_last_instruction(&mut self, opcode: Opcode, position: usize) {
        let scope = self.scopes.last_mut().expect("a scope is always active");
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn current_instructions(&self) -> &Instructions {
        &self.scopes.last().expect("a scope is always active").instructions
    }

    fn last_instruction_is(&self, opcode: Opcode) -> bool {
        let scope = self.scopes.last().expect("a scope is always active");
        matches!(scope.last_instruction, Some(last) if last.opcode == opcode)
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scopes.last_mut().expect("a scope is always active");
        let last = scope.last_instruction.expect("a Pop was just emitted");
        scope.instructions.0.truncate(last.position);
        scope.last_instruction = scope.previous_instruction;
    }

    fn replace_instruction(&mut self, position: usize, instruction: &[u8]) {
        let scope = self.scopes.last_mut().expect("a scope is always active");
        scope.instructions.0[position..position + instruction.len()]
            .copy_from_slice(instruction);
    }

    fn replace_last_pop_with_return(&mut self) {
        let last = self
            .scopes
            .last()
            .expect("a scope is always active")
            .last_instruction
            .expect("a Pop was just emitted");
        self.replace_instruction(last.position, &make(Opcode::ReturnValue, &[]));
        let scope = self.scopes.last_mut().expect("a scope is always active");
        scope.last_instruction = Some(EmittedInstruction {
            opcode: Opcode::ReturnValue,
            position: last.position,
        });
    }

    fn change_operand(&mut self, op_position: usize, operand: usize) {
        let op = Opcode::from_byte(
            self.current_instructions().0[op_position],
        )
        .expect("operand patching targets a previously emitted opcode");
        self.replace_instruction(op_position, &make(op, &[operand]));
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> (Instructions, Vec<Symbol>, usize) {
        let scope = self.scopes.pop().expect("leave_scope pairs with enter_scope");
        let table = std::mem::take(&mut self.symbol_table);
        let free_symbols = table.free_symbols;
        let num_definitions = table.num_definitions;
        self.symbol_table = match table.outer {
            Some(outer) => *outer,
            None => SymbolTable::new(),
        };
        (scope.instructions, free_symbols, num_definitions)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// One activation record: the running closure, its instruction pointer, and
/// where its locals start on the value stack.
#[derive(Debug, Clone)]
pub struct Frame {
    closure: Rc<ClosureValue>,
    ip: isize,
    base_pointer: usize,
}

impl Frame {
    fn new(closure: Rc<ClosureValue>, base_pointer: usize) -> Self {
        Frame {
            closure,
            ip: -1,
            base_pointer,
        }
    }

    fn instructions(&self) -> &Instructions {
        &self.closure.func.instructions
    }
}

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Points at the next free stack slot; the top of stack is `stack[sp-1]`.
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_globals_state(bytecode, vec![Value::Null; GLOBALS_SIZE])
    }

    /// Build a VM around a preserved globals array so a REPL can keep
    /// bindings alive across lines.
    pub fn new_with_globals_state(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main_fn = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(ClosureValue {
            func: main_fn,
            free: Vec::new(),
        });

        Vm {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![Frame::new(main_closure, 0)],
        }
    }

    /// Hand the globals array back for the next
    /// [`Vm::new_with_globals_state`].
    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    /// The program's result: popped values are never cleared, so the slot
    /// just past the stack pointer holds the last one.
    pub fn last_popped_stack_element(&self) -> Value {
        self.stack[self.sp].clone()
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("a frame is active while running")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("a frame is active while running")
    }

    fn read_u16_operand(&self, ip: usize) -> usize {
        read_u16(&self.current_frame().instructions().0[ip + 1..]) as usize
    }

    fn read_u8_operand(&self, ip: usize) -> usize {
        read_u8(&self.current_frame().instructions().0[ip + 1..]) as usize
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= STACK_SIZE {
            return Err(RuntimeError::new("stack overflow"));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::new("stack underflow"));
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    /// The fetch-decode-execute loop. Runs until the main frame's
    /// instructions are exhausted or an error aborts the run.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let can_advance = match self.frames.last() {
                Some(frame) => frame.ip < frame.instructions().len() as isize - 1,
                None => false,
            };
            if !can_advance {
                break;
            }

            self.current_frame_mut().ip += 1;
            let ip = self.current_frame().ip as usize;
            let op_byte = self.current_frame().instructions().0[ip];
            let op = Opcode::from_byte(op_byte)
                .ok_or_else(|| RuntimeError::new(format!("undefined opcode {op_byte}")))?;

            match op {
                Opcode::Constant => {
                    let index = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    let constant = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::new(format!("constant index {index} out of range"))
                        })?;
                    self.push(constant)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    self.execute_binary_operation(op)?;
                }
                Opcode::True => self.push(Value::Bool(true))?,
                Opcode::False => self.push(Value::Bool(false))?,
                Opcode::Null => self.push(Value::Null)?,
                Opcode::EqualEqual | Opcode::NotEqual | Opcode::GreaterThan => {
                    self.execute_comparison(op)?;
                }
                Opcode::And | Opcode::Or => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let (left, right) = (coerce_to_bool(&left), coerce_to_bool(&right));
                    let result = if op == Opcode::And {
                        left && right
                    } else {
                        left || right
                    };
                    self.push(Value::Bool(result))?;
                }
                Opcode::Minus => {
                    let operand = self.pop()?;
                    match operand {
                        Value::Int(value) => self.push(Value::Int(value.wrapping_neg()))?,
                        other => {
                            return Err(RuntimeError::new(format!(
                                "Unsupported type for negation: {}",
                                other.kind()
                            )))
                        }
                    }
                }
                Opcode::Bang => {
                    let operand = self.pop()?;
                    self.push(Value::Bool(!is_truthy(&operand)))?;
                }
                Opcode::PlusPlus | Opcode::MinusMinus => {
                    self.execute_postfix(op, ip)?;
                }
                Opcode::Jump => {
                    let target = self.read_u16_operand(ip);
                    self.current_frame_mut().ip = target as isize - 1;
                }
                Opcode::JumpNotTruthy => {
                    let target = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    let condition = self.pop()?;
                    if !is_truthy(&condition) {
                        self.current_frame_mut().ip = target as isize - 1;
                    }
                }
                Opcode::SetGlobal => {
                    let index = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    self.globals[index] = self.pop()?;
                }
                Opcode::GetGlobal => {
                    let index = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    self.push(self.globals[index].clone())?;
                }
                Opcode::SetLocal => {
                    let index = self.read_u8_operand(ip);
                    self.current_frame_mut().ip += 1;
                    let slot = self.current_frame().base_pointer + index;
                    self.stack[slot] = self.pop()?;
                }
                Opcode::GetLocal => {
                    let index = self.read_u8_operand(ip);
                    self.current_frame_mut().ip += 1;
                    let slot = self.current_frame().base_pointer + index;
                    self.push(self.stack[slot].clone())?;
                }
                Opcode::GetBuiltin => {
                    let index = self.read_u8_operand(ip);
                    self.current_frame_mut().ip += 1;
                    let builtin = BUILTINS.get(index).copied().ok_or_else(|| {
                        RuntimeError::new(format!("builtin index {index} out of range"))
                    })?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::Array => {
                    let count = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Value::Array(Rc::new(elements)))?;
                }
                Opcode::Hash => {
                    let count = self.read_u16_operand(ip);
                    self.current_frame_mut().ip += 2;
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }
                Opcode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index_expression(left, index)?;
                }
                Opcode::Call => {
                    let num_args = self.read_u8_operand(ip);
                    self.current_frame_mut().ip += 1;
                    self.execute_call(num_args)?;
                }
                Opcode::ReturnValue => {
                    let return_value = self.pop()?;
                    if self.return_from_frame(return_value)? {
                        break;
                    }
                }
                Opcode::Return => {
                    if self.return_from_frame(Value::Null)? {
                        break;
                    }
                }
                Opcode::Closure => {
                    let const_index = self.read_u16_operand(ip);
                    let num_free = read_u8(&self.current_frame().instructions().0[ip + 3..]) as usize;
                    self.current_frame_mut().ip += 3;
                    self.push_closure(const_index, num_free)?;
                }
                Opcode::GetFree => {
                    let index = self.read_u8_operand(ip);
                    self.current_frame_mut().ip += 1;
                    let free = self.current_frame().closure.free[index].clone();
                    self.push(free)?;
                }
                Opcode::CurrentClosure => {
                    let closure = self.current_frame().closure.clone();
                    self.push(Value::Closure(closure))?;
                }
            }
        }

        Ok(())
    }

    /// Pop the current frame and push `value` as the call's result. Returns
    /// true when the main frame itself returned and the run is over.
    fn return_from_frame(&mut self, value: Value) -> Result<bool, RuntimeError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::new("return outside of any frame"))?;

        if self.frames.is_empty() {
            // A top-level `return`: expose the value as the program result.
            self.sp = 0;
            self.push(value)?;
            self.pop()?;
            return Ok(true);
        }

        self.sp = frame.base_pointer - 1;
        self.push(value)?;
        Ok(false)
    }

    fn execute_binary_operation(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;

        match (&left, &right) {
            (Value::Int(left), Value::Int(right)) => {
                self.execute_binary_integer_operation(op, *left, *right)
            }
            (Value::Str(left), Value::Str(right)) => {
                if op != Opcode::Add {
                    return Err(RuntimeError::new(format!(
                        "Unknown String operator: {}",
                        op.name()
                    )));
                }
                let concatenated = format!("{left}{right}");
                self.push(Value::Str(Rc::new(concatenated)))
            }
            _ => Err(RuntimeError::new(format!(
                "Unsupported types for binary operation: {} {}",
                left.kind(),
                right.kind()
            ))),
        }
    }

    fn execute_binary_integer_operation(
        &mut self,
        op: Opcode,
        left: i64,
        right: i64,
    ) -> Result<(), RuntimeError> {
        let result = match op {
            Opcode::Add => left.wrapping_add(right),
            Opcode::Sub => left.wrapping_sub(right),
            Opcode::Mul => left.wrapping_mul(right),
            Opcode::Div => {
                if right == 0 {
                    return Err(RuntimeError::new("division by zero"));
                }
                left.wrapping_div(right)
            }
            Opcode::Mod => {
                if right == 0 {
                    return Err(RuntimeError::new("division by zero"));
                }
                left.wrapping_rem(right)
            }
            other => {
                return Err(RuntimeError::new(format!(
                    "Unknown integer operator: {}",
                    other.name()
                )))
            }
        };
        self.push(Value::Int(result))
    }

    fn execute_comparison(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;

        if let (Value::Int(left), Value::Int(right)) = (&left, &right) {
            let result = match op {
                Opcode::EqualEqual => left == right,
                Opcode::NotEqual => left != right,
                Opcode::GreaterThan => left > right,
                other => {
                    return Err(RuntimeError::new(format!(
                        "Unknown integer operator: {}",
                        other.name()
                    )))
                }
            };
            return self.push(Value::Bool(result));
        }

        match op {
            Opcode::EqualEqual => self.push(Value::Bool(runtime_eq(&left, &right))),
            Opcode::NotEqual => self.push(Value::Bool(!runtime_eq(&left, &right))),
            other => Err(RuntimeError::new(format!(
                "Unknown operator: {} ({} {})",
                other.name(),
                left.kind(),
                right.kind()
            ))),
        }
    }

    /// `x++`/`x--`: the compiler guarantees a `GetGlobal`/`GetLocal` of the
    /// same slot directly precedes the postfix opcode, so the slot to write
    /// back is recovered from the bytes before `ip`. The pre-update value
    /// stays on the stack as the expression's result.
    fn execute_postfix(&mut self, op: Opcode, ip: usize) -> Result<(), RuntimeError> {
        let operand = self.pop()?;
        let Value::Int(value) = operand else {
            let suffix = if op == Opcode::PlusPlus { "++" } else { "--" };
            return Err(RuntimeError::new(format!(
                "Unknown operator: {}{suffix}",
                operand.kind()
            )));
        };

        let updated = if op == Opcode::PlusPlus {
            value.wrapping_add(1)
        } else {
            value.wrapping_sub(1)
        };

        let global_slot = {
            let ins = &self.current_frame().instructions().0;
            if ip >= 3 && ins[ip - 3] == Opcode::GetGlobal as u8 {
                Some(read_u16(&ins[ip - 2..]) as usize)
            } else if ip >= 2 && ins[ip - 2] == Opcode::GetLocal as u8 {
                None
            } else {
                return Err(RuntimeError::new(
                    "postfix operator without a preceding binding load",
                ));
            }
        };

        match global_slot {
            Some(index) => self.globals[index] = Value::Int(updated),
            None => {
                let index = {
                    let ins = &self.current_frame().instructions().0;
                    read_u8(&ins[ip - 1..]) as usize
                };
                let slot = self.current_frame().base_pointer + index;
                self.stack[slot] = Value::Int(updated);
            }
        }

        self.push(Value::Int(value))
    }

    fn build_hash(&self, start: usize, end: usize) -> Result<Value, RuntimeError> {
        let mut pairs = IndexMap::new();

        let mut i = start;
        while i < end {
            let key = self.stack[i].clone();
            let value = self.stack[i + 1].clone();

            let hash_key = key.hash_key().ok_or_else(|| {
                RuntimeError::new(format!("Unusable as a hash key: {}", key.kind()))
            })?;
            pairs.insert(hash_key, HashPair { key, value });

            i += 2;
        }

        Ok(Value::Hash(Rc::new(pairs)))
    }

    fn execute_index_expression(&mut self, left: Value, index: Value) -> Result<(), RuntimeError> {
        match (&left, &index) {
            (Value::Array(elements), Value::Int(i)) => {
                if *i < 0 || *i as usize >= elements.len() {
                    self.push(Value::Null)
                } else {
                    self.push(elements[*i as usize].clone())
                }
            }
            (Value::Hash(pairs), _) => {
                let hash_key = index.hash_key().ok_or_else(|| {
                    RuntimeError::new(format!("Unusable as a hash key: {}", index.kind()))
                })?;
                match pairs.get(&hash_key) {
                    Some(pair) => self.push(pair.value.clone()),
                    None => self.push(Value::Null),
                }
            }
            _ => Err(RuntimeError::new(format!(
                "Index operator not supported: {}",
                left.kind()
            ))),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> Result<(), RuntimeError> {
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, num_args),
            Value::Builtin(builtin) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                let result = (builtin.func)(args);
                self.sp = self.sp - num_args - 1;
                if let Value::Error(message) = result {
                    return Err(RuntimeError::new(message));
                }
                self.push(result)
            }
            other => Err(RuntimeError::new(format!(
                "calling non-function: {}",
                other.kind()
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<ClosureValue>,
        num_args: usize,
    ) -> Result<(), RuntimeError> {
        if num_args != closure.func.num_parameters {
            return Err(RuntimeError::new(format!(
                "Wrong number of arguments. Got: {num_args}, Expected: {}",
                closure.func.num_parameters
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(RuntimeError::new(format!(
                "stack overflow: maximum call depth {MAX_FRAMES} exceeded"
            )));
        }

        let base_pointer = self.sp - num_args;
        let num_locals = closure.func.num_locals;
        if base_pointer + num_locals > STACK_SIZE {
            return Err(RuntimeError::new("stack overflow"));
        }

        // Arguments already sit on the stack as the first locals; the rest
        // of the local slots are reserved by bumping sp.
        self.frames.push(Frame::new(closure, base_pointer));
        self.sp = base_pointer + num_locals;
        Ok(())
    }

    fn push_closure(&mut self, const_index: usize, num_free: usize) -> Result<(), RuntimeError> {
        let constant = self
            .constants
            .get(const_index)
            .cloned()
            .ok_or_else(|| RuntimeError::new(format!("constant index {const_index} out of range")))?;
        let Value::CompiledFunction(func) = constant else {
            return Err(RuntimeError::new(format!(
                "not a function: {}",
                constant.kind()
            )));
        };

        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;

        self.push(Value::Closure(Rc::new(ClosureValue { func, free })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_parser::parse;

    fn parse_program(source: &str) -> Program {
        parse(source).expect("parse program")
    }

    fn compile_source(source: &str) -> Bytecode {
        Compiler::new()
            .compile(&parse_program(source))
            .expect("compile program")
    }

    fn run_source(source: &str) -> Value {
        let mut vm = Vm::new(compile_source(source));
        vm.run().expect("run program");
        vm.last_popped_stack_element()
    }

    fn run_error(source: &str) -> RuntimeError {
        let mut vm = Vm::new(compile_source(source));
        vm.run().expect_err("expected runtime error")
    }

    fn concat(instructions: &[Vec<u8>]) -> Instructions {
        let mut out = Instructions::new();
        for ins in instructions {
            out.extend(ins);
        }
        out
    }

    fn assert_instructions(source: &str, expected: &[Vec<u8>]) {
        let bytecode = compile_source(source);
        let expected = concat(expected);
        assert_eq!(
            bytecode.instructions, expected,
            "source: {source}\nwant:\n{expected}\ngot:\n{}",
            bytecode.instructions
        );
    }

    fn assert_int(source: &str, expected: i64) {
        assert_eq!(run_source(source), Value::Int(expected), "source: {source}");
    }

    fn assert_bool(source: &str, expected: bool) {
        assert_eq!(run_source(source), Value::Bool(expected), "source: {source}");
    }

    mod symbol_table {
        use super::super::*;

        #[test]
        fn define_and_resolve_globals() {
            let mut global = SymbolTable::new();
            let a = global.define("a");
            assert_eq!(
                a,
                Symbol {
                    name: "a".to_string(),
                    scope: SymbolScope::Global,
                    index: 0
                }
            );
            let b = global.define("b");
            assert_eq!(b.index, 1);
            assert_eq!(global.resolve("a"), Some(a));
            assert_eq!(global.resolve("missing"), None);
        }

        #[test]
        fn locals_resolve_through_enclosing_scopes() {
            let mut global = SymbolTable::new();
            global.define("a");
            let mut local = SymbolTable::new_enclosed(global);
            local.define("c");

            let a = local.resolve("a").expect("resolve a");
            assert_eq!(a.scope, SymbolScope::Global);
            let c = local.resolve("c").expect("resolve c");
            assert_eq!(c.scope, SymbolScope::Local);
            assert_eq!(c.index, 0);
        }

        #[test]
        fn free_variables_are_captured_transitively() {
            let mut global = SymbolTable::new();
            global.define("a");
            let mut first = SymbolTable::new_enclosed(global);
            first.define("c");
            let mut second = SymbolTable::new_enclosed(first);
            second.define("e");

            // `c` lives in the enclosing function: captured as free.
            let c = second.resolve("c").expect("resolve c");
            assert_eq!(c.scope, SymbolScope::Free);
            assert_eq!(c.index, 0);
            // Globals resolve verbatim, no capture.
            let a = second.resolve("a").expect("resolve a");
            assert_eq!(a.scope, SymbolScope::Global);
            // Locals stay local.
            let e = second.resolve("e").expect("resolve e");
            assert_eq!(e.scope, SymbolScope::Local);

            assert_eq!(second.free_symbols.len(), 1);
            assert_eq!(second.free_symbols[0].name, "c");
            assert_eq!(second.free_symbols[0].scope, SymbolScope::Local);

            // A second resolve finds the Free rewrite directly.
            let c_again = second.resolve("c").expect("resolve c again");
            assert_eq!(c_again.scope, SymbolScope::Free);
            assert_eq!(second.free_symbols.len(), 1);
        }

        #[test]
        fn builtins_resolve_without_capture() {
            let mut global = SymbolTable::new();
            global.define_builtin(0, "len");
            let mut nested = SymbolTable::new_enclosed(SymbolTable::new_enclosed(global));

            let len = nested.resolve("len").expect("resolve len");
            assert_eq!(len.scope, SymbolScope::Builtin);
            assert_eq!(len.index, 0);
            assert!(nested.free_symbols.is_empty());
        }

        #[test]
        fn function_name_resolves_to_function_scope() {
            let mut inner = SymbolTable::new_enclosed(SymbolTable::new());
            inner.define_function_name("fib");

            let fib = inner.resolve("fib").expect("resolve fib");
            assert_eq!(fib.scope, SymbolScope::Function);
            assert_eq!(fib.index, 0);

            // A later local shadows the function name.
            inner.define("fib");
            let shadowed = inner.resolve("fib").expect("resolve shadowed fib");
            assert_eq!(shadowed.scope, SymbolScope::Local);
        }
    }

    mod compiler {
        use super::*;

        #[test]
        fn integer_arithmetic() {
            assert_instructions(
                "1 + 2",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Add, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "1; 2",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Pop, &[]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "7 % 3",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Mod, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "-1",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Minus, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn the_constant_pool_is_not_deduplicated() {
            let bytecode = compile_source("1 + 1");
            assert_eq!(bytecode.constants, vec![Value::Int(1), Value::Int(1)]);
        }

        #[test]
        fn boolean_and_comparison_expressions() {
            assert_instructions(
                "true",
                &[make(Opcode::True, &[]), make(Opcode::Pop, &[])],
            );
            assert_instructions(
                "1 > 2",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::GreaterThan, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            // `<` swaps its operands and reuses GreaterThan.
            assert_instructions(
                "1 < 2",
                &[
                    make(Opcode::Constant, &[0]), // 2
                    make(Opcode::Constant, &[1]), // 1
                    make(Opcode::GreaterThan, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "1 <= 2",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::GreaterThan, &[]),
                    make(Opcode::Bang, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "1 >= 2",
                &[
                    make(Opcode::Constant, &[0]), // 2
                    make(Opcode::Constant, &[1]), // 1
                    make(Opcode::GreaterThan, &[]),
                    make(Opcode::Bang, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "true != false",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::False, &[]),
                    make(Opcode::NotEqual, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "!true",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::Bang, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn logical_operators() {
            assert_instructions(
                "true && false",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::False, &[]),
                    make(Opcode::And, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "true || false",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::False, &[]),
                    make(Opcode::Or, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn conditionals() {
            assert_instructions(
                "if (true) { 10 }; 3333;",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::JumpNotTruthy, &[10]),
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Jump, &[11]),
                    make(Opcode::Null, &[]),
                    make(Opcode::Pop, &[]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "if (true) { 10 } else { 20 }; 3333;",
                &[
                    make(Opcode::True, &[]),
                    make(Opcode::JumpNotTruthy, &[10]),
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Jump, &[13]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Pop, &[]),
                    make(Opcode::Constant, &[2]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn global_let_statements() {
            assert_instructions(
                "let one = 1; let two = 2; one;",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::SetGlobal, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::SetGlobal, &[1]),
                    make(Opcode::GetGlobal, &[0]),
                    make(Opcode::Pop, &[]),
                ],
            );
            // `const` compiles exactly like `let`.
            assert_instructions(
                "const one = 1; one;",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::SetGlobal, &[0]),
                    make(Opcode::GetGlobal, &[0]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn undefined_variables_abort_compilation() {
            let err = Compiler::new()
                .compile(&parse_program("foobar"))
                .expect_err("expected compile error");
            assert_eq!(
                err,
                CompileError::UndefinedVariable {
                    name: "foobar".to_string(),
                    line: 1
                }
            );
            assert!(err.to_string().contains("undefined variable foobar"));
        }

        #[test]
        fn string_expressions() {
            let bytecode = compile_source("\"ter\" + \"n\"");
            assert_eq!(
                bytecode.instructions,
                concat(&[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Add, &[]),
                    make(Opcode::Pop, &[]),
                ])
            );
            assert_eq!(bytecode.constants[0].inspect(), "ter");
            assert_eq!(bytecode.constants[1].inspect(), "n");
        }

        #[test]
        fn array_literals() {
            assert_instructions(
                "[1, 2, 3]",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Constant, &[2]),
                    make(Opcode::Array, &[3]),
                    make(Opcode::Pop, &[]),
                ],
            );
            assert_instructions(
                "[]",
                &[make(Opcode::Array, &[0]), make(Opcode::Pop, &[])],
            );
        }

        #[test]
        fn hash_literals_sort_keys_by_source_form() {
            // Keys compile in textual order ("a" < "b" < "c"), regardless of
            // their order in the literal.
            let bytecode = compile_source("{\"c\": 3, \"a\": 1, \"b\": 2}");
            assert_eq!(
                bytecode.instructions,
                concat(&[
                    make(Opcode::Constant, &[0]), // "a"
                    make(Opcode::Constant, &[1]), // 1
                    make(Opcode::Constant, &[2]), // "b"
                    make(Opcode::Constant, &[3]), // 2
                    make(Opcode::Constant, &[4]), // "c"
                    make(Opcode::Constant, &[5]), // 3
                    make(Opcode::Hash, &[6]),
                    make(Opcode::Pop, &[]),
                ])
            );
            assert_eq!(bytecode.constants[0].inspect(), "a");
            assert_eq!(bytecode.constants[4].inspect(), "c");
        }

        #[test]
        fn compiling_twice_yields_identical_bytecode() {
            let program = parse_program("let f = func(x) { {\"b\": x, \"a\": x + 1} }; f(1)");
            let first = Compiler::new().compile(&program).expect("first compile");
            let second = Compiler::new().compile(&program).expect("second compile");
            assert_eq!(first.instructions, second.instructions);
            assert_eq!(first.constants, second.constants);
        }

        #[test]
        fn index_expressions() {
            assert_instructions(
                "[1, 2][1]",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Array, &[2]),
                    make(Opcode::Constant, &[2]),
                    make(Opcode::Index, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn functions_and_implicit_returns() {
            let bytecode = compile_source("func() { 5 + 10 }");
            let Value::CompiledFunction(func) = &bytecode.constants[2] else {
                panic!("expected compiled function constant");
            };
            assert_eq!(
                func.instructions,
                concat(&[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Add, &[]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
            assert_eq!(
                bytecode.instructions,
                concat(&[make(Opcode::Closure, &[2, 0]), make(Opcode::Pop, &[])])
            );
        }

        #[test]
        fn empty_function_bodies_return_null() {
            let bytecode = compile_source("func() { }");
            let Value::CompiledFunction(func) = &bytecode.constants[0] else {
                panic!("expected compiled function constant");
            };
            assert_eq!(func.instructions, concat(&[make(Opcode::Return, &[])]));
        }

        #[test]
        fn explicit_return_keeps_return_value() {
            let bytecode = compile_source("func() { return 99; }");
            let Value::CompiledFunction(func) = &bytecode.constants[1] else {
                panic!("expected compiled function constant");
            };
            assert_eq!(
                func.instructions,
                concat(&[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
        }

        #[test]
        fn function_locals_and_parameters() {
            let bytecode =
                compile_source("let f = func(a, b) { let c = a + b; c }; f(1, 2)");
            let Value::CompiledFunction(func) = &bytecode.constants[0] else {
                panic!("expected compiled function constant");
            };
            assert_eq!(func.num_parameters, 2);
            assert_eq!(func.num_locals, 3);
            assert_eq!(
                func.instructions,
                concat(&[
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::GetLocal, &[1]),
                    make(Opcode::Add, &[]),
                    make(Opcode::SetLocal, &[2]),
                    make(Opcode::GetLocal, &[2]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
            assert_eq!(
                bytecode.instructions,
                concat(&[
                    make(Opcode::Closure, &[0, 0]),
                    make(Opcode::SetGlobal, &[0]),
                    make(Opcode::GetGlobal, &[0]),
                    make(Opcode::Constant, &[1]),
                    make(Opcode::Constant, &[2]),
                    make(Opcode::Call, &[2]),
                    make(Opcode::Pop, &[]),
                ])
            );
        }

        #[test]
        fn closures_capture_free_variables() {
            let bytecode = compile_source("func(a) { func(b) { a + b } }");

            let Value::CompiledFunction(inner) = &bytecode.constants[0] else {
                panic!("expected inner compiled function");
            };
            assert_eq!(
                inner.instructions,
                concat(&[
                    make(Opcode::GetFree, &[0]),
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::Add, &[]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );

            let Value::CompiledFunction(outer) = &bytecode.constants[1] else {
                panic!("expected outer compiled function");
            };
            assert_eq!(
                outer.instructions,
                concat(&[
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::Closure, &[0, 1]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
        }

        #[test]
        fn deeply_nested_closures_capture_transitively() {
            let bytecode = compile_source("func(a) { func(b) { func(c) { a + b + c } } }");

            let Value::CompiledFunction(innermost) = &bytecode.constants[0] else {
                panic!("expected innermost compiled function");
            };
            assert_eq!(
                innermost.instructions,
                concat(&[
                    make(Opcode::GetFree, &[0]),
                    make(Opcode::GetFree, &[1]),
                    make(Opcode::Add, &[]),
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::Add, &[]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );

            let Value::CompiledFunction(middle) = &bytecode.constants[1] else {
                panic!("expected middle compiled function");
            };
            assert_eq!(
                middle.instructions,
                concat(&[
                    make(Opcode::GetFree, &[0]),
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::Closure, &[0, 2]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
        }

        #[test]
        fn recursive_functions_use_current_closure() {
            let bytecode =
                compile_source("let countDown = func(x) { countDown(x - 1); }; countDown(1);");
            let Value::CompiledFunction(func) = &bytecode.constants[1] else {
                panic!("expected compiled function constant");
            };
            assert_eq!(
                func.instructions,
                concat(&[
                    make(Opcode::CurrentClosure, &[]),
                    make(Opcode::GetLocal, &[0]),
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Sub, &[]),
                    make(Opcode::Call, &[1]),
                    make(Opcode::ReturnValue, &[]),
                ])
            );
        }

        #[test]
        fn builtins_compile_to_getbuiltin() {
            assert_instructions(
                "len([]); push([], 1);",
                &[
                    make(Opcode::GetBuiltin, &[0]),
                    make(Opcode::Array, &[0]),
                    make(Opcode::Call, &[1]),
                    make(Opcode::Pop, &[]),
                    make(Opcode::GetBuiltin, &[5]),
                    make(Opcode::Array, &[0]),
                    make(Opcode::Constant, &[0]),
                    make(Opcode::Call, &[2]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn postfix_compiles_to_load_plus_mutation() {
            assert_instructions(
                "let x = 1; x++;",
                &[
                    make(Opcode::Constant, &[0]),
                    make(Opcode::SetGlobal, &[0]),
                    make(Opcode::GetGlobal, &[0]),
                    make(Opcode::PlusPlus, &[]),
                    make(Opcode::Pop, &[]),
                ],
            );
        }

        #[test]
        fn postfix_rejects_free_variables() {
            let err = Compiler::new()
                .compile(&parse_program(
                    "func(a) { func() { a-- } }",
                ))
                .expect_err("expected compile error");
            assert!(matches!(err, CompileError::InvalidPostfixTarget { ref name, .. } if name == "a"));
        }

        #[test]
        fn compiler_scopes_restore_symbol_tables() {
            let mut compiler = Compiler::new();
            compiler.symbol_table.define("outer");

            compiler.enter_scope();
            compiler.emit(Opcode::Sub, &[]);
            assert_eq!(compiler.scopes.len(), 2);
            let inner = compiler.symbol_table.define("inner");
            assert_eq!(inner.scope, SymbolScope::Local);

            let (instructions, _, _) = compiler.leave_scope();
            assert_eq!(instructions.len(), 1);
            assert_eq!(compiler.scopes.len(), 1);
            let outer = compiler
                .symbol_table
                .resolve("outer")
                .expect("outer survives scope exit");
            assert_eq!(outer.scope, SymbolScope::Global);
            assert!(compiler.symbol_table.resolve("inner").is_none());
        }

        #[test]
        fn num_locals_is_at_least_num_parameters() {
            for source in [
                "func() { }",
                "func(a) { a }",
                "func(a, b) { let c = 1; a }",
                "func(a) { let b = a; let c = b; c }",
            ] {
                let bytecode = compile_source(source);
                let func = bytecode
                    .constants
                    .iter()
                    .find_map(|constant| match constant {
                        Value::CompiledFunction(func) => Some(func.clone()),
                        _ => None,
                    })
                    .expect("a compiled function constant");
                assert!(
                    func.num_locals >= func.num_parameters,
                    "source: {source}"
                );
            }
        }
    }

    mod vm {
        use super::*;

        #[test]
        fn integer_arithmetic() {
            assert_int("1", 1);
            assert_int("1 + 2", 3);
            assert_int("1 - 2", -1);
            assert_int("4 / 2", 2);
            assert_int("7 / 2", 3);
            assert_int("-7 / 2", -3);
            assert_int("17 % 5", 2);
            assert_int("-17 % 5", -2);
            assert_int("50 / 2 * 2 + 10 - 5", 55);
            assert_int("5 * (2 + 10)", 60);
            assert_int("-50 + 100 + -50", 0);
            assert_int("(5 + 10 * 2 + 15 / 3) * 2 + -10", 50);
        }

        #[test]
        fn integer_overflow_wraps() {
            assert_int("9223372036854775807 + 1", i64::MIN);
            assert_int("-9223372036854775807 - 2", i64::MAX);
        }

        #[test]
        fn boolean_expressions() {
            assert_bool("true", true);
            assert_bool("1 < 2", true);
            assert_bool("1 > 2", false);
            assert_bool("1 <= 2", true);
            assert_bool("2 <= 2", true);
            assert_bool("3 <= 2", false);
            assert_bool("2 >= 2", true);
            assert_bool("1 >= 2", false);
            assert_bool("1 == 1", true);
            assert_bool("1 != 1", false);
            assert_bool("true == true", true);
            assert_bool("false == false", true);
            assert_bool("true != false", true);
            assert_bool("(1 < 2) == true", true);
            assert_bool("!true", false);
            assert_bool("!!false", false);
            assert_bool("!5", false);
            assert_bool("!0", false);
        }

        #[test]
        fn logical_operators_coerce_both_sides() {
            assert_bool("1 && 2", true);
            assert_bool("0 && 2", false);
            assert_bool("1 || 0", true);
            assert_bool("0 || 0", false);
            assert_bool("\"\" && true", false);
            assert_bool("\"x\" && true", true);
            assert_bool("[] || {}", false);
            assert_bool("[1] || {}", true);
        }

        #[test]
        fn conditionals() {
            assert_int("if (true) { 10 }", 10);
            assert_int("if (true) { 10 } else { 20 }", 10);
            assert_int("if (false) { 10 } else { 20 }", 20);
            assert_int("if (1) { 10 }", 10);
            assert_int("if (0) { 10 }", 10);
            assert_int("if (1 < 2) { 10 }", 10);
            assert_eq!(run_source("if (1 > 2) { 10 }"), Value::Null);
            assert_eq!(run_source("if (false) { 10 }"), Value::Null);
            assert_int("if (if (false) { 10 }) { 10 } else { 20 }", 20);
            assert_bool("!(if (false) { 5 })", true);
        }

        #[test]
        fn global_let_statements() {
            assert_int("let one = 1; one", 1);
            assert_int("let one = 1; let two = 2; one + two", 3);
            assert_int("let one = 1; let two = one + one; one + two", 3);
            assert_int("const three = 3; three", 3);
        }

        #[test]
        fn string_expressions() {
            assert_eq!(run_source("\"tern\"").inspect(), "tern");
            assert_eq!(run_source("\"ter\" + \"n\"").inspect(), "tern");
            assert_eq!(
                run_source("\"sea\" + \"bird\" + \"s\"").inspect(),
                "seabirds"
            );
        }

        #[test]
        fn string_equality_is_by_reference() {
            assert_bool("\"a\" == \"a\"", false);
            assert_bool("\"a\" != \"a\"", true);
            assert_bool("let s = \"a\"; s == s", true);
            assert_bool("let a = [1, 2]; a == a", true);
            assert_bool("[1, 2] == [1, 2]", false);
        }

        #[test]
        fn array_literals_and_indexing() {
            assert_eq!(run_source("[]").inspect(), "[]");
            assert_eq!(run_source("[1, 2, 3]").inspect(), "[1, 2, 3]");
            assert_eq!(run_source("[1 + 2, 3 * 4, 5 + 6]").inspect(), "[3, 12, 11]");
            assert_int("[1, 2, 3][1]", 2);
            assert_int("[[1, 1, 1]][0][0]", 1);
            assert_eq!(run_source("[][0]"), Value::Null);
            assert_eq!(run_source("[1, 2, 3][99]"), Value::Null);
            assert_eq!(run_source("[1][-1]"), Value::Null);
        }

        #[test]
        fn hash_literals_and_indexing() {
            assert_eq!(run_source("{}").inspect(), "{}");
            assert_eq!(
                run_source("{1: 2, 2: 3}").inspect(),
                "{1: 2, 2: 3}"
            );
            assert_int("{1: 1, 2: 2}[1]", 1);
            assert_int("{1: 1, 2: 2}[2]", 2);
            assert_int("let h = {\"a\": 1, \"b\": 2 + 3}; h[\"b\"]", 5);
            assert_eq!(
                run_source("let h = {\"a\": 1, \"b\": 2 + 3}; h[\"missing\"]"),
                Value::Null
            );
            assert_eq!(run_source("{1: 1}[0]"), Value::Null);
            assert_eq!(run_source("{}[0]"), Value::Null);
            assert_int("{true: 5}[true]", 5);
        }

        #[test]
        fn calling_functions() {
            assert_int("let f = func() { 5 + 10; }; f();", 15);
            assert_int("let one = func() { 1; }; let two = func() { 2; }; one() + two()", 3);
            assert_int("let a = func() { 1 }; let b = func() { a() + 1 }; let c = func() { b() + 1 }; c();", 3);
            assert_int("let early = func() { return 99; 100; }; early();", 99);
            assert_eq!(run_source("let none = func() { }; none();"), Value::Null);
            assert_int("let id = func(a) { a; }; id(4);", 4);
            assert_int("let sum = func(a, b) { a + b; }; sum(1, 2);", 3);
            assert_int(
                "let sum = func(a, b) { let c = a + b; c; }; sum(1, 2) + sum(3, 4);",
                10,
            );
            assert_int(
                "let g = 10; let sum = func(a, b) { let c = a + b; c + g; }; sum(1, 2) + g;",
                23,
            );
            assert_int("func(){ 5 }() + func(){ 10 }()", 15);
        }

        #[test]
        fn first_class_functions() {
            assert_int(
                "let returnsOne = func() { 1; }; let wrap = func() { returnsOne; }; wrap()();",
                1,
            );
        }

        #[test]
        fn top_level_return_is_the_program_result() {
            assert_int("return 10;", 10);
            assert_int("return 2 * 5; 9;", 10);
            assert_eq!(run_source("return;"), Value::Null);
        }

        #[test]
        fn closures() {
            assert_int(
                "let newClosure = func(a) { func() { a; }; }; let closure = newClosure(99); closure();",
                99,
            );
            assert_int(
                "let newAdder = func(a, b) { func(c) { a + b + c }; }; let adder = newAdder(1, 2); adder(8);",
                11,
            );
            assert_int(
                "let newAdder = func(a, b) { let c = a + b; func(d) { c + d }; }; let adder = newAdder(1, 2); adder(8);",
                11,
            );
            assert_int(
                r#"
let newAdder = func(a, b) {
  let c = a + b;
  func(d) { let e = d + c; func(f) { e + f; }; };
};
newAdder(1, 2)(3)(8)
"#,
                14,
            );
            assert_int(
                r#"
let a = 1;
let newAdderOuter = func(b) {
  func(c) { func(d) { a + b + c + d }; };
};
newAdderOuter(2)(3)(4);
"#,
                10,
            );
        }

        #[test]
        fn recursive_closures() {
            assert_int(
                r#"
let countDown = func(x) {
  if (x == 0) { return 0 } else { countDown(x - 1) }
};
countDown(3)
"#,
                0,
            );
            assert_int(
                r#"
let wrapper = func() {
  let countDown = func(x) {
    if (x == 0) { return 0; } else { countDown(x - 1); }
  };
  countDown(1);
};
wrapper();
"#,
                0,
            );
            assert_int(
                r#"
let fibonacci = func(x) {
  if (x < 2) { x } else { fibonacci(x - 1) + fibonacci(x - 2) }
};
fibonacci(15)
"#,
                610,
            );
        }

        #[test]
        fn builtin_functions() {
            assert_int("len(\"\")", 0);
            assert_int("len(\"four\")", 4);
            assert_int("len([1, 2, 3])", 3);
            assert_int("len([1, 2, 3]) + len(\"abcd\")", 7);
            assert_int("first([1, 2, 3])", 1);
            assert_eq!(run_source("first([])"), Value::Null);
            assert_int("last([1, 2, 3])", 3);
            assert_eq!(run_source("rest([1, 2, 3])").inspect(), "[2, 3]");
            assert_eq!(run_source("push([], 1)").inspect(), "[1]");
            assert_eq!(run_source("pop([1, 2, 3])").inspect(), "[1, 2]");
            assert_eq!(run_source("pop([])"), Value::Null);
            assert_eq!(
                run_source("split(\"a,b,c\", \",\")").inspect(),
                "[a, b, c]"
            );
            assert_eq!(run_source("split(\"abc\", \"\")").inspect(), "[a, b, c]");
            assert_eq!(
                run_source("join(split(\"a,b,c\", \",\"), \"-\")").inspect(),
                "a-b-c"
            );
        }

        #[test]
        fn builtin_contract_violations_abort_the_run() {
            let err = run_error("len(1)");
            assert!(err.message.contains("Argument to `len` not supported"));
            let err = run_error("len(\"one\", \"two\")");
            assert!(err.message.contains("Wrong number of arguments"));
            let err = run_error("first(1)");
            assert!(err.message.contains("must be an Array"));
            let err = run_error("join([1], \",\")");
            assert!(err.message.contains("must be Strings"));
        }

        #[test]
        fn postfix_mutation() {
            assert_eq!(run_source("let x = 5; let y = x++; [x, y]").inspect(), "[6, 5]");
            assert_eq!(run_source("let x = 5; let y = x--; [x, y]").inspect(), "[4, 5]");
            assert_int("let x = 0; x++; x++; x++; x", 3);
            assert_int(
                "let bump = func() { let n = 1; n++; n }; bump()",
                2,
            );
            assert_int(
                "let f = func(n) { n++; n++; n }; f(40)",
                42,
            );
            let err = run_error("let s = \"a\"; s++;");
            assert!(err.message.contains("Unknown operator: STRING++"));
        }

        #[test]
        fn postfix_on_globals_inside_functions() {
            assert_int(
                "let x = 1; let bump = func() { x++; }; bump(); bump(); x",
                3,
            );
        }

        #[test]
        fn runtime_errors() {
            let err = run_error("5 + true;");
            assert!(err
                .message
                .contains("Unsupported types for binary operation: INTEGER BOOLEAN"));
            let err = run_error("-true");
            assert!(err.message.contains("Unsupported type for negation: BOOLEAN"));
            let err = run_error("\"a\" - \"b\"");
            assert!(err.message.contains("Unknown String operator: Sub"));
            let err = run_error("5 / 0");
            assert!(err.message.contains("division by zero"));
            let err = run_error("5 % 0");
            assert!(err.message.contains("division by zero"));
            let err = run_error("1(2)");
            assert!(err.message.contains("calling non-function: INTEGER"));
            let err = run_error("5[0]");
            assert!(err.message.contains("Index operator not supported: INTEGER"));
            let err = run_error("{func(){}: 1}");
            assert!(err.message.contains("Unusable as a hash key: CLOSURE"));
            let err = run_error("{}[[]]");
            assert!(err.message.contains("Unusable as a hash key: ARRAY"));
            let err = run_error("let f = func(a) { a }; f(1, 2)");
            assert!(err
                .message
                .contains("Wrong number of arguments. Got: 2, Expected: 1"));
        }

        #[test]
        fn unbounded_recursion_overflows_the_frame_stack() {
            let err = run_error("let loop = func() { loop() }; loop()");
            assert!(err.message.contains("stack overflow"));
        }

        #[test]
        fn globals_survive_across_runs_with_preserved_state() {
            let program1 = parse_program("let x = 40;");
            let program2 = parse_program("x + 2");

            let mut compiler = Compiler::new();
            let bytecode1 = compiler.compile(&program1).expect("compile first line");
            let (symbols, constants) = compiler.into_state();

            let mut vm = Vm::new(bytecode1);
            vm.run().expect("run first line");
            let globals = vm.into_globals();

            let mut compiler = Compiler::new_with_state(symbols, constants);
            let bytecode2 = compiler.compile(&program2).expect("compile second line");
            let mut vm = Vm::new_with_globals_state(bytecode2, globals);
            vm.run().expect("run second line");
            assert_eq!(vm.last_popped_stack_element(), Value::Int(42));
        }
    }
}
