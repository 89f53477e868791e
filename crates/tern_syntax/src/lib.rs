use std::fmt;

/// An identifier with the 1-based source line it was read from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Ident {
    pub name: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PrefixOp {
    Bang,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PostfixOp {
    Incr,
    Decr,
}

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixOp::Bang => write!(f, "!"),
            PrefixOp::Minus => write!(f, "-"),
        }
    }
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Mod => "%",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
            InfixOp::Le => "<=",
            InfixOp::Ge => ">=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
        };
        write!(f, "{op}")
    }
}

impl fmt::Display for PostfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostfixOp::Incr => write!(f, "++"),
            PostfixOp::Decr => write!(f, "--"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    Let {
        name: Ident,
        value: Expr,
        line: usize,
    },
    Const {
        name: Ident,
        value: Expr,
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
    Block(BlockStmt),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockStmt {
    pub stmts: Vec<Stmt>,
    pub line: usize,
}

/// A function literal. `name` is empty until a `let`/`const` binding names
/// the function during compilation; it exists only so the function body can
/// refer to itself.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionLit {
    pub params: Vec<Ident>,
    pub body: BlockStmt,
    pub name: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Ident(Ident),
    Int {
        value: i64,
        line: usize,
    },
    Str {
        value: String,
        line: usize,
    },
    Bool {
        value: bool,
        line: usize,
    },
    Array {
        elements: Vec<Expr>,
        line: usize,
    },
    Hash {
        pairs: Vec<(Expr, Expr)>,
        line: usize,
    },
    Prefix {
        op: PrefixOp,
        right: Box<Expr>,
        line: usize,
    },
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
        line: usize,
    },
    Postfix {
        name: Ident,
        op: PostfixOp,
        line: usize,
    },
    If {
        condition: Box<Expr>,
        consequence: BlockStmt,
        alternative: Option<BlockStmt>,
        line: usize,
    },
    Function(FunctionLit),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Ident(ident) => ident.line,
            Expr::Int { line, .. }
            | Expr::Str { line, .. }
            | Expr::Bool { line, .. }
            | Expr::Array { line, .. }
            | Expr::Hash { line, .. }
            | Expr::Prefix { line, .. }
            | Expr::Infix { line, .. }
            | Expr::Postfix { line, .. }
            | Expr::If { line, .. }
            | Expr::Call { line, .. }
            | Expr::Index { line, .. } => *line,
            Expr::Function(func) => func.line,
        }
    }
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Let { line, .. }
            | Stmt::Const { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Expr { line, .. } => *line,
            Stmt::Block(block) => block.line,
        }
    }
}

/// The root of every parsed program.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[impl fmt::Display]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

impl fmt::Display for BlockStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.stmts {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Let { name, value, .. } => write!(f, "let {name} = {value};"),
            Stmt::Const { name, value, .. } => write!(f, "const {name} = {value};"),
            Stmt::Return { value: Some(value), .. } => write!(f, "return {value};"),
            Stmt::Return { value: None, .. } => write!(f, "return;"),
            Stmt::Expr { expr, .. } => write!(f, "{expr}"),
            Stmt::Block(block) => write!(f, "{block}"),
        }
    }
}

impl fmt::Display for FunctionLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func")?;
        if let Some(name) = &self.name {
            write!(f, "<{name}>")?;
        }
        write!(f, "(")?;
        write_joined(f, &self.params)?;
        write!(f, ") {}", self.body)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(ident) => write!(f, "{ident}"),
            Expr::Int { value, .. } => write!(f, "{value}"),
            Expr::Str { value, .. } => write!(f, "{value}"),
            Expr::Bool { value, .. } => write!(f, "{value}"),
            Expr::Array { elements, .. } => {
                write!(f, "[")?;
                write_joined(f, elements)?;
                write!(f, "]")
            }
            Expr::Hash { pairs, .. } => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}:{value}")?;
                }
                write!(f, "}}")
            }
            Expr::Prefix { op, right, .. } => write!(f, "({op}{right})"),
            Expr::Infix { op, left, right, .. } => write!(f, "({left} {op} {right})"),
            Expr::Postfix { name, op, .. } => write!(f, "({name}{op})"),
            Expr::If {
                condition,
                consequence,
                alternative,
                ..
            } => {
                write!(f, "if{condition} {consequence}")?;
                if let Some(alternative) = alternative {
                    write!(f, "else {alternative}")?;
                }
                Ok(())
            }
            Expr::Function(func) => write!(f, "{func}"),
            Expr::Call { callee, args, .. } => {
                write!(f, "{callee}(")?;
                write_joined(f, args)?;
                write!(f, ")")
            }
            Expr::Index { left, index, .. } => write!(f, "({left}[{index}])"),
        }
    }
}
