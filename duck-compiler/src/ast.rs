#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub line: usize,
    pub column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl SourceSpan {
    pub fn new(line: usize, column: usize, end_line: usize, end_column: usize) -> Self {
        Self {
            line,
            column,
            end_line,
            end_column,
        }
    }

    pub fn single_point(line: usize, column: usize) -> Self {
        Self::new(line, column, line, column)
    }

    pub fn union(a: &Self, b: &Self) -> Self {
        if a.line == 0 {
            return *b;
        }
        if b.line == 0 {
            return *a;
        }

        let (start_line, start_column) =
            if (a.line < b.line) || (a.line == b.line && a.column <= b.column) {
                (a.line, a.column)
            } else {
                (b.line, b.column)
            };

        let (end_line, end_column) = if (a.end_line > b.end_line)
            || (a.end_line == b.end_line && a.end_column >= b.end_column)
        {
            (a.end_line, a.end_column)
        } else {
            (b.end_line, b.end_column)
        };

        Self::new(start_line, start_column, end_line, end_column)
    }
}

impl Default for SourceSpan {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub statements: Vec<Statement>,
}

impl Module {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

#[derive(Debug, Clone)]
pub enum Statement {
    Var(VarStatement),
    Struct(StructStatement),
    Conditional(ConditionalStatement),
    Loop(LoopStatement),
    Return(ReturnStatement),
    Block(BlockStatement),
    Expression(ExpressionStatement),
}

impl Statement {
    pub fn span(&self) -> SourceSpan {
        match self {
            Statement::Var(var) => var.span,
            Statement::Struct(structure) => structure.span,
            Statement::Conditional(conditional) => conditional.span,
            Statement::Loop(loop_stmt) => loop_stmt.span,
            Statement::Return(ret) => ret.span,
            Statement::Block(block) => block.span,
            Statement::Expression(expr) => expr.expression.span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarStatement {
    pub name: String,
    pub span: SourceSpan,
    pub initializer: Option<Expression>,
}

/// `struct Name { field: default, other }`
#[derive(Debug, Clone)]
pub struct StructStatement {
    pub name: String,
    pub span: SourceSpan,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub span: SourceSpan,
    pub value: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct ConditionalStatement {
    pub span: SourceSpan,
    pub condition: Expression,
    pub consequent: Box<Statement>,
    pub alternative: Option<Box<Statement>>,
}

#[derive(Debug, Clone)]
pub struct LoopStatement {
    pub span: SourceSpan,
    pub condition: Expression,
    pub body: Box<Statement>,
}

#[derive(Debug, Clone)]
pub struct ReturnStatement {
    pub span: SourceSpan,
    pub expression: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct BlockStatement {
    pub span: SourceSpan,
    pub block: Block,
}

#[derive(Debug, Clone)]
pub struct ExpressionStatement {
    pub expression: Expression,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub name: String,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub enum Literal {
    Number(f64),
    String(String),
    Boolean(bool),
    Nil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Negative,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub span: SourceSpan,
    pub kind: ExpressionKind,
}

#[derive(Debug, Clone)]
pub enum ExpressionKind {
    Identifier(Identifier),
    Literal(Literal),
    Array(ArrayLiteral),
    Struct(StructLiteral),
    Unary(UnaryExpression),
    Binary(BinaryExpression),
    Call(CallExpression),
    Member(MemberExpression),
    Index(IndexExpression),
    Reference(Box<Expression>),
    Function(FunctionExpression),
    Assignment(AssignmentExpression),
    Grouping(Box<Expression>),
}

#[derive(Debug, Clone)]
pub struct ArrayLiteral {
    pub elements: Vec<Expression>,
}

/// Anonymous struct literal. Fields without a value start out nil.
#[derive(Debug, Clone)]
pub struct StructLiteral {
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone)]
pub struct UnaryExpression {
    pub operator: UnaryOperator,
    pub operand: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct BinaryExpression {
    pub operator: BinaryOperator,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct CallExpression {
    pub callee: Box<Expression>,
    pub arguments: Vec<Expression>,
}

#[derive(Debug, Clone)]
pub struct MemberExpression {
    pub object: Box<Expression>,
    pub property: String,
    pub property_span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct IndexExpression {
    pub object: Box<Expression>,
    pub index: Box<Expression>,
}

#[derive(Debug, Clone)]
pub struct FunctionExpression {
    pub parameters: Vec<Identifier>,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct AssignmentExpression {
    pub target: Box<Expression>,
    pub value: Box<Expression>,
}
