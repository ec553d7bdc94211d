//! Import discovery for a single Python source module
//!
//! Walks the module's AST and lists every import it can see, including
//! imports nested in functions, conditionals and `try` blocks. Each import is
//! classified as required (executed unconditionally when the module is
//! imported) or optional.

use ruff_python_ast::{
    CmpOp, ExceptHandler, Expr, ExprAttribute, ExprCall, ExprCompare, ExprName, Stmt, StmtIf,
    StmtImport, StmtImportFrom, StmtTry,
    visitor::{Visitor, walk_expr, walk_stmt},
};
use ruff_python_parser::{ParseError, parse_module};

/// How the import was spelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportForm {
    /// `import a.b.c`
    Import,
    /// `from a import b, c`
    From,
    /// `importlib.import_module("a")` or `__import__("a")`
    Dynamic,
}

/// An import discovered during AST traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportStatement {
    /// Module named by the statement, without leading dots
    pub module: Option<String>,
    /// Names listed after `import` in a from-import
    pub names: Vec<String>,
    /// Number of leading dots of a relative import
    pub level: u32,
    pub form: ImportForm,
    /// Not executed unconditionally at import time
    pub optional: bool,
}

impl ImportStatement {
    pub fn is_star(&self) -> bool {
        self.names.len() == 1 && self.names[0] == "*"
    }
}

/// Scope element affecting whether an import always runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeElement {
    Function,
    Class,
    If,
    While,
    For,
    With,
    Try,
    Match,
}

impl ScopeElement {
    /// Code in these scopes may never run when the module is imported
    const fn is_conditional(self) -> bool {
        !matches!(self, Self::Class | Self::With)
    }
}

/// Visitor collecting the imports of one module
#[derive(Debug, Default)]
pub struct ImportScanner {
    imports: Vec<ImportStatement>,
    scope_stack: Vec<ScopeElement>,
    in_type_checking: bool,
}

impl ImportScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_imports(self) -> Vec<ImportStatement> {
        self.imports
    }

    fn is_optional(&self) -> bool {
        self.in_type_checking || self.scope_stack.iter().any(|s| s.is_conditional())
    }

    fn with_scope<'a>(&mut self, scope: ScopeElement, stmt: &'a Stmt) {
        self.scope_stack.push(scope);
        walk_stmt(self, stmt);
        self.scope_stack.pop();
    }

    fn record_import(&mut self, stmt: &StmtImport) {
        let optional = self.is_optional();
        for alias in &stmt.names {
            self.imports.push(ImportStatement {
                module: Some(alias.name.to_string()),
                names: Vec::new(),
                level: 0,
                form: ImportForm::Import,
                optional,
            });
        }
    }

    fn record_import_from(&mut self, stmt: &StmtImportFrom) {
        let module = stmt.module.as_ref().map(ToString::to_string);
        if stmt.level == 0 && module.as_deref() == Some("__future__") {
            return;
        }
        self.imports.push(ImportStatement {
            module,
            names: stmt.names.iter().map(|alias| alias.name.to_string()).collect(),
            level: stmt.level,
            form: ImportForm::From,
            optional: self.is_optional(),
        });
    }

    /// `importlib.import_module("name")`, `import_module("name")` and
    /// `__import__("name")` with a literal argument
    fn record_dynamic_import(&mut self, call: &ExprCall) {
        let is_import_call = match call.func.as_ref() {
            Expr::Name(ExprName { id, .. }) => id == "__import__" || id == "import_module",
            Expr::Attribute(ExprAttribute { value, attr, .. }) => {
                attr.as_str() == "import_module"
                    && matches!(value.as_ref(), Expr::Name(ExprName { id, .. }) if id == "importlib")
            }
            _ => false,
        };
        if !is_import_call {
            return;
        }
        let Some(Expr::StringLiteral(literal)) = call.arguments.args.first() else {
            return;
        };
        let raw = literal.value.to_str();
        let level = raw.chars().take_while(|c| *c == '.').count();
        if level > 0 {
            // Relative dynamic imports depend on a runtime package argument
            log::trace!("Skipping relative dynamic import '{raw}'");
            return;
        }
        if raw.is_empty() {
            return;
        }
        self.imports.push(ImportStatement {
            module: Some(raw.to_owned()),
            names: Vec::new(),
            level: 0,
            form: ImportForm::Dynamic,
            optional: true,
        });
    }

    fn is_type_checking_condition(test: &Expr) -> bool {
        match test {
            Expr::Name(ExprName { id, .. }) => id == "TYPE_CHECKING",
            Expr::Attribute(ExprAttribute { attr, .. }) => attr.as_str() == "TYPE_CHECKING",
            _ => false,
        }
    }

    /// `__name__ == "__main__"`, either way round
    fn is_main_guard(test: &Expr) -> bool {
        let Expr::Compare(ExprCompare {
            left,
            ops,
            comparators,
            ..
        }) = test
        else {
            return false;
        };
        let is_name = |e: &Expr| matches!(e, Expr::Name(ExprName { id, .. }) if id == "__name__");
        let is_main = |e: &Expr| {
            matches!(e, Expr::StringLiteral(literal) if literal.value.to_str() == "__main__")
        };
        match (&**ops, &**comparators) {
            ([CmpOp::Eq], [right]) => {
                (is_name(left) && is_main(right)) || (is_main(left) && is_name(right))
            }
            _ => false,
        }
    }

    /// Exception types that swallow a failed import
    fn catches_import_error(handler: &ExceptHandler) -> bool {
        let ExceptHandler::ExceptHandler(handler) = handler;
        let Some(type_) = handler.type_.as_deref() else {
            return true;
        };
        let catches = |e: &Expr| {
            let name = match e {
                Expr::Name(ExprName { id, .. }) => id.as_str(),
                Expr::Attribute(ExprAttribute { attr, .. }) => attr.as_str(),
                _ => return false,
            };
            matches!(
                name,
                "ImportError" | "ModuleNotFoundError" | "Exception" | "BaseException"
            )
        };
        match type_ {
            Expr::Tuple(tuple) => tuple.elts.iter().any(catches),
            other => catches(other),
        }
    }

    fn visit_if<'a>(&mut self, if_stmt: &'a StmtIf, stmt: &'a Stmt) {
        if Self::is_main_guard(&if_stmt.test) {
            // The guarded body runs when the entry script starts
            self.visit_expr(&if_stmt.test);
            self.visit_body(&if_stmt.body);
            self.scope_stack.push(ScopeElement::If);
            for clause in &if_stmt.elif_else_clauses {
                if let Some(test) = &clause.test {
                    self.visit_expr(test);
                }
                self.visit_body(&clause.body);
            }
            self.scope_stack.pop();
            return;
        }

        let was_type_checking = self.in_type_checking;
        if Self::is_type_checking_condition(&if_stmt.test) {
            self.in_type_checking = true;
        }
        self.with_scope(ScopeElement::If, stmt);
        self.in_type_checking = was_type_checking;
    }

    /// Only a `try` that catches import failures makes its body optional;
    /// handlers never run unconditionally and `finally` always runs
    fn visit_try<'a>(&mut self, try_stmt: &'a StmtTry) {
        let guarded = try_stmt.handlers.iter().any(Self::catches_import_error);
        if guarded {
            self.scope_stack.push(ScopeElement::Try);
        }
        self.visit_body(&try_stmt.body);
        self.visit_body(&try_stmt.orelse);
        if guarded {
            self.scope_stack.pop();
        }

        self.scope_stack.push(ScopeElement::Try);
        for handler in &try_stmt.handlers {
            let ExceptHandler::ExceptHandler(handler) = handler;
            self.visit_body(&handler.body);
        }
        self.scope_stack.pop();

        self.visit_body(&try_stmt.finalbody);
    }
}

impl<'a> Visitor<'a> for ImportScanner {
    fn visit_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Import(import_stmt) => self.record_import(import_stmt),
            Stmt::ImportFrom(import_from) => self.record_import_from(import_from),
            Stmt::FunctionDef(_) => self.with_scope(ScopeElement::Function, stmt),
            Stmt::ClassDef(_) => self.with_scope(ScopeElement::Class, stmt),
            Stmt::If(if_stmt) => self.visit_if(if_stmt, stmt),
            Stmt::While(_) => self.with_scope(ScopeElement::While, stmt),
            Stmt::For(_) => self.with_scope(ScopeElement::For, stmt),
            Stmt::With(_) => self.with_scope(ScopeElement::With, stmt),
            Stmt::Try(try_stmt) => self.visit_try(try_stmt),
            Stmt::Match(_) => self.with_scope(ScopeElement::Match, stmt),
            _ => walk_stmt(self, stmt),
        }
    }

    fn visit_expr(&mut self, expr: &'a Expr) {
        if let Expr::Call(call) = expr {
            self.record_dynamic_import(call);
        }
        walk_expr(self, expr);
    }
}

/// Parse `source` and return its imports in source order
pub fn scan_imports(source: &str) -> Result<Vec<ImportStatement>, ParseError> {
    let parsed = parse_module(source)?;
    let mut scanner = ImportScanner::new();
    scanner.visit_body(&parsed.syntax().body);
    Ok(scanner.into_imports())
}
