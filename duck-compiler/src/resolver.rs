use std::collections::HashMap;

use anyhow::{bail, Result};
use log::trace;

use crate::error::ScriptError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Upvalue,
    Builtin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
    pub scope_depth: usize,
    pub is_captured: bool,
    pub is_struct: bool,
    pub arity: Option<usize>,
}

/// Where a closure finds a captured variable when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A local slot of the function that creates the closure.
    ParentLocal(usize),
    /// An upvalue of the function that creates the closure.
    ParentUpvalue(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Block,
    Function,
}

/// Frame shape of a function whose scope was just closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLayout {
    pub local_count: usize,
    pub captures: Vec<CaptureSource>,
}

#[derive(Clone, Default)]
struct FunctionScope {
    scopes: Vec<HashMap<String, Symbol>>,
    local_count: usize,
    captures: Vec<(Symbol, CaptureSource)>,
}

impl FunctionScope {
    fn with_scope() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            ..Self::default()
        }
    }

    fn lookup_local(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_capture(&self, name: &str) -> Option<&Symbol> {
        self.captures
            .iter()
            .map(|(symbol, _)| symbol)
            .find(|symbol| symbol.name == name)
    }
}

/// Lexical symbol table shared by every compile of one session.
///
/// Function 0 is the top level; bindings in its outermost scope are globals. Every other
/// binding gets a local slot that is unique within its function.
#[derive(Clone)]
pub struct SymbolTable {
    functions: Vec<FunctionScope>,
    builtins: HashMap<String, Symbol>,
    global_count: usize,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            functions: vec![FunctionScope::with_scope()],
            builtins: HashMap::new(),
            global_count: 0,
        }
    }

    /// Drops any scope left open by an aborted compile and restarts top-level local numbering.
    /// Globals and builtins survive.
    pub fn begin_module(&mut self) {
        self.functions.truncate(1);
        let top = &mut self.functions[0];
        top.scopes.truncate(1);
        top.local_count = 0;
        top.captures.clear();
    }

    pub fn global_count(&self) -> usize {
        self.global_count
    }

    pub fn builtin_count(&self) -> usize {
        self.builtins.len()
    }

    pub fn local_count(&self) -> usize {
        self.current_function().local_count
    }

    pub fn depth(&self) -> usize {
        self.functions
            .iter()
            .map(|function| function.scopes.len())
            .sum::<usize>()
            - 1
    }

    pub fn in_function(&self) -> bool {
        self.functions.len() > 1
    }

    fn is_global_scope(&self) -> bool {
        self.functions.len() == 1 && self.functions[0].scopes.len() == 1
    }

    fn current_function(&self) -> &FunctionScope {
        &self.functions[self.functions.len() - 1]
    }

    fn current_function_mut(&mut self) -> &mut FunctionScope {
        let last = self.functions.len() - 1;
        &mut self.functions[last]
    }

    pub fn define(&mut self, name: &str, is_struct: bool) -> Result<Symbol> {
        let depth = self.depth();
        let is_global = self.is_global_scope();

        let (scope, index) = if is_global {
            if self.functions[0].scopes[0].contains_key(name) {
                bail!(ScriptError::DuplicateDefinition { name: name.into() });
            }
            let index = self.global_count;
            self.global_count += 1;
            (SymbolScope::Global, index)
        } else {
            let function = self.current_function_mut();
            let contains = function
                .scopes
                .last()
                .map(|scope| scope.contains_key(name))
                .unwrap_or(false);
            if contains {
                bail!(ScriptError::DuplicateDefinition { name: name.into() });
            }
            let index = function.local_count;
            function.local_count += 1;
            (SymbolScope::Local, index)
        };

        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index,
            scope_depth: depth,
            is_captured: false,
            is_struct,
            arity: None,
        };
        trace!("define {} as {:?} {}", name, scope, index);
        if let Some(current) = self.current_function_mut().scopes.last_mut() {
            current.insert(name.to_string(), symbol.clone());
        }
        Ok(symbol)
    }

    pub fn define_builtin(&mut self, name: &str) -> Result<Symbol> {
        if self.builtins.contains_key(name) {
            bail!(ScriptError::DuplicateBuiltin { name: name.into() });
        }
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index: self.builtins.len(),
            scope_depth: 0,
            is_captured: false,
            is_struct: false,
            arity: None,
        };
        self.builtins.insert(name.to_string(), symbol.clone());
        Ok(symbol)
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        let current = self.functions.len() - 1;
        self.resolve_in(current, name)
    }

    fn resolve_in(&mut self, function_index: usize, name: &str) -> Option<Symbol> {
        let function = &self.functions[function_index];
        if let Some(symbol) = function.lookup_local(name) {
            return Some(symbol.clone());
        }
        if let Some(symbol) = function.lookup_capture(name) {
            return Some(symbol.clone());
        }
        if function_index == 0 {
            return self.builtins.get(name).cloned();
        }

        let outer = self.resolve_in(function_index - 1, name)?;
        let source = match outer.scope {
            SymbolScope::Global | SymbolScope::Builtin => return Some(outer),
            SymbolScope::Local => {
                self.mark_captured(function_index - 1, name);
                CaptureSource::ParentLocal(outer.index)
            }
            SymbolScope::Upvalue => CaptureSource::ParentUpvalue(outer.index),
        };

        let function = &mut self.functions[function_index];
        let alias = Symbol {
            scope: SymbolScope::Upvalue,
            index: function.captures.len(),
            is_captured: false,
            ..outer
        };
        trace!("capture {} as upvalue {} ({:?})", name, alias.index, source);
        function.captures.push((alias.clone(), source));
        Some(alias)
    }

    fn mark_captured(&mut self, function_index: usize, name: &str) {
        let function = &mut self.functions[function_index];
        if let Some(symbol) = function
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
        {
            symbol.is_captured = true;
        }
    }

    /// Records (or clears) the statically known arity of an already defined symbol.
    pub fn set_arity(&mut self, symbol: &Symbol, arity: Option<usize>) {
        for function in self.functions.iter_mut().rev() {
            let declared = function
                .scopes
                .iter_mut()
                .rev()
                .find_map(|scope| scope.get_mut(&symbol.name))
                .filter(|found| found.scope == symbol.scope && found.index == symbol.index);
            if let Some(found) = declared {
                found.arity = arity;
                return;
            }
            if let Some((found, _)) = function
                .captures
                .iter_mut()
                .find(|(found, _)| found.name == symbol.name)
            {
                found.arity = arity;
            }
        }
    }

    pub fn enter_scope(&mut self, kind: ScopeKind) {
        match kind {
            ScopeKind::Block => self.current_function_mut().scopes.push(HashMap::new()),
            ScopeKind::Function => self.functions.push(FunctionScope::with_scope()),
        }
    }

    /// Closes the innermost scope. Closing a function scope yields its frame layout.
    pub fn exit_scope(&mut self) -> Option<FunctionLayout> {
        let in_function = self.in_function();
        let function = self.current_function_mut();
        if function.scopes.len() > 1 {
            function.scopes.pop();
            return None;
        }
        if !in_function {
            return None;
        }

        let function = self.functions.pop()?;
        Some(FunctionLayout {
            local_count: function.local_count,
            captures: function
                .captures
                .into_iter()
                .map(|(_, source)| source)
                .collect(),
        })
    }
}
