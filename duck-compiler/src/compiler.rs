use anyhow::Result;
use log::debug;

use crate::ast::{Module, SourceSpan};
use crate::diagnostics::Diagnostics;
use crate::error::ScriptError;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::resolver::SymbolTable;
use crate::runtime::{Builtins, CodeGenerator, Program};
use crate::source::SourceFile;

#[derive(Debug, Default, Clone)]
pub struct CompileOptions {
    pub dump_tokens: bool,
}

pub struct Compilation {
    pub module: Module,
    pub program: Program,
}

/// Front door for turning source text into a runnable program.
///
/// Symbols survive between calls so that a REPL session can refer to earlier definitions.
pub struct Compiler {
    diagnostics: Diagnostics,
    options: CompileOptions,
    symbols: SymbolTable,
    builtins: Builtins,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self::with_builtins(options, &Builtins::standard())
    }

    pub fn with_builtins(options: CompileOptions, builtins: &Builtins) -> Self {
        let mut compiler = Self {
            diagnostics: Diagnostics::new(),
            options,
            symbols: SymbolTable::new(),
            builtins: builtins.clone(),
        };
        compiler.register_builtins();
        compiler
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    /// Forgets every definition made by earlier compilations.
    pub fn reset(&mut self) {
        self.symbols = SymbolTable::new();
        self.diagnostics.clear();
        self.register_builtins();
    }

    fn register_builtins(&mut self) {
        for name in self.builtins.names() {
            // Builtins guarantees unique names, so registration cannot clash.
            if let Err(err) = self.symbols.define_builtin(name) {
                if let Ok(error) = err.downcast::<ScriptError>() {
                    self.diagnostics.fail(error, None);
                }
            }
        }
    }

    pub fn compile(&mut self, source: &SourceFile) -> Result<Compilation> {
        self.diagnostics.clear();

        let mut lexer = Lexer::new(source)?;
        let tokens = match lexer.tokenize() {
            Ok(tokens) => tokens,
            Err(err) => {
                let message = err.to_string();
                let span = location_in(&message)
                    .map(|(line, column)| SourceSpan::single_point(line, column));
                return Err(self.diagnostics.fail(ScriptError::Syntax(message), span));
            }
        };

        if self.options.dump_tokens {
            for token in &tokens {
                println!("{token:?}");
            }
        }

        let mut parser = Parser::new(source, tokens);
        let module = match parser.parse() {
            Ok(module) => {
                self.diagnostics.extend(parser.into_diagnostics());
                module
            }
            Err(err) => {
                self.diagnostics.extend(parser.into_diagnostics());
                return Err(err);
            }
        };

        // A failed compile must not leave half of its definitions behind.
        let snapshot = self.symbols.clone();
        let mut generator = CodeGenerator::new(&mut self.symbols);
        let result = generator.compile_module(&module);
        self.diagnostics.extend(generator.into_diagnostics());
        let main = match result {
            Ok(main) => main,
            Err(err) => {
                self.symbols = snapshot;
                return Err(err);
            }
        };

        let program = Program::new(main, self.symbols.global_count(), self.builtins.clone());
        debug!(
            "compiled {}: {} statements, {} globals",
            source.path.display(),
            module.statements.len(),
            program.global_count
        );

        Ok(Compilation { module, program })
    }
}

/// Extracts "line N, column M" from a lexer message.
fn location_in(message: &str) -> Option<(usize, usize)> {
    let rest = &message[message.find("line ")? + "line ".len()..];
    let (line, rest) = rest.split_once(", column ")?;
    let column: String = rest.chars().take_while(char::is_ascii_digit).collect();
    Some((line.trim().parse().ok()?, column.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceId;

    #[test]
    fn lexer_errors_carry_their_location() {
        let mut compiler = Compiler::new(CompileOptions::default());
        let source = SourceFile::anonymous(SourceId(0), "var a = 1;\nvar b = $;");
        assert!(compiler.compile(&source).is_err());

        let diagnostic = &compiler.diagnostics().entries()[0];
        let span = diagnostic.span.expect("span");
        assert_eq!((span.line, span.column), (2, 9));
    }

    #[test]
    fn definitions_persist_until_reset() {
        let mut compiler = Compiler::new(CompileOptions::default());
        compiler
            .compile(&SourceFile::anonymous(SourceId(0), "var a = 1;"))
            .expect("first line");
        compiler
            .compile(&SourceFile::anonymous(SourceId(1), "a = a + 1;"))
            .expect("second line sees a");

        compiler.reset();
        let err = compiler
            .compile(&SourceFile::anonymous(SourceId(2), "print(a);"))
            .err()
            .expect("a is gone");
        assert_eq!(
            err.downcast_ref::<ScriptError>(),
            Some(&ScriptError::UndefinedVariable { name: "a".into() })
        );
    }

    #[test]
    fn failed_compiles_roll_back_their_definitions() {
        let mut compiler = Compiler::new(CompileOptions::default());
        let broken = SourceFile::anonymous(SourceId(0), "var x = 1;\nprintln(nope);");
        assert!(compiler.compile(&broken).is_err());
        assert_eq!(
            compiler.diagnostics().first_error(),
            Some(&ScriptError::UndefinedVariable {
                name: "nope".into()
            })
        );

        let retyped = compiler
            .compile(&SourceFile::anonymous(SourceId(1), "var x = 2;"))
            .expect("x was rolled back");
        assert_eq!(retyped.program.global_count, 1);
    }
}
