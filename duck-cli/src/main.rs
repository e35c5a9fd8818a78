use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use duck_compiler::runtime::Vm;
use duck_compiler::{
    Compilation, CompileOptions, Compiler, Diagnostic, DiagnosticLevel, Diagnostics, ScriptError,
    SourceFile, SourceId,
};
use duck_support::{cli_error, cli_target_error};
use log::debug;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const REPL_AFTER_HELP: &str = "\
Without INPUT an interactive session starts. Inside it:
  clear    Forget every definition made so far.
  exit     Leave the session.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    Ast,
}

#[derive(Parser)]
#[command(
    name = "duck",
    version,
    about = "Run duck scripts.",
    after_help = REPL_AFTER_HELP
)]
struct Cli {
    /// Path to a duck source file.
    input: Option<PathBuf>,

    /// Dump the token stream produced by the lexer.
    #[arg(long)]
    dump_tokens: bool,

    /// Emit additional compiler output.
    #[arg(long, value_enum)]
    emit: Vec<Emit>,

    /// Print the bytecode listing of every compiled function.
    #[arg(long)]
    disassemble: bool,

    /// Skip executing the compiled program.
    #[arg(long)]
    no_run: bool,
}

impl Cli {
    fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            dump_tokens: self.dump_tokens,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    match &cli.input {
        Some(input) => run_file(&cli, input),
        None => run_repl(&cli),
    }
}

fn run_file(cli: &Cli, input: &Path) -> Result<()> {
    let contents = fs::read_to_string(input)
        .map_err(|err| anyhow!(cli_target_error("read", &input.display().to_string(), err)))?;

    let source = SourceFile::new(SourceId(0), input.to_path_buf(), contents);
    let mut compiler = Compiler::new(cli.compile_options());

    let compilation = match compiler.compile(&source) {
        Ok(compilation) => compilation,
        Err(err) => {
            report_diagnostics(&source, compiler.diagnostics());
            return Err(err.context("Compilation failed"));
        }
    };
    report_diagnostics(&source, compiler.diagnostics());
    emit_artifacts(cli, &compilation);

    if cli.no_run {
        return Ok(());
    }

    debug!("running {}", input.display());
    let mut vm = Vm::new(&compilation.program);
    vm.run()
        .with_context(|| format!("runtime error in {}", input.display()))
}

fn emit_artifacts(cli: &Cli, compilation: &Compilation) {
    if cli.emit.contains(&Emit::Ast) {
        println!("{:#?}", compilation.module);
    }
    if cli.disassemble {
        print!("{}", compilation.program.disassemble());
    }
}

fn run_repl(cli: &Cli) -> Result<()> {
    let mut editor = DefaultEditor::new().map_err(|err| anyhow!(cli_error("readline", err)))?;
    let mut compiler = Compiler::new(cli.compile_options());
    let mut vm: Option<Vm> = None;
    let mut next_id = 0;

    while let Some(input) = read_input(&mut editor) {
        match input.trim() {
            "" => continue,
            "exit" => break,
            "clear" => {
                compiler.reset();
                if let Some(vm) = vm.as_mut() {
                    vm.reset();
                }
                println!("Context cleared.");
                continue;
            }
            _ => {}
        }

        let source = SourceFile::anonymous(SourceId(next_id), input);
        next_id += 1;

        let compilation = match compiler.compile(&source) {
            Ok(compilation) => compilation,
            Err(err) => {
                report_diagnostics(&source, compiler.diagnostics());
                match compiler.diagnostics().first_error() {
                    Some(ScriptError::DuplicateDefinition { .. }) => {
                        eprintln!("hint: `clear` forgets every earlier definition");
                    }
                    Some(_) => {}
                    None => eprintln!("error: {err:#}"),
                }
                continue;
            }
        };
        report_diagnostics(&source, compiler.diagnostics());
        emit_artifacts(cli, &compilation);

        if cli.no_run {
            continue;
        }

        let machine = vm.get_or_insert_with(|| Vm::new(&compilation.program));
        machine.load(&compilation.program);
        if let Err(err) = machine.run() {
            eprintln!("runtime error: {err:#}");
        }
    }

    Ok(())
}

/// Reads one entry, continuing on `.. ` while braces or brackets are left open.
fn read_input(editor: &mut DefaultEditor) -> Option<String> {
    let mut input = match editor.readline(">> ") {
        Ok(line) => line,
        Err(ReadlineError::Interrupted) => return Some(String::new()),
        Err(ReadlineError::Eof) => return None,
        Err(err) => {
            eprintln!("{}", cli_error("readline", err));
            return None;
        }
    };

    while needs_continuation(&input) {
        match editor.readline(".. ") {
            Ok(line) => {
                input.push('\n');
                input.push_str(&line);
            }
            Err(ReadlineError::Interrupted) => return Some(String::new()),
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{}", cli_error("readline", err));
                return None;
            }
        }
    }

    if !input.trim().is_empty() {
        let _ = editor.add_history_entry(input.as_str());
    }
    Some(input)
}

fn needs_continuation(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for ch in input.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            _ => {}
        }
    }
    depth > 0
}

fn report_diagnostics(source: &SourceFile, diagnostics: &Diagnostics) {
    if diagnostics.is_empty() {
        return;
    }
    let lines: Vec<&str> = source.contents.lines().collect();
    for diagnostic in diagnostics.entries() {
        print_diagnostic(source, &lines, diagnostic);
    }
}

fn print_diagnostic(source: &SourceFile, lines: &[&str], diagnostic: &Diagnostic) {
    let level_marker = match diagnostic.level {
        DiagnosticLevel::Error => "  -",
        DiagnosticLevel::Warning => "  ~",
    };
    eprintln!("{} {}: {}", level_marker, diagnostic.label(), diagnostic.message);
    let Some(span) = diagnostic.span else {
        return;
    };
    eprintln!(
        "     --> {}:{}:{}",
        source.path.display(),
        span.line,
        span.column
    );

    let Some(raw_line) = lines.get(span.line.saturating_sub(1)) else {
        return;
    };
    let display_line = raw_line.replace('\t', "    ");
    eprintln!("      {}", display_line);

    let mut caret_line = String::from("      ");
    for ch in raw_line.chars().take(span.column.saturating_sub(1)) {
        match ch {
            '\t' => caret_line.push_str("    "),
            _ => caret_line.push(' '),
        }
    }

    let highlight_len = if span.end_line == span.line {
        span.end_column
            .saturating_sub(span.column)
            .saturating_add(1)
    } else {
        display_line
            .chars()
            .count()
            .saturating_sub(span.column.saturating_sub(1))
    };
    caret_line.push_str(&"^".repeat(highlight_len.max(1)));
    eprintln!("{}", caret_line);
}

#[cfg(test)]
mod tests {
    use super::needs_continuation;

    #[test]
    fn open_blocks_ask_for_more_input() {
        assert!(needs_continuation("var f = fn(x) {"));
        assert!(needs_continuation("var a = [1,"));
        assert!(!needs_continuation("var f = fn(x) { return x; };"));
        assert!(!needs_continuation(r#"println("{");"#));
    }
}
