// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for Quill. Evaluates one line at a
// time against a persistent interpreter: globals, classes, and interned
// strings survive across inputs. Line editing and history come from
// rustyline.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{Vm, VmOptions};

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(options: VmOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(options), editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Quill".bright_cyan().bold(),
            format!("v{} - interactive shell", env!("CARGO_PKG_VERSION")).bright_cyan()
        );
        println!("{}", "Ctrl+D to exit".bright_magenta());
    }

    /// Run the prompt loop until Ctrl-D. Errors are printed and the session
    /// continues; the VM resets its stacks, keeping only globals.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        loop {
            match self.editor.readline("> ") {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    if let Err(error) = self.vm.interpret(&line) {
                        eprintln!("{}", error);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl-C abandons the current line only.
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    break;
                }
                Err(error) => {
                    eprintln!("{} {}", "Error:".bright_red(), error);
                    break;
                }
            }
        }

        Ok(())
    }
}
