// Integration tests for the Quill interpreter
//
// These tests run complete Quill programs through the compile-and-run
// pipeline and check captured print output. Covered here:
// - Arithmetic, strings, and printing
// - Variables, scoping, and control flow
// - Functions, closures, and captured state
// - Classes, initializers, inheritance, and super
// - Runtime errors and their reported messages
// - Garbage collector soundness under allocation stress

use quill::errors::InterpretError;
use quill::vm::{Vm, VmOptions};

fn run_code(source: &str) -> String {
    run_with_options(source, VmOptions::default())
}

fn run_with_options(source: &str, options: VmOptions) -> String {
    let mut vm = Vm::new(options);
    vm.capture_output();
    vm.interpret(source).expect("program should run without errors");
    vm.take_output()
}

fn runtime_error_message(source: &str) -> String {
    let mut vm = Vm::new(VmOptions::default());
    vm.capture_output();
    match vm.interpret(source) {
        Err(InterpretError::Runtime(report)) => report.message,
        other => panic!("expected a runtime error, got: {:?}", other),
    }
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run_code("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn test_string_concatenation() {
    assert_eq!(run_code("var a = \"Hel\"; var b = \"lo\"; print a + b;"), "Hello\n");
}

#[test]
fn test_closure_counter() {
    let source = "
        fun mk() {
            var x = 0;
            fun inc() {
                x = x + 1;
                return x;
            }
            return inc;
        }
        var c = mk();
        print c();
        print c();
        print c();
    ";
    assert_eq!(run_code(source), "1\n2\n3\n");
}

#[test]
fn test_closure_factories_are_independent() {
    let source = "
        fun mk() {
            var x = 0;
            fun inc() {
                x = x + 1;
                return x;
            }
            return inc;
        }
        var a = mk();
        var b = mk();
        print a();
        print b();
        print a();
        print a();
        print b();
    ";
    assert_eq!(run_code(source), "1\n1\n2\n3\n2\n");
}

#[test]
fn test_inheritance_and_super_call() {
    let source = "
        class A { greet() { print \"A\"; } }
        class B < A { greet() { super.greet(); print \"B\"; } }
        B().greet();
    ";
    assert_eq!(run_code(source), "A\nB\n");
}

#[test]
fn test_initializer_sets_fields() {
    assert_eq!(
        run_code("class P { init(n) { this.n = n; } } var p = P(7); print p.n;"),
        "7\n"
    );
}

#[test]
fn test_initializer_arity_is_enforced() {
    assert_eq!(
        runtime_error_message("class P { init(n) { this.n = n; } } var p = P();"),
        "Expected 1 arguments but got 0."
    );
}

#[test]
fn test_for_loop() {
    assert_eq!(run_code("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
}

#[test]
fn test_unassigned_variable_is_nil() {
    assert_eq!(run_code("var x; print x;"), "nil\n");
}

#[test]
fn test_undefined_variable_is_a_runtime_error() {
    assert_eq!(runtime_error_message("print y;"), "Undefined variable 'y'.");
}

#[test]
fn test_methods_inherited_without_override() {
    let source = "
        class Animal {
            speak() { return \"generic noise\"; }
        }
        class Dog < Animal {}
        print Dog().speak();
    ";
    assert_eq!(run_code(source), "generic noise\n");
}

#[test]
fn test_super_in_deep_hierarchy() {
    let source = "
        class A { describe() { return \"A\"; } }
        class B < A { describe() { return super.describe() + \"B\"; } }
        class C < B { describe() { return super.describe() + \"C\"; } }
        print C().describe();
    ";
    assert_eq!(run_code(source), "ABC\n");
}

#[test]
fn test_while_loop_with_mutation() {
    let source = "
        var total = 0;
        var i = 1;
        while (i <= 10) {
            total = total + i;
            i = i + 1;
        }
        print total;
    ";
    assert_eq!(run_code(source), "55\n");
}

#[test]
fn test_nested_closures_capture_through_levels() {
    let source = "
        fun outer() {
            var x = \"outer\";
            fun middle() {
                fun inner() {
                    return x;
                }
                return inner;
            }
            return middle;
        }
        print outer()()();
    ";
    assert_eq!(run_code(source), "outer\n");
}

#[test]
fn test_identical_stdout_across_runs() {
    let source = "
        class Counter {
            init() { this.count = 0; }
            bump() { this.count = this.count + 1; return this.count; }
        }
        var counter = Counter();
        for (var i = 0; i < 5; i = i + 1) print counter.bump();
    ";
    assert_eq!(run_code(source), run_code(source));
}

#[test]
fn test_gc_stress_does_not_change_output() {
    // Churns strings, instances, and closures so collections hit every
    // object kind while the program is mid-flight.
    let source = "
        fun compose(prefix) {
            fun render(suffix) { return prefix + suffix; }
            return render;
        }
        class Box {
            init(label) { this.label = label; }
            tag() { return \"[\" + this.label + \"]\"; }
        }
        var line = \"\";
        for (var i = 0; i < 60; i = i + 1) {
            var render = compose(\"item\");
            var box = Box(render(\"-x\"));
            line = line + \"#\";
            print box.tag();
        }
        print line;
    ";
    let plain = run_code(source);
    let stressed = run_with_options(
        source,
        VmOptions { gc_stress: true, ..Default::default() },
    );
    assert_eq!(plain, stressed);
}

#[test]
fn test_vm_state_is_clean_after_each_outcome() {
    let mut vm = Vm::new(VmOptions::default());
    vm.capture_output();

    vm.interpret("print \"ok\";").unwrap();
    assert!(vm.is_idle());

    assert!(vm.interpret("print 1 + nil;").is_err());
    assert!(vm.is_idle());

    // Still usable after the error unwound everything.
    vm.interpret("print \"still ok\";").unwrap();
    assert!(vm.is_idle());
    assert_eq!(vm.take_output(), "ok\nstill ok\n");
}

#[test]
fn test_interning_means_one_object_per_content() {
    let mut vm = Vm::new(VmOptions::default());
    let first = vm.intern("payload");
    let second = vm.intern("payload");
    assert_eq!(first, second);
}

#[test]
fn test_compile_errors_do_not_reach_the_vm() {
    let mut vm = Vm::new(VmOptions::default());
    vm.capture_output();
    match vm.interpret("print 1 +;") {
        Err(InterpretError::Compile(report)) => {
            assert!(!report.diagnostics.is_empty());
            assert!(report.diagnostics[0].contains("Expect expression."));
        }
        other => panic!("expected a compile error, got: {:?}", other),
    }
    assert!(vm.is_idle());
    assert_eq!(vm.take_output(), "");
}

#[test]
fn test_runtime_error_reports_call_stack() {
    let source = "\
fun crash() { return nil + 1; }
fun wrapper() { return crash(); }
wrapper();";
    let mut vm = Vm::new(VmOptions::default());
    vm.capture_output();
    let report = match vm.interpret(source) {
        Err(InterpretError::Runtime(report)) => report,
        other => panic!("expected a runtime error, got: {:?}", other),
    };
    let rendered = report.to_string();
    assert!(rendered.starts_with("Operands must be two numbers or two strings."));
    assert!(rendered.contains("[line 1] in crash()"));
    assert!(rendered.contains("[line 2] in wrapper()"));
    assert!(rendered.ends_with("[line 3] in script"));
}

#[test]
fn test_clock_is_available_and_numeric() {
    assert_eq!(run_code("print clock() >= 0;"), "true\n");
}
